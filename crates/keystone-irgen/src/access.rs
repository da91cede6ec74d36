//! Metadata access functions
//!
//! Every nominal type with metadata gets an `Ma` function returning its
//! canonical metadata. The body depends on how the metadata comes to exist:
//!
//! - constant metadata is returned directly with no cache;
//! - generic metadata is uniqued per argument vector by the runtime;
//! - foreign metadata is uniqued by name, behind a lazy cache;
//! - metadata completed at run time is initialized under a once token,
//!   behind a lazy cache.
//!
//! Cached paths load the cache with a plain load and return it when
//! non-null: dereferences through the returned pointer are ordered by the
//! address dependency. Thread-sanitizer builds add an acquire fence after
//! the load since the tool does not model dependencies. New values are
//! published with a release store.

use crate::naming::DeclNames;
use crate::typeinfo::TypeInfo;
use keystone_abi::{AccessOp, CacheRef, TypeRecipe};
use keystone_ast::{DeclId, DeclKind};
use serde::Serialize;

/// How an access function obtains its metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessStrategy {
    Constant,
    Generic,
    Foreign,
    SingletonInit,
}

impl AccessStrategy {
    /// Whether the metadata object is complete in the image
    pub fn is_constant(self) -> bool {
        self == AccessStrategy::Constant
    }

    /// Whether the accessor reads and writes a lazy cache
    pub fn uses_cache(self) -> bool {
        matches!(self, AccessStrategy::Foreign | AccessStrategy::SingletonInit)
    }
}

/// Pick the strategy for a declaration
pub fn strategy(info: &TypeInfo<'_>, id: DeclId) -> AccessStrategy {
    let Some(decl) = info.program.get(id) else {
        return AccessStrategy::Constant;
    };
    if decl.is_generic() {
        return AccessStrategy::Generic;
    }
    if decl.foreign {
        return AccessStrategy::Foreign;
    }
    let needs_init = match decl.kind {
        DeclKind::Class => info.class_needs_initialization(id),
        DeclKind::Struct | DeclKind::Enum => info.value_needs_initialization(id),
        DeclKind::Protocol => false,
    };
    if needs_init {
        AccessStrategy::SingletonInit
    } else {
        AccessStrategy::Constant
    }
}

/// Options that change accessor bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessorOptions {
    pub tsan: bool,
    pub skip_redundant_stores: bool,
}

fn cached_prologue(ops: &mut Vec<AccessOp<String>>, cache: &str, options: AccessorOptions) {
    ops.push(AccessOp::LoadCache(CacheRef::Global(cache.to_string())));
    if options.tsan {
        ops.push(AccessOp::AcquireFence);
    }
    ops.push(AccessOp::ReturnIfNonNull);
}

/// Body of the access function
///
/// `initialize` is the op that completes the metadata for `SingletonInit`.
pub fn accessor_program(
    names: &DeclNames,
    strategy: AccessStrategy,
    options: AccessorOptions,
    initialize: Option<AccessOp<String>>,
) -> Vec<AccessOp<String>> {
    let metadata = TypeRecipe::Metadata(names.metadata());
    let cache = names.lazy_cache();
    let mut ops = Vec::new();
    match strategy {
        AccessStrategy::Constant => {
            ops.push(AccessOp::Materialize(metadata));
            ops.push(AccessOp::Return);
        }
        AccessStrategy::Generic => {
            ops.push(AccessOp::Instantiate(names.pattern()));
            ops.push(AccessOp::Return);
        }
        AccessStrategy::Foreign => {
            cached_prologue(&mut ops, &cache, options);
            ops.push(AccessOp::Materialize(metadata));
            ops.push(AccessOp::RegisterForeign);
            ops.push(AccessOp::StoreRelease(CacheRef::Global(cache)));
            ops.push(AccessOp::Return);
        }
        AccessStrategy::SingletonInit => {
            cached_prologue(&mut ops, &cache, options);
            ops.push(AccessOp::BeginOnce(names.once_token()));
            ops.push(AccessOp::Materialize(metadata));
            ops.push(initialize.unwrap_or(AccessOp::InitializeValue));
            ops.push(AccessOp::StoreRelease(CacheRef::Global(cache.clone())));
            ops.push(AccessOp::EndOnce);
            // Losers of the once race skip the region and reload the winner's store.
            ops.push(AccessOp::LoadCache(CacheRef::Global(cache.clone())));
            if !options.skip_redundant_stores {
                ops.push(AccessOp::StoreRelease(CacheRef::Global(cache)));
            }
            ops.push(AccessOp::Return);
        }
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_abi::{Arch, ObjectFormat, TargetAbi};
    use keystone_ast::{BuiltinType, NominalDecl, Program, Type};

    const PLAIN: AccessorOptions = AccessorOptions {
        tsan: false,
        skip_redundant_stores: true,
    };

    #[test]
    fn test_strategy_selection() {
        let mut program = Program::new();
        let point = program.add(NominalDecl::structure("Point", "main"));
        let boxed = program.add(NominalDecl::structure("Box", "main").with_generic_param("T", vec![]));
        let foreign = program.add(NominalDecl::class("NSThing", "Foundation").foreign());
        let objc = program.add(NominalDecl::class("Widget", "main").objc());
        let opaque = program.add(
            NominalDecl::structure("Opaque", "lib")
                .resilient()
                .with_field("x", Type::Builtin(BuiltinType::Int8)),
        );
        let holder = program.add(NominalDecl::structure("Holder", "main").with_field("o", Type::nominal(opaque)));
        let target = TargetAbi::lookup(Arch::X86_64, ObjectFormat::Elf);
        let info = TypeInfo::new(&program, "main", &target);
        assert_eq!(strategy(&info, point), AccessStrategy::Constant);
        assert_eq!(strategy(&info, boxed), AccessStrategy::Generic);
        assert_eq!(strategy(&info, foreign), AccessStrategy::Foreign);
        assert_eq!(strategy(&info, objc), AccessStrategy::SingletonInit);
        assert_eq!(strategy(&info, holder), AccessStrategy::SingletonInit);
        assert_eq!(strategy(&info, opaque), AccessStrategy::Constant);
    }

    #[test]
    fn test_constant_accessor_has_no_cache() {
        let names = DeclNames::new(&NominalDecl::structure("Point", "main"));
        let ops = accessor_program(&names, AccessStrategy::Constant, PLAIN, None);
        assert_eq!(
            ops,
            vec![
                AccessOp::Materialize(TypeRecipe::Metadata("$s4main5PointVN".to_string())),
                AccessOp::Return
            ]
        );
    }

    #[test]
    fn test_tsan_fence_follows_cache_load() {
        let names = DeclNames::new(&NominalDecl::class("NSThing", "Foundation"));
        let options = AccessorOptions {
            tsan: true,
            ..PLAIN
        };
        let ops = accessor_program(&names, AccessStrategy::Foreign, options, None);
        assert!(matches!(ops[0], AccessOp::LoadCache(CacheRef::Global(_))));
        assert_eq!(ops[1], AccessOp::AcquireFence);
        assert_eq!(ops[2], AccessOp::ReturnIfNonNull);
        assert!(ops.contains(&AccessOp::RegisterForeign));
        let plain = accessor_program(&names, AccessStrategy::Foreign, PLAIN, None);
        assert!(!plain.contains(&AccessOp::AcquireFence));
    }

    #[test]
    fn test_once_region_and_redundant_store() {
        let names = DeclNames::new(&NominalDecl::class("Widget", "main"));
        let ops = accessor_program(&names, AccessStrategy::SingletonInit, PLAIN, None);
        let begin = ops
            .iter()
            .position(|op| matches!(op, AccessOp::BeginOnce(_)))
            .unwrap();
        let end = ops.iter().position(|op| *op == AccessOp::EndOnce).unwrap();
        assert!(begin < end);
        let stores = |ops: &[AccessOp<String>]| {
            ops.iter()
                .filter(|op| matches!(op, AccessOp::StoreRelease(_)))
                .count()
        };
        assert_eq!(stores(&ops), 1);
        let options = AccessorOptions {
            skip_redundant_stores: false,
            ..PLAIN
        };
        let unoptimized = accessor_program(&names, AccessStrategy::SingletonInit, options, None);
        assert_eq!(stores(&unoptimized), 2);
    }
}

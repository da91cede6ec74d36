//! Field type accessors
//!
//! `MF` returns a vector with one metadata pointer per stored property (or
//! payload case), tagged with indirect and weak bits. The vector is computed
//! on first call and published with compare-and-swap; a caller that loses the
//! race frees its copy and returns the winner's.

use super::{define_program, define_zero_word};
use crate::context::CompilationContext;
use crate::error::IrGenResult;
use crate::naming::DeclNames;
use crate::recipe::type_recipe;
use crate::typeinfo::StoredField;
use keystone_abi::kind::field_type_flags;
use keystone_abi::{AccessOp, CacheRef};
use keystone_ast::{DeclId, DeclKind, Type};

fn field_flags(field: &StoredField) -> u8 {
    let mut flags = 0;
    if field.indirect {
        flags |= field_type_flags::INDIRECT;
    }
    if field.weak {
        flags |= field_type_flags::WEAK;
    }
    flags as u8
}

pub(super) fn emit_field_type_accessor(
    cx: &mut CompilationContext<'_>,
    id: DeclId,
) -> IrGenResult<()> {
    let decl = cx.decl(id)?;
    let names = DeclNames::new(decl);
    let fields = match decl.kind {
        DeclKind::Enum => cx.types().payload_cases(decl, &[]),
        _ => cx.types().stored_fields(decl, &[]),
    };

    let cache = if decl.is_generic() {
        let layout = cx.layout(id)?;
        CacheRef::MetadataSlot((layout.total_size - layout.address_point) as i32)
    } else {
        define_zero_word(cx, names.field_type_cache())?;
        CacheRef::Global(names.field_type_cache())
    };

    let mut ops = vec![AccessOp::LoadCache(cache.clone())];
    if cx.options.tsan {
        ops.push(AccessOp::AcquireFence);
    }
    ops.push(AccessOp::ReturnIfNonNull);
    ops.push(AccessOp::AllocateFieldTypes(fields.len() as u32));
    for (index, field) in fields.iter().enumerate() {
        let ty = field.ty.clone().unwrap_or(Type::Tuple(Vec::new()));
        ops.push(AccessOp::Materialize(type_recipe(cx, &ty, Some(id))?));
        ops.push(AccessOp::StoreFieldType {
            index: index as u32,
            flags: field_flags(field),
        });
    }
    ops.push(AccessOp::PublishFieldTypes(cache));
    ops.push(AccessOp::Return);
    define_program(cx, names.field_type_accessor(), &ops)
}

#[cfg(test)]
mod tests {
    use crate::context::{CompilationContext, CompileOptions};
    use crate::emit::emit_decl;
    use keystone_abi::kind::field_type_flags;
    use keystone_abi::opcode::decode_program;
    use keystone_abi::{AccessOp, CacheRef, TypeRecipe};
    use keystone_ast::{BuiltinType, NominalDecl, Program, Type};

    fn ops(program: &Program, options: CompileOptions, symbol: &str) -> Vec<AccessOp<u64>> {
        let mut cx = CompilationContext::new(program, "main", options).unwrap();
        for (id, _) in program.iter() {
            emit_decl(&mut cx, id).unwrap();
        }
        let (def, _) = cx.symbols.lookup(symbol).unwrap();
        decode_program(def.blob.bytes(), 0).unwrap()
    }

    #[test]
    fn test_weak_field_is_tagged() {
        let mut program = Program::new();
        let node = program.add(NominalDecl::class("Node", "main"));
        program.add(
            NominalDecl::class("Owner", "main")
                .with_field("count", Type::Builtin(BuiltinType::Int64))
                .with_weak_field("parent", Type::nominal(node)),
        );
        let ops = ops(&program, CompileOptions::default(), "$s4main5OwnerCMF");
        assert!(matches!(ops[0], AccessOp::LoadCache(CacheRef::Global(_))));
        assert_eq!(ops[1], AccessOp::ReturnIfNonNull);
        assert_eq!(ops[2], AccessOp::AllocateFieldTypes(2));
        assert_eq!(
            ops[6],
            AccessOp::StoreFieldType {
                index: 1,
                flags: field_type_flags::WEAK as u8
            }
        );
        assert!(matches!(ops[7], AccessOp::PublishFieldTypes(CacheRef::Global(_))));
    }

    #[test]
    fn test_generic_cache_lives_after_the_record() {
        let mut program = Program::new();
        program.add(
            NominalDecl::structure("Box", "main")
                .with_generic_param("T", vec![])
                .with_field("value", Type::GenericParam(0)),
        );
        let options = CompileOptions {
            tsan: true,
            ..CompileOptions::default()
        };
        let ops = ops(&program, options, "$s4main3BoxVMF");
        assert_eq!(ops[0], AccessOp::LoadCache(CacheRef::MetadataSlot(32)));
        assert_eq!(ops[1], AccessOp::AcquireFence);
        assert_eq!(ops[4], AccessOp::Materialize(TypeRecipe::GenericArgument(16)));
    }
}

//! Type references
//!
//! A type reference is a demangled type tree. The context interns each
//! distinct tree once and hands out a small integer handle; zero never names
//! a type, so C callers can use it as the failure value.

use crate::error::{MirrorError, MirrorResult};
use keystone_abi::{MangledType, NominalKind};
use rustc_hash::FxHashMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// Handle to an interned type reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeRefId(u64);

impl TypeRefId {
    pub fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

/// Interned type references of one context
#[derive(Default)]
pub struct TypeRefTable {
    types: Vec<Arc<MangledType>>,
    ids: FxHashMap<Arc<MangledType>, TypeRefId>,
}

impl TypeRefTable {
    pub fn intern(&mut self, ty: MangledType) -> TypeRefId {
        if let Some(id) = self.ids.get(&ty) {
            return *id;
        }
        let ty = Arc::new(ty);
        let id = TypeRefId(self.types.len() as u64 + 1);
        self.types.push(ty.clone());
        self.ids.insert(ty, id);
        id
    }

    pub fn get(&self, id: TypeRefId) -> MirrorResult<&Arc<MangledType>> {
        self.types
            .get(id.index())
            .ok_or(MirrorError::InvalidTypeRef(id.raw()))
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Replace generic parameters with `args`
pub fn substitute(ty: &MangledType, args: &[MangledType]) -> MirrorResult<MangledType> {
    let list = |items: &[MangledType]| -> MirrorResult<Vec<MangledType>> {
        items.iter().map(|item| substitute(item, args)).collect()
    };
    Ok(match ty {
        MangledType::GenericParam(index) => args
            .get(*index as usize)
            .cloned()
            .ok_or(MirrorError::UnboundGenericParam(*index))?,
        MangledType::Builtin(_) => ty.clone(),
        MangledType::Nominal {
            module,
            name,
            kind,
            args: inner,
        } => MangledType::Nominal {
            module: module.clone(),
            name: name.clone(),
            kind: *kind,
            args: list(inner)?,
        },
        MangledType::Tuple(elements) => MangledType::Tuple(list(elements)?),
        MangledType::Function { params, result } => MangledType::Function {
            params: list(params)?,
            result: Box::new(substitute(result, args)?),
        },
        MangledType::Existential(protocols) => MangledType::Existential(list(protocols)?),
        MangledType::Metatype(instance) => MangledType::Metatype(Box::new(substitute(instance, args)?)),
    })
}

/// Mangled name of a nominal type with its arguments stripped, the key of its
/// field descriptor
pub fn unbound_name(ty: &MangledType) -> Option<String> {
    match ty {
        MangledType::Nominal {
            module, name, kind, ..
        } => Some(MangledType::nominal(module.as_str(), name.as_str(), *kind).mangle()),
        _ => None,
    }
}

fn nominal_label(kind: NominalKind, bound: bool) -> &'static str {
    match (kind, bound) {
        (NominalKind::Struct, false) => "struct",
        (NominalKind::Struct, true) => "bound_generic_struct",
        (NominalKind::Class, false) => "class",
        (NominalKind::Class, true) => "bound_generic_class",
        (NominalKind::Enum, false) => "enum",
        (NominalKind::Enum, true) => "bound_generic_enum",
        (NominalKind::Protocol, _) => "protocol",
    }
}

/// Indented tree form of a type reference
pub fn dump_typeref(ty: &MangledType) -> String {
    let mut out = String::new();
    dump_into(&mut out, ty, 0);
    out
}

fn dump_into(out: &mut String, ty: &MangledType, depth: usize) {
    if depth > 0 {
        out.push('\n');
    }
    let _ = write!(out, "{:indent$}(", "", indent = depth * 2);
    let children: Vec<&MangledType> = match ty {
        MangledType::Builtin(_) => {
            let _ = write!(out, "builtin {}", ty);
            Vec::new()
        }
        MangledType::Nominal {
            module,
            name,
            kind,
            args,
        } => {
            let _ = write!(
                out,
                "{} {}.{}",
                nominal_label(*kind, !args.is_empty()),
                module,
                name
            );
            args.iter().collect()
        }
        MangledType::GenericParam(index) => {
            let _ = write!(out, "generic_type_parameter depth=0 index={}", index);
            Vec::new()
        }
        MangledType::Tuple(elements) => {
            out.push_str("tuple");
            elements.iter().collect()
        }
        MangledType::Function { params, result } => {
            out.push_str("function");
            params.iter().chain(std::iter::once(result.as_ref())).collect()
        }
        MangledType::Existential(protocols) => {
            out.push_str("protocol_composition");
            protocols.iter().collect()
        }
        MangledType::Metatype(instance) => {
            out.push_str("metatype");
            vec![instance.as_ref()]
        }
    };
    for child in children {
        dump_into(out, child, depth + 1);
    }
    out.push(')');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int32() -> MangledType {
        MangledType::Builtin("Bi32_".to_string())
    }

    fn boxed(args: Vec<MangledType>) -> MangledType {
        MangledType::Nominal {
            module: "main".to_string(),
            name: "Box".to_string(),
            kind: NominalKind::Struct,
            args,
        }
    }

    #[test]
    fn test_interning_is_stable() {
        let mut table = TypeRefTable::default();
        let a = table.intern(int32());
        let b = table.intern(boxed(vec![int32()]));
        assert_eq!(table.intern(int32()), a);
        assert_ne!(a, b);
        assert_eq!(a.raw(), 1);
        assert_eq!(table.len(), 2);
        assert!(TypeRefId::from_raw(0).is_none());
        assert!(matches!(
            table.get(TypeRefId(9)),
            Err(MirrorError::InvalidTypeRef(9))
        ));
    }

    #[test]
    fn test_substitution() {
        let generic = MangledType::Tuple(vec![MangledType::GenericParam(0), boxed(vec![MangledType::GenericParam(1)])]);
        let bound = substitute(&generic, &[int32(), MangledType::Existential(vec![])]).unwrap();
        assert_eq!(bound.to_string(), "(Builtin.Int32, main.Box<Any>)");
        assert!(matches!(
            substitute(&generic, &[int32()]),
            Err(MirrorError::UnboundGenericParam(1))
        ));
        assert_eq!(unbound_name(&boxed(vec![int32()])).unwrap(), "4main3BoxV");
    }

    #[test]
    fn test_dump_shape() {
        assert_eq!(
            dump_typeref(&boxed(vec![int32()])),
            "(bound_generic_struct main.Box\n  (builtin Builtin.Int32))"
        );
        assert_eq!(
            dump_typeref(&MangledType::Metatype(Box::new(MangledType::nominal(
                "main",
                "Point",
                NominalKind::Struct
            )))),
            "(metatype\n  (struct main.Point))"
        );
    }
}

//! Link entity naming
//!
//! Every artifact is named by mangling the declaration or type it belongs to
//! and appending the entity operator, so independent compilations of the same
//! declaration agree on names without coordination. Private helper symbols
//! (string pools, indirection cells) use a `.L` prefix and never leave the
//! image.

use crate::error::{IrGenError, IrGenResult};
use keystone_abi::{Entity, MangledType, NominalKind};
use keystone_ast::{BuiltinType, DeclId, DeclKind, NominalDecl, Program, Type};

/// Mangled builtin code
pub fn builtin_code(builtin: BuiltinType) -> &'static str {
    match builtin {
        BuiltinType::Bool => "Bi1_",
        BuiltinType::Int8 => "Bi8_",
        BuiltinType::Int16 => "Bi16_",
        BuiltinType::Int32 => "Bi32_",
        BuiltinType::Int64 => "Bi64_",
        BuiltinType::Word => "Bw",
        BuiltinType::Float32 => "Bf32_",
        BuiltinType::Float64 => "Bf64_",
        BuiltinType::RawPointer => "Bp",
        BuiltinType::NativeObject => "Bo",
        BuiltinType::UnknownObject => "BO",
    }
}

fn nominal_kind(kind: DeclKind) -> NominalKind {
    match kind {
        DeclKind::Struct => NominalKind::Struct,
        DeclKind::Enum => NominalKind::Enum,
        DeclKind::Class => NominalKind::Class,
        DeclKind::Protocol => NominalKind::Protocol,
    }
}

/// Unbound mangled type of a declaration
pub fn decl_type(decl: &NominalDecl) -> MangledType {
    MangledType::nominal(decl.module.clone(), decl.name.clone(), nominal_kind(decl.kind))
}

fn lookup(program: &Program, id: DeclId) -> IrGenResult<&NominalDecl> {
    program.get(id).ok_or(IrGenError::UnknownDecl(id.0))
}

/// Mangled form of a resolved type
///
/// Generic parameters keep their flat index in the enclosing declaration.
/// A protocol used as a type is the single-protocol existential.
pub fn mangled_type(program: &Program, ty: &Type) -> IrGenResult<MangledType> {
    let list = |items: &[Type]| -> IrGenResult<Vec<MangledType>> {
        items.iter().map(|t| mangled_type(program, t)).collect()
    };
    Ok(match ty {
        Type::Builtin(b) => MangledType::Builtin(builtin_code(*b).to_string()),
        Type::Nominal { decl, args } => {
            let d = lookup(program, *decl)?;
            if d.kind == DeclKind::Protocol {
                return Ok(MangledType::Existential(vec![decl_type(d)]));
            }
            match decl_type(d) {
                MangledType::Nominal {
                    module, name, kind, ..
                } => MangledType::Nominal {
                    module,
                    name,
                    kind,
                    args: list(args)?,
                },
                other => other,
            }
        }
        Type::GenericParam(index) => MangledType::GenericParam(*index),
        Type::Tuple(elements) => MangledType::Tuple(list(elements)?),
        Type::Function { params, result } => MangledType::Function {
            params: list(params)?,
            result: Box::new(mangled_type(program, result)?),
        },
        Type::Existential(protocols) => MangledType::Existential(
            protocols
                .iter()
                .map(|p| lookup(program, *p).map(decl_type))
                .collect::<IrGenResult<_>>()?,
        ),
        Type::Metatype(inner) => MangledType::Metatype(Box::new(mangled_type(program, inner)?)),
    })
}

/// Symbol names of one declaration's artifacts
#[derive(Debug, Clone)]
pub struct DeclNames {
    ty: MangledType,
}

impl DeclNames {
    pub fn new(decl: &NominalDecl) -> Self {
        Self { ty: decl_type(decl) }
    }

    pub fn ty(&self) -> &MangledType {
        &self.ty
    }

    pub fn metadata(&self) -> String {
        Entity::TypeMetadata(self.ty.clone()).mangle()
    }

    pub fn full_metadata(&self) -> String {
        Entity::FullTypeMetadata(self.ty.clone()).mangle()
    }

    pub fn accessor(&self) -> String {
        Entity::TypeMetadataAccessor(self.ty.clone()).mangle()
    }

    pub fn lazy_cache(&self) -> String {
        Entity::TypeMetadataLazyCache(self.ty.clone()).mangle()
    }

    pub fn once_token(&self) -> String {
        Entity::TypeMetadataOnceToken(self.ty.clone()).mangle()
    }

    pub fn pattern(&self) -> String {
        Entity::TypeMetadataPattern(self.ty.clone()).mangle()
    }

    pub fn instantiation_function(&self) -> String {
        Entity::TypeMetadataInstantiationFunction(self.ty.clone()).mangle()
    }

    pub fn metaclass(&self) -> String {
        Entity::Metaclass(self.ty.clone()).mangle()
    }

    pub fn descriptor(&self) -> String {
        Entity::NominalTypeDescriptor(self.ty.clone()).mangle()
    }

    pub fn protocol_descriptor(&self) -> String {
        Entity::ProtocolDescriptor(self.ty.clone()).mangle()
    }

    pub fn field_type_accessor(&self) -> String {
        Entity::FieldTypeAccessor(self.ty.clone()).mangle()
    }

    pub fn field_type_cache(&self) -> String {
        Entity::FieldTypeVectorCache(self.ty.clone()).mangle()
    }

    pub fn base_offset(&self) -> String {
        Entity::ClassMetadataBaseOffset(self.ty.clone()).mangle()
    }

    pub fn reflection_fields(&self) -> String {
        Entity::ReflectionFieldDescriptor(self.ty.clone()).mangle()
    }

    pub fn value_witnesses(&self) -> String {
        Entity::ValueWitnessTable(self.ty.clone()).mangle()
    }

    pub fn field_offset(&self, field: &str) -> String {
        Entity::FieldOffset(self.ty.clone(), field.to_string()).mangle()
    }

    pub fn method(&self, name: &str) -> String {
        Entity::Method(self.ty.clone(), name.to_string()).mangle()
    }

    pub fn witness_table(&self, protocol: &NominalDecl) -> String {
        Entity::ProtocolWitnessTable(self.ty.clone(), decl_type(protocol)).mangle()
    }

    pub fn associated_type_witness(&self, protocol: &NominalDecl, name: &str) -> String {
        Entity::AssociatedTypeWitness(self.ty.clone(), decl_type(protocol), name.to_string()).mangle()
    }

    pub fn reflection_associated_types(&self, protocol: &NominalDecl) -> String {
        Entity::ReflectionAssociatedTypes(self.ty.clone(), decl_type(protocol)).mangle()
    }
}

/// NUL-terminated C string in the data section
pub fn data_string(text: &str) -> String {
    format!(".Lstr.{}", text)
}

/// Mangled type name in the `typeref` section
pub fn typeref_string(mangled: &str) -> String {
    format!(".Ltyperef.{}", mangled)
}

/// Name in the `reflstr` section
pub fn reflection_string(text: &str) -> String {
    format!(".Lreflstr.{}", text)
}

/// Word holding the address of an external symbol
pub fn indirection_cell(symbol: &str) -> String {
    format!(".Lgot.{}", symbol)
}

/// Inherited protocol list of a protocol descriptor
pub fn inherited_protocols(protocol: &NominalDecl) -> String {
    format!(".Linherited.{}", decl_type(protocol).mangle())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_abi::demangle_symbol;

    #[test]
    fn test_names_are_deterministic() {
        let decl = NominalDecl::structure("Point", "main");
        let first = DeclNames::new(&decl);
        let second = DeclNames::new(&decl.clone());
        assert_eq!(first.accessor(), second.accessor());
        assert_eq!(first.accessor(), "$s4main5PointVMa");
        assert_eq!(first.metadata(), "$s4main5PointVN");
        assert_eq!(first.field_offset("x"), "$s4main5PointV1xWv");
    }

    #[test]
    fn test_mangled_type_of_bound_generic() {
        let mut program = Program::new();
        let pair = program.add(
            NominalDecl::structure("Pair", "main")
                .with_generic_param("T", vec![])
                .with_generic_param("U", vec![]),
        );
        let ty = Type::bound(
            pair,
            vec![
                Type::Builtin(BuiltinType::Int32),
                Type::Tuple(vec![Type::GenericParam(0)]),
            ],
        );
        let mangled = mangled_type(&program, &ty).unwrap();
        assert_eq!(mangled.to_string(), "main.Pair<Builtin.Int32, (τ_0_0)>");
        let symbol = Entity::TypeMetadataAccessor(mangled.clone()).mangle();
        assert_eq!(
            demangle_symbol(&symbol).unwrap(),
            Entity::TypeMetadataAccessor(mangled)
        );
    }

    #[test]
    fn test_protocol_as_type_is_existential() {
        let mut program = Program::new();
        let proto = program.add(NominalDecl::protocol("Shape", "geo"));
        let ty = mangled_type(&program, &Type::nominal(proto)).unwrap();
        assert_eq!(ty.to_string(), "any geo.Shape");
        assert!(mangled_type(&program, &Type::nominal(DeclId(9))).is_err());
    }
}

//! Type lowering
//!
//! Turns a type reference into the storage facts a debugger needs: size,
//! alignment, stride, and the name, offset and type of every stored child.
//! Everything comes from the registered reflection records and the shared
//! layout rules; the target's metadata is never consulted here.

use crate::error::{MirrorError, MirrorResult};
use crate::registry::{FieldDescriptor, TypeRegistry};
use crate::typeref::{substitute, unbound_name};
use keystone_abi::kind::field_record_flags;
use keystone_abi::value::{
    builtin_layout, existential_layout, function_layout, layout_enum, layout_instance,
    layout_record, metatype_layout, EXISTENTIAL_BUFFER_WORDS,
};
use keystone_abi::{demangle_type, EnumStrategy, FieldDescriptorKind, MangledType, NominalKind, ValueLayout};
use rustc_hash::FxHashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::trace;

/// Lowest address a valid pointer can hold; smaller values are extra
/// inhabitants of pointer-like types
pub const LEAST_VALID_POINTER: u64 = 4096;

/// Deepest type nesting lowering will follow
pub const MAX_DEPTH: usize = 64;

/// Storage shape of a lowered type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LayoutKind {
    Unknown = 0,
    Builtin,
    RawPointer,
    Tuple,
    Struct,
    NoPayloadEnum,
    SinglePayloadEnum,
    MultiPayloadEnum,
    ThickFunction,
    OpaqueExistential,
    ClassExistential,
    ErrorExistential,
    ExistentialMetatype,
    ClassInstance,
    ClosureContext,
    StrongReference,
    UnownedReference,
    WeakReference,
    UnmanagedReference,
}

impl LayoutKind {
    fn label(self) -> &'static str {
        match self {
            LayoutKind::Unknown => "unknown",
            LayoutKind::Builtin => "builtin",
            LayoutKind::RawPointer => "raw_pointer",
            LayoutKind::Tuple => "tuple",
            LayoutKind::Struct => "struct",
            LayoutKind::NoPayloadEnum => "no_payload_enum",
            LayoutKind::SinglePayloadEnum => "single_payload_enum",
            LayoutKind::MultiPayloadEnum => "multi_payload_enum",
            LayoutKind::ThickFunction => "thick_function",
            LayoutKind::OpaqueExistential => "opaque_existential",
            LayoutKind::ClassExistential => "class_existential",
            LayoutKind::ErrorExistential => "error_existential",
            LayoutKind::ExistentialMetatype => "existential_metatype",
            LayoutKind::ClassInstance => "class_instance",
            LayoutKind::ClosureContext => "closure_context",
            LayoutKind::StrongReference => "strong_reference",
            LayoutKind::UnownedReference => "unowned_reference",
            LayoutKind::WeakReference => "weak_reference",
            LayoutKind::UnmanagedReference => "unmanaged_reference",
        }
    }
}

/// One stored child of a lowered type
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub offset: u64,
    pub typeref: MangledType,
    pub info: Arc<TypeInfo>,
}

/// A lowered type
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub kind: LayoutKind,
    pub layout: ValueLayout,
    pub fields: Vec<FieldInfo>,
}

impl TypeInfo {
    fn leaf(kind: LayoutKind, layout: ValueLayout) -> Self {
        Self {
            kind,
            layout,
            fields: Vec::new(),
        }
    }

    /// Indented tree form
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut String, depth: usize) {
        let _ = write!(
            out,
            "{:indent$}({} size={} alignment={} stride={} num_extra_inhabitants={} bitwise_takable={}",
            "",
            self.kind.label(),
            self.layout.size,
            self.layout.align,
            self.layout.stride,
            self.layout.extra_inhabitants,
            self.layout.bitwise_takable as u8,
            indent = depth * 2
        );
        for field in &self.fields {
            let _ = write!(
                out,
                "\n{:indent$}(field name={} offset={}\n",
                "",
                field.name,
                field.offset,
                indent = (depth + 1) * 2
            );
            field.info.dump_into(out, depth + 2);
            out.push(')');
        }
        out.push(')');
    }
}

fn reference(kind: LayoutKind, pointer_size: u8) -> Arc<TypeInfo> {
    Arc::new(TypeInfo::leaf(
        kind,
        ValueLayout::reference(pointer_size, LEAST_VALID_POINTER),
    ))
}

fn raw_pointer(pointer_size: u8) -> Arc<TypeInfo> {
    let layout = builtin_layout("Bp", pointer_size, LEAST_VALID_POINTER)
        .unwrap_or_else(|| ValueLayout::scalar(pointer_size as u64, 0));
    Arc::new(TypeInfo::leaf(LayoutKind::RawPointer, layout))
}

/// Lowers type references using a context's registered records
pub struct TypeConverter {
    pointer_size: u8,
    values: FxHashMap<MangledType, Arc<TypeInfo>>,
    instances: FxHashMap<MangledType, Arc<TypeInfo>>,
}

impl TypeConverter {
    pub fn new(pointer_size: u8) -> Self {
        Self {
            pointer_size,
            values: FxHashMap::default(),
            instances: FxHashMap::default(),
        }
    }

    /// Forget cached results, after new records are registered
    pub fn clear(&mut self) {
        self.values.clear();
        self.instances.clear();
    }

    /// Lowering of a value of type `ty`, as stored in a field
    pub fn type_info(&mut self, registry: &TypeRegistry, ty: &MangledType) -> MirrorResult<Arc<TypeInfo>> {
        self.value_at(registry, ty, 0)
    }

    /// Lowering of the heap instance of a class type
    pub fn instance_info(&mut self, registry: &TypeRegistry, ty: &MangledType) -> MirrorResult<Arc<TypeInfo>> {
        self.instance_at(registry, ty, 0)
    }

    fn descriptor(&self, registry: &TypeRegistry, ty: &MangledType) -> MirrorResult<Arc<FieldDescriptor>> {
        let name = unbound_name(ty).ok_or_else(|| MirrorError::NotLowerable(ty.to_string()))?;
        registry
            .field_descriptor(&name)
            .ok_or(MirrorError::MissingFieldDescriptor(name))
    }

    fn value_at(&mut self, registry: &TypeRegistry, ty: &MangledType, depth: usize) -> MirrorResult<Arc<TypeInfo>> {
        if depth > MAX_DEPTH {
            return Err(MirrorError::TooDeep(MAX_DEPTH));
        }
        if let Some(info) = self.values.get(ty) {
            return Ok(info.clone());
        }
        let info = Arc::new(self.lower(registry, ty, depth)?);
        trace!(ty = %ty, kind = ?info.kind, size = info.layout.size, "lowered type");
        self.values.insert(ty.clone(), info.clone());
        Ok(info)
    }

    fn lower(&mut self, registry: &TypeRegistry, ty: &MangledType, depth: usize) -> MirrorResult<TypeInfo> {
        let ps = self.pointer_size;
        match ty {
            MangledType::Builtin(code) => self.builtin(registry, code),
            MangledType::GenericParam(index) => Err(MirrorError::UnboundGenericParam(*index)),
            MangledType::Nominal { kind, args, .. } => match kind {
                NominalKind::Struct => self.structure(registry, ty, args, depth),
                NominalKind::Enum => self.enumeration(registry, ty, args, depth),
                NominalKind::Class => Ok(TypeInfo::leaf(
                    LayoutKind::StrongReference,
                    ValueLayout::reference(ps, LEAST_VALID_POINTER),
                )),
                NominalKind::Protocol => self.existential(registry, std::slice::from_ref(ty)),
            },
            MangledType::Tuple(elements) => {
                let infos = elements
                    .iter()
                    .map(|element| self.value_at(registry, element, depth + 1))
                    .collect::<MirrorResult<Vec<_>>>()?;
                let layouts: Vec<ValueLayout> = infos.iter().map(|info| info.layout).collect();
                let record = layout_record(&layouts);
                let fields = infos
                    .into_iter()
                    .zip(elements)
                    .zip(&record.offsets)
                    .enumerate()
                    .map(|(index, ((info, element), offset))| FieldInfo {
                        name: index.to_string(),
                        offset: *offset,
                        typeref: element.clone(),
                        info,
                    })
                    .collect();
                Ok(TypeInfo {
                    kind: LayoutKind::Tuple,
                    layout: record.layout,
                    fields,
                })
            }
            MangledType::Function { .. } => Ok(TypeInfo {
                kind: LayoutKind::ThickFunction,
                layout: function_layout(ps, LEAST_VALID_POINTER),
                fields: vec![
                    FieldInfo {
                        name: "function".to_string(),
                        offset: 0,
                        typeref: MangledType::Builtin("Bp".to_string()),
                        info: raw_pointer(ps),
                    },
                    FieldInfo {
                        name: "context".to_string(),
                        offset: ps as u64,
                        typeref: MangledType::Builtin("Bo".to_string()),
                        info: reference(LayoutKind::StrongReference, ps),
                    },
                ],
            }),
            MangledType::Existential(protocols) => self.existential(registry, protocols),
            MangledType::Metatype(instance) => match instance.as_ref() {
                MangledType::Existential(protocols) => {
                    let word = ps as u64;
                    let size = (1 + protocols.len() as u64) * word;
                    Ok(TypeInfo::leaf(
                        LayoutKind::ExistentialMetatype,
                        ValueLayout {
                            size,
                            align: word,
                            stride: size,
                            ..metatype_layout(ps, LEAST_VALID_POINTER)
                        },
                    ))
                }
                _ => Ok(TypeInfo::leaf(
                    LayoutKind::Builtin,
                    metatype_layout(ps, LEAST_VALID_POINTER),
                )),
            },
        }
    }

    fn builtin(&self, registry: &TypeRegistry, code: &str) -> MirrorResult<TypeInfo> {
        let ps = self.pointer_size;
        let layout = registry
            .builtin(code)
            .or_else(|| builtin_layout(code, ps, LEAST_VALID_POINTER))
            .ok_or_else(|| MirrorError::UnknownBuiltin(code.to_string()))?;
        Ok(match code {
            "Bp" => TypeInfo::leaf(LayoutKind::RawPointer, layout),
            "Bo" | "BO" => TypeInfo::leaf(
                LayoutKind::StrongReference,
                ValueLayout {
                    pod: false,
                    ..layout
                },
            ),
            _ => TypeInfo::leaf(LayoutKind::Builtin, layout),
        })
    }

    /// Lowering of one stored field, honoring its storage flags
    fn stored(
        &mut self,
        registry: &TypeRegistry,
        flags: u32,
        ty: &MangledType,
        depth: usize,
    ) -> MirrorResult<Arc<TypeInfo>> {
        if flags & field_record_flags::IS_WEAK != 0 {
            return Ok(reference(LayoutKind::WeakReference, self.pointer_size));
        }
        if flags & field_record_flags::IS_INDIRECT_CASE != 0 {
            return Ok(reference(LayoutKind::StrongReference, self.pointer_size));
        }
        self.value_at(registry, ty, depth + 1)
    }

    /// Field types of a nominal type, bound to `args`
    fn bound_fields(
        descriptor: &FieldDescriptor,
        args: &[MangledType],
    ) -> MirrorResult<Vec<(String, u32, Option<MangledType>)>> {
        descriptor
            .fields
            .iter()
            .map(|field| {
                let ty = match &field.mangled_type {
                    Some(mangled) => Some(substitute(&demangle_type(mangled)?, args)?),
                    None => None,
                };
                Ok((field.name.clone(), field.flags, ty))
            })
            .collect()
    }

    fn structure(
        &mut self,
        registry: &TypeRegistry,
        ty: &MangledType,
        args: &[MangledType],
        depth: usize,
    ) -> MirrorResult<TypeInfo> {
        let descriptor = self.descriptor(registry, ty)?;
        if descriptor.kind != FieldDescriptorKind::Struct {
            return Err(MirrorError::NotLowerable(ty.to_string()));
        }
        let mut fields = Vec::with_capacity(descriptor.fields.len());
        for (name, flags, field_ty) in Self::bound_fields(&descriptor, args)? {
            let field_ty = field_ty.ok_or_else(|| MirrorError::NotLowerable(ty.to_string()))?;
            let info = self.stored(registry, flags, &field_ty, depth)?;
            fields.push((name, field_ty, info));
        }
        let layouts: Vec<ValueLayout> = fields.iter().map(|(_, _, info)| info.layout).collect();
        let record = layout_record(&layouts);
        Ok(TypeInfo {
            kind: LayoutKind::Struct,
            layout: record.layout,
            fields: fields
                .into_iter()
                .zip(record.offsets)
                .map(|((name, typeref, info), offset)| FieldInfo {
                    name,
                    offset,
                    typeref,
                    info,
                })
                .collect(),
        })
    }

    fn enumeration(
        &mut self,
        registry: &TypeRegistry,
        ty: &MangledType,
        args: &[MangledType],
        depth: usize,
    ) -> MirrorResult<TypeInfo> {
        let descriptor = self.descriptor(registry, ty)?;
        if !matches!(
            descriptor.kind,
            FieldDescriptorKind::Enum | FieldDescriptorKind::MultiPayloadEnum
        ) {
            return Err(MirrorError::NotLowerable(ty.to_string()));
        }
        let empty_tuple = MangledType::Tuple(Vec::new());
        let mut payloads = Vec::new();
        let mut empty_cases = 0u64;
        let mut fields = Vec::with_capacity(descriptor.fields.len());
        for (name, flags, case_ty) in Self::bound_fields(&descriptor, args)? {
            let (typeref, info) = match case_ty {
                Some(case_ty) => {
                    let info = self.stored(registry, flags, &case_ty, depth)?;
                    payloads.push(info.layout);
                    (case_ty, info)
                }
                None => {
                    empty_cases += 1;
                    let info = self.value_at(registry, &empty_tuple, depth + 1)?;
                    (empty_tuple.clone(), info)
                }
            };
            fields.push(FieldInfo {
                name,
                offset: 0,
                typeref,
                info,
            });
        }
        let layout = layout_enum(&payloads, empty_cases);
        let kind = match layout.strategy {
            EnumStrategy::NoPayload => LayoutKind::NoPayloadEnum,
            EnumStrategy::SinglePayload => LayoutKind::SinglePayloadEnum,
            EnumStrategy::MultiPayload => LayoutKind::MultiPayloadEnum,
        };
        Ok(TypeInfo {
            kind,
            layout: layout.layout,
            fields,
        })
    }

    fn existential(&mut self, registry: &TypeRegistry, protocols: &[MangledType]) -> MirrorResult<TypeInfo> {
        let ps = self.pointer_size;
        let word = ps as u64;
        let mut class_bound = false;
        for protocol in protocols {
            let descriptor = self.descriptor(registry, protocol)?;
            match descriptor.kind {
                FieldDescriptorKind::ClassProtocol => class_bound = true,
                FieldDescriptorKind::Protocol | FieldDescriptorKind::ObjCProtocol => {}
                _ => return Err(MirrorError::NotLowerable(protocol.to_string())),
            }
        }
        let count = protocols.len() as u64;
        let layout = existential_layout(ps, class_bound, count, LEAST_VALID_POINTER);
        let mut fields = Vec::with_capacity(protocols.len() + 1);
        let first_table = if class_bound {
            fields.push(FieldInfo {
                name: "object".to_string(),
                offset: 0,
                typeref: MangledType::Builtin("Bo".to_string()),
                info: reference(LayoutKind::StrongReference, ps),
            });
            1
        } else {
            fields.push(FieldInfo {
                name: "metadata".to_string(),
                offset: EXISTENTIAL_BUFFER_WORDS * word,
                typeref: MangledType::Metatype(Box::new(MangledType::Existential(Vec::new()))),
                info: Arc::new(TypeInfo::leaf(
                    LayoutKind::Builtin,
                    metatype_layout(ps, LEAST_VALID_POINTER),
                )),
            });
            EXISTENTIAL_BUFFER_WORDS + 1
        };
        for index in 0..count {
            fields.push(FieldInfo {
                name: "wtable".to_string(),
                offset: (first_table + index) * word,
                typeref: MangledType::Builtin("Bp".to_string()),
                info: raw_pointer(ps),
            });
        }
        Ok(TypeInfo {
            kind: if class_bound {
                LayoutKind::ClassExistential
            } else {
                LayoutKind::OpaqueExistential
            },
            layout,
            fields,
        })
    }

    fn instance_at(&mut self, registry: &TypeRegistry, ty: &MangledType, depth: usize) -> MirrorResult<Arc<TypeInfo>> {
        if depth > MAX_DEPTH {
            return Err(MirrorError::TooDeep(MAX_DEPTH));
        }
        if let Some(info) = self.instances.get(ty) {
            return Ok(info.clone());
        }
        let args: &[MangledType] = match ty {
            MangledType::Nominal {
                kind: NominalKind::Class,
                args,
                ..
            } => args,
            _ => return Err(MirrorError::NotLowerable(ty.to_string())),
        };
        let descriptor = self.descriptor(registry, ty)?;
        if descriptor.kind != FieldDescriptorKind::Class {
            return Err(MirrorError::NotLowerable(ty.to_string()));
        }
        let start = match &descriptor.superclass {
            Some(mangled) => {
                let superclass = substitute(&demangle_type(mangled)?, args)?;
                let parent = self.instance_at(registry, &superclass, depth + 1)?;
                Some((parent.layout.size, parent.layout.align))
            }
            None => None,
        };
        let mut fields = Vec::with_capacity(descriptor.fields.len());
        for (name, flags, field_ty) in Self::bound_fields(&descriptor, args)? {
            let field_ty = field_ty.ok_or_else(|| MirrorError::NotLowerable(ty.to_string()))?;
            let info = self.stored(registry, flags, &field_ty, depth)?;
            fields.push((name, field_ty, info));
        }
        let layouts: Vec<ValueLayout> = fields.iter().map(|(_, _, info)| info.layout).collect();
        let record = layout_instance(self.pointer_size, start, &layouts);
        let info = Arc::new(TypeInfo {
            kind: LayoutKind::ClassInstance,
            layout: ValueLayout {
                pod: false,
                ..record.layout
            },
            fields: fields
                .into_iter()
                .zip(record.offsets)
                .map(|((name, typeref, info), offset)| FieldInfo {
                    name,
                    offset,
                    typeref,
                    info,
                })
                .collect(),
        });
        self.instances.insert(ty.clone(), info.clone());
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::RuntimeReader;
    use crate::registry::ReflectionInfo;
    use keystone_ast::{BuiltinType, NominalDecl, Program, Type};
    use keystone_irgen::{CompileOptions, Compiler};
    use keystone_runtime::Runtime;

    fn registry_for(program: &Program) -> TypeRegistry {
        let compilation = Compiler::new(program, "main", CompileOptions::default())
            .compile()
            .unwrap();
        let rt = Runtime::new().unwrap();
        let loaded = rt.load(&compilation.image).unwrap();
        let mut registry = TypeRegistry::new();
        registry
            .add(&RuntimeReader::new(&rt), &ReflectionInfo::from(loaded.as_ref()))
            .unwrap();
        registry
    }

    fn int(bits: BuiltinType) -> Type {
        Type::Builtin(bits)
    }

    #[test]
    fn test_struct_and_tuple_records() {
        let mut program = Program::new();
        program.add(
            NominalDecl::structure("Point", "main")
                .with_field("x", int(BuiltinType::Int32))
                .with_field("y", int(BuiltinType::Bool)),
        );
        let registry = registry_for(&program);
        let mut converter = TypeConverter::new(8);
        let point = MangledType::nominal("main", "Point", NominalKind::Struct);
        let info = converter.type_info(&registry, &point).unwrap();
        assert_eq!(info.kind, LayoutKind::Struct);
        assert_eq!((info.layout.size, info.layout.align, info.layout.stride), (5, 4, 8));
        let names: Vec<_> = info.fields.iter().map(|f| (f.name.as_str(), f.offset)).collect();
        assert_eq!(names, vec![("x", 0), ("y", 4)]);

        let pair = MangledType::Tuple(vec![MangledType::Builtin("Bi8_".to_string()), point]);
        let info = converter.type_info(&registry, &pair).unwrap();
        assert_eq!(info.kind, LayoutKind::Tuple);
        assert_eq!(info.fields[1].name, "1");
        assert_eq!(info.fields[1].offset, 4);
        assert!(info.dump().starts_with("(tuple size=9 alignment=4 stride=12"));
    }

    #[test]
    fn test_enum_strategies() {
        let mut program = Program::new();
        program.add(
            NominalDecl::enumeration("Direction", "main")
                .with_case("north", None)
                .with_case("south", None),
        );
        program.add(
            NominalDecl::enumeration("Shape", "main")
                .with_case("empty", None)
                .with_case("circle", Some(int(BuiltinType::Float64)))
                .with_case("square", Some(int(BuiltinType::Int32))),
        );
        let registry = registry_for(&program);
        let mut converter = TypeConverter::new(8);
        let direction = MangledType::nominal("main", "Direction", NominalKind::Enum);
        let info = converter.type_info(&registry, &direction).unwrap();
        assert_eq!(info.kind, LayoutKind::NoPayloadEnum);
        assert_eq!(info.layout.size, 1);
        assert_eq!(info.fields.len(), 2);

        let shape = MangledType::nominal("main", "Shape", NominalKind::Enum);
        let info = converter.type_info(&registry, &shape).unwrap();
        assert_eq!(info.kind, LayoutKind::MultiPayloadEnum);
        assert_eq!(info.layout.size, 9);
        assert_eq!(info.fields[0].typeref, MangledType::Tuple(Vec::new()));
        assert!(info.fields.iter().all(|f| f.offset == 0));
    }

    #[test]
    fn test_references_and_existentials() {
        let mut program = Program::new();
        let node = program.add(
            NominalDecl::class("Node", "main").with_field("value", int(BuiltinType::Int64)),
        );
        let drawable = program.add(NominalDecl::protocol("Drawable", "main"));
        program.add(
            NominalDecl::structure("Holder", "main")
                .with_field("strong", Type::nominal(node))
                .with_weak_field("weak", Type::nominal(node))
                .with_field("any", Type::nominal(drawable)),
        );
        let registry = registry_for(&program);
        let mut converter = TypeConverter::new(8);
        let holder = MangledType::nominal("main", "Holder", NominalKind::Struct);
        let info = converter.type_info(&registry, &holder).unwrap();
        let kinds: Vec<_> = info.fields.iter().map(|f| f.info.kind).collect();
        assert_eq!(
            kinds,
            vec![
                LayoutKind::StrongReference,
                LayoutKind::WeakReference,
                LayoutKind::OpaqueExistential
            ]
        );
        let existential = &info.fields[2].info;
        assert_eq!(existential.layout.size, 40);
        assert_eq!(existential.fields[0].name, "metadata");
        assert_eq!(existential.fields[0].offset, 24);
        assert_eq!(existential.fields[1].offset, 32);

        let node_ty = MangledType::nominal("main", "Node", NominalKind::Class);
        let instance = converter.instance_info(&registry, &node_ty).unwrap();
        assert_eq!(instance.kind, LayoutKind::ClassInstance);
        assert_eq!(instance.fields[0].offset, 16);
        assert_eq!(instance.layout.size, 24);
    }

    #[test]
    fn test_unknown_types_fail_cleanly() {
        let registry = TypeRegistry::new();
        let mut converter = TypeConverter::new(8);
        let missing = MangledType::nominal("main", "Ghost", NominalKind::Struct);
        assert!(matches!(
            converter.type_info(&registry, &missing),
            Err(MirrorError::MissingFieldDescriptor(name)) if name == "4main5GhostV"
        ));
        assert!(matches!(
            converter.type_info(&registry, &MangledType::GenericParam(0)),
            Err(MirrorError::UnboundGenericParam(0))
        ));
        let int32 = converter
            .type_info(&registry, &MangledType::Builtin("Bi32_".to_string()))
            .unwrap();
        assert_eq!(int32.layout.size, 4);
    }
}

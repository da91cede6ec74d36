//! Reflection sections
//!
//! Records here are read by the remote mirror, which only has the image
//! bytes: every name is a relative reference into `typeref` or `reflstr`,
//! and each section is a packed array of records.

use crate::blob::{ConstantBlob, SectionKind};
use crate::context::CompilationContext;
use crate::error::IrGenResult;
use crate::naming::{builtin_code, mangled_type, reflection_string, typeref_string, DeclNames};
use keystone_abi::kind::field_record_flags;
use keystone_abi::records::{ASSOCIATED_TYPE_RECORD_SIZE, FIELD_RECORD_SIZE};
use keystone_abi::value::builtin_layout;
use keystone_abi::{Entity, FieldDescriptorKind, MangledType, ReflectionSection};
use keystone_ast::{BuiltinType, DeclId, DeclKind, NominalDecl, Type};

fn section(kind: ReflectionSection) -> SectionKind {
    SectionKind::Reflection(kind)
}

fn define_cstr(
    cx: &mut CompilationContext<'_>,
    name: String,
    kind: ReflectionSection,
    text: &str,
) -> IrGenResult<String> {
    if !cx.symbols.contains(&name) {
        let mut blob = ConstantBlob::new(cx.pointer_size());
        blob.emit_cstr(text);
        cx.symbols.define(name.clone(), section(kind), blob)?;
    }
    Ok(name)
}

/// Mangled type name in the `typeref` section
fn typeref(cx: &mut CompilationContext<'_>, mangled: &str) -> IrGenResult<String> {
    define_cstr(cx, typeref_string(mangled), ReflectionSection::TypeRef, mangled)
}

fn type_name(cx: &mut CompilationContext<'_>, ty: &Type) -> IrGenResult<String> {
    let mangled = mangled_type(cx.program, ty)?.mangle();
    typeref(cx, &mangled)
}

/// Name in the `reflstr` section
fn reflstr(cx: &mut CompilationContext<'_>, text: &str) -> IrGenResult<String> {
    define_cstr(
        cx,
        reflection_string(text),
        ReflectionSection::ReflectionStrings,
        text,
    )
}

fn descriptor_kind(cx: &CompilationContext<'_>, id: DeclId, decl: &NominalDecl) -> FieldDescriptorKind {
    match decl.kind {
        DeclKind::Struct => FieldDescriptorKind::Struct,
        DeclKind::Class => FieldDescriptorKind::Class,
        DeclKind::Enum => {
            if decl.cases.iter().filter(|c| c.payload.is_some()).count() > 1 {
                FieldDescriptorKind::MultiPayloadEnum
            } else {
                FieldDescriptorKind::Enum
            }
        }
        DeclKind::Protocol => {
            if cx.types().is_class_bound(&[id]) {
                FieldDescriptorKind::ClassProtocol
            } else {
                FieldDescriptorKind::Protocol
            }
        }
    }
}

/// Builtin types reachable from `ty` without crossing a nominal declaration
fn collect_builtins(ty: &Type, out: &mut Vec<BuiltinType>) {
    match ty {
        Type::Builtin(b) => {
            if !out.contains(b) {
                out.push(*b);
            }
        }
        Type::Nominal { args, .. } => args.iter().for_each(|a| collect_builtins(a, out)),
        Type::Tuple(elements) => elements.iter().for_each(|e| collect_builtins(e, out)),
        Type::Function { params, result } => {
            params.iter().for_each(|p| collect_builtins(p, out));
            collect_builtins(result, out);
        }
        Type::Metatype(inner) => collect_builtins(inner, out),
        Type::GenericParam(_) | Type::Existential(_) => {}
    }
}

fn emit_builtin_descriptor(cx: &mut CompilationContext<'_>, builtin: BuiltinType) -> IrGenResult<()> {
    let code = builtin_code(builtin);
    let ty = MangledType::Builtin(code.to_string());
    let symbol = Entity::ReflectionBuiltinDescriptor(ty).mangle();
    if cx.symbols.contains(&symbol) {
        return Ok(());
    }
    let Some(layout) = builtin_layout(code, cx.pointer_size(), cx.target.least_valid_pointer)
    else {
        return Ok(());
    };
    let name = typeref(cx, code)?;
    let mut blob = ConstantBlob::new(cx.pointer_size());
    blob.emit_relative(name);
    blob.emit_u32(layout.size as u32);
    blob.emit_u32(layout.align as u32);
    blob.emit_u32(layout.stride as u32);
    blob.emit_u32(layout.extra_inhabitants);
    cx.symbols
        .define(symbol, section(ReflectionSection::Builtin), blob)
}

/// Field descriptor of one declaration, plus builtin descriptors for the
/// builtin types its fields mention
pub(super) fn emit_field_descriptor(cx: &mut CompilationContext<'_>, id: DeclId) -> IrGenResult<()> {
    let decl = cx.decl(id)?;
    let names = DeclNames::new(decl);
    let own_name = typeref(cx, &names.ty().mangle())?;
    let superclass = match &decl.superclass {
        Some(ty) => Some(type_name(cx, ty)?),
        None => None,
    };

    let mut records = ConstantBlob::new(cx.pointer_size());
    let mut count = 0u32;
    let mut builtins = Vec::new();
    match decl.kind {
        DeclKind::Struct | DeclKind::Class => {
            for field in &decl.fields {
                let mut flags = field_record_flags::IS_VAR;
                if field.weak {
                    flags |= field_record_flags::IS_WEAK;
                }
                if field.indirect {
                    flags |= field_record_flags::IS_INDIRECT_CASE;
                }
                collect_builtins(&field.ty, &mut builtins);
                let ty = type_name(cx, &field.ty)?;
                let name = reflstr(cx, &field.name)?;
                records.emit_u32(flags);
                records.emit_relative(ty);
                records.emit_relative(name);
                count += 1;
            }
        }
        DeclKind::Enum => {
            for case in &decl.cases {
                let flags = if case.indirect {
                    field_record_flags::IS_INDIRECT_CASE
                } else {
                    0
                };
                let ty = match &case.payload {
                    Some(payload) => {
                        collect_builtins(payload, &mut builtins);
                        Some(type_name(cx, payload)?)
                    }
                    None => None,
                };
                let name = reflstr(cx, &case.name)?;
                records.emit_u32(flags);
                records.emit_optional_relative(ty);
                records.emit_relative(name);
                count += 1;
            }
        }
        DeclKind::Protocol => {}
    }

    let mut blob = ConstantBlob::new(cx.pointer_size());
    blob.emit_relative(own_name);
    blob.emit_optional_relative(superclass);
    blob.emit_u16(descriptor_kind(cx, id, decl) as u16);
    blob.emit_u16(FIELD_RECORD_SIZE);
    blob.emit_u32(count);
    blob.append(records);
    cx.symbols.define(
        names.reflection_fields(),
        section(ReflectionSection::FieldMetadata),
        blob,
    )?;

    for builtin in builtins {
        emit_builtin_descriptor(cx, builtin)?;
    }
    Ok(())
}

/// Associated type descriptor of conformance `index`, if the protocol has
/// associated types
pub(super) fn emit_associated_types(
    cx: &mut CompilationContext<'_>,
    id: DeclId,
    index: usize,
) -> IrGenResult<()> {
    let decl = cx.decl(id)?;
    let conformance = &decl.conformances[index];
    let protocol = cx.decl(conformance.protocol)?;
    if protocol.associated_types.is_empty() {
        return Ok(());
    }
    let names = DeclNames::new(decl);
    let conforming = typeref(cx, &names.ty().mangle())?;
    let protocol_name = typeref(cx, &DeclNames::new(protocol).ty().mangle())?;

    let mut records = ConstantBlob::new(cx.pointer_size());
    let mut count = 0u32;
    for requirement in &protocol.associated_types {
        let Some((_, ty)) = conformance
            .associated_types
            .iter()
            .find(|(name, _)| name == requirement)
        else {
            continue;
        };
        let name = reflstr(cx, requirement)?;
        let ty = type_name(cx, ty)?;
        records.emit_relative(name);
        records.emit_relative(ty);
        count += 1;
    }

    let mut blob = ConstantBlob::new(cx.pointer_size());
    blob.emit_relative(conforming);
    blob.emit_relative(protocol_name);
    blob.emit_u32(count);
    blob.emit_u32(ASSOCIATED_TYPE_RECORD_SIZE);
    blob.append(records);
    cx.symbols.define(
        names.reflection_associated_types(protocol),
        section(ReflectionSection::AssociatedTypes),
        blob,
    )
}

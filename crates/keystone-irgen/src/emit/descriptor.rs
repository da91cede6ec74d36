//! Nominal type descriptors
//!
//! Offsets stored in a descriptor count pointer-sized words from the address
//! point, in this module's view of the record. Classes with resilient
//! ancestry add the value of their base-offset global at run time.

use super::string_ref;
use crate::access::{strategy, AccessStrategy};
use crate::blob::{ConstantBlob, SectionKind};
use crate::context::CompilationContext;
use crate::error::IrGenResult;
use crate::layout::{MetadataLayout, SlotName};
use crate::naming::{mangled_type, DeclNames};
use keystone_abi::kind::{descriptor_flags, descriptor_layout};
use keystone_abi::DescriptorKind;
use keystone_ast::{DeclId, DeclKind, NominalDecl};

fn words(position: Option<i32>, pointer_size: u8) -> u32 {
    position.map(|p| (p / pointer_size as i32) as u32).unwrap_or(0)
}

fn flags(decl: &NominalDecl, strategy: AccessStrategy) -> u32 {
    let mut flags = 0;
    if decl.is_generic() {
        flags |= descriptor_flags::IS_GENERIC;
    }
    if decl.resilient {
        flags |= descriptor_flags::IS_RESILIENT;
    }
    if strategy == AccessStrategy::SingletonInit {
        flags |= descriptor_flags::HAS_SINGLETON_INIT;
    }
    if decl.foreign {
        flags |= descriptor_flags::IS_FOREIGN;
    }
    flags
}

fn first_own_slot(layout: &MetadataLayout, pred: impl Fn(&SlotName) -> bool) -> Option<i32> {
    layout
        .slots
        .iter()
        .find(|slot| pred(&slot.name))
        .map(|slot| slot.position)
}

pub(super) fn emit_descriptor(cx: &mut CompilationContext<'_>, id: DeclId) -> IrGenResult<()> {
    let decl = cx.decl(id)?;
    let names = DeclNames::new(decl);
    let layout = cx.layout(id)?;
    let strategy = strategy(&cx.types(), id);
    let ps = cx.pointer_size();

    let name = string_ref(cx, &decl.name)?;
    let module = string_ref(cx, &decl.module)?;

    let has_vtable = decl.kind == DeclKind::Class && layout.vtable_size() > 0;
    let mut flags = flags(decl, strategy);
    if has_vtable {
        flags |= descriptor_flags::HAS_VTABLE;
    }

    let mut blob = ConstantBlob::new(ps);
    blob.emit_u32(flags);
    blob.emit_u32(match decl.kind {
        DeclKind::Class => DescriptorKind::Class as u32,
        DeclKind::Enum => DescriptorKind::Enum as u32,
        _ => DescriptorKind::Struct as u32,
    });
    blob.emit_relative(name);
    blob.emit_relative(module);
    blob.emit_u32(decl.generic_params.len() as u32);
    blob.emit_u32(decl.num_generic_witnesses() as u32);
    let generic_start = layout
        .own_members()
        .filter(|_| decl.is_generic())
        .map(|members| members.start);
    blob.emit_u32(words(generic_start, ps));

    let num_fields = match decl.kind {
        DeclKind::Enum => decl.cases.iter().filter(|c| c.payload.is_some()).count(),
        _ => decl.fields.len(),
    };
    blob.emit_u32(num_fields as u32);
    let field_vector = first_own_slot(
        &layout,
        |slot| matches!(slot, SlotName::FieldOffset { owner, .. } if *owner == id),
    );
    blob.emit_u32(words(field_vector, ps));
    blob.emit_relative(names.field_type_accessor());
    blob.emit_optional_relative(
        cx.options
            .emit_reflection
            .then(|| names.reflection_fields()),
    );

    match decl.kind {
        DeclKind::Class => {
            let superclass = match &decl.superclass {
                Some(ty) => {
                    let mangled = mangled_type(cx.program, ty)?.mangle();
                    Some(string_ref(cx, &mangled)?)
                }
                None => None,
            };
            blob.emit_optional_relative(superclass);
            if has_vtable {
                blob.emit_u32(words(Some(layout.vtable_position()?), ps));
                blob.emit_u32(layout.vtable_size() as u32);
            } else {
                blob.emit_zeros(descriptor_layout::SIZE - descriptor_layout::VTABLE_OFFSET);
            }
        }
        DeclKind::Enum => {
            let empty = decl.cases.iter().filter(|c| c.payload.is_none()).count();
            blob.emit_u32(empty as u32);
            let payload_size = first_own_slot(&layout, |slot| *slot == SlotName::PayloadSize);
            blob.emit_u32(words(payload_size, ps));
            blob.emit_u32(0);
        }
        _ => blob.emit_zeros(descriptor_layout::SIZE - descriptor_layout::SUPERCLASS_NAME),
    }
    debug_assert_eq!(blob.len(), descriptor_layout::SIZE);
    cx.symbols.define(names.descriptor(), SectionKind::Data, blob)
}

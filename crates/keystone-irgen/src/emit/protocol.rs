//! Protocol descriptors
//!
//! Witness tables are indexed positionally by the requirement vector, so
//! `requirements` is the single source of requirement order for both the
//! descriptor and every conformance.

use super::{method_stub, string_ref};
use crate::blob::{ConstantBlob, SectionKind};
use crate::context::CompilationContext;
use crate::error::IrGenResult;
use crate::naming::{inherited_protocols, DeclNames};
use keystone_abi::kind::{protocol_flags, protocol_layout, requirement_flags};
use keystone_ast::{DeclId, NominalDecl};
use tracing::trace;

/// One entry of a protocol's requirement vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Requirement<'a> {
    AssociatedType(&'a str),
    Method { name: &'a str, has_default: bool },
}

/// Associated types first, then methods, each in declaration order
pub(crate) fn requirements(protocol: &NominalDecl) -> Vec<Requirement<'_>> {
    let types = protocol
        .associated_types
        .iter()
        .map(|name| Requirement::AssociatedType(name.as_str()));
    let methods = protocol.methods.iter().map(|m| Requirement::Method {
        name: &m.name,
        has_default: m.has_default,
    });
    types.chain(methods).collect()
}

pub(super) fn emit_protocol(cx: &mut CompilationContext<'_>, id: DeclId) -> IrGenResult<()> {
    let decl = cx.decl(id)?;
    let names = DeclNames::new(decl);
    let ps = cx.pointer_size();

    let inherited = if decl.protocols.is_empty() {
        None
    } else {
        let mut list = ConstantBlob::new(ps);
        for parent in &decl.protocols {
            list.emit_relative(DeclNames::new(cx.decl(*parent)?).protocol_descriptor());
        }
        let symbol = inherited_protocols(decl);
        cx.symbols.define(symbol.clone(), SectionKind::Data, list)?;
        Some(symbol)
    };

    let mut flags = 0;
    if decl.class_bound {
        flags |= protocol_flags::CLASS_CONSTRAINED;
    }
    if decl.resilient {
        flags |= protocol_flags::IS_RESILIENT;
    }

    let name = string_ref(cx, &decl.name)?;
    let module = string_ref(cx, &decl.module)?;
    let requirements = requirements(decl);

    let mut blob = ConstantBlob::new(ps);
    blob.emit_u32(flags);
    blob.emit_relative(name);
    blob.emit_relative(module);
    blob.emit_u32(decl.protocols.len() as u32);
    blob.emit_optional_relative(inherited);
    blob.emit_u32(requirements.len() as u32);
    debug_assert_eq!(blob.len(), protocol_layout::REQUIREMENTS);
    for requirement in &requirements {
        match requirement {
            Requirement::AssociatedType(_) => {
                blob.emit_u32(requirement_flags::KIND_ASSOCIATED_TYPE);
                blob.emit_i32(0);
            }
            Requirement::Method { name, has_default } => {
                if *has_default {
                    let default = method_stub(cx, names.method(name), false)?;
                    blob.emit_u32(requirement_flags::KIND_METHOD | requirement_flags::HAS_DEFAULT);
                    blob.emit_relative(default);
                } else {
                    blob.emit_u32(requirement_flags::KIND_METHOD);
                    blob.emit_i32(0);
                }
            }
        }
    }
    trace!(protocol = %decl.name, requirements = requirements.len(), "protocol descriptor");
    cx.symbols
        .define(names.protocol_descriptor(), SectionKind::Data, blob)
}

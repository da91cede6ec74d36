//! Constant emission
//!
//! Builders walk a declaration's layout plan and define every artifact the
//! runtime and the mirror need: metadata or its instantiation pattern,
//! descriptors, witness tables, access functions and reflection records.
//! Nothing is placed in memory here; the linker does that once every
//! declaration has been emitted.

mod class;
mod descriptor;
mod field_types;
mod pattern;
mod protocol;
mod reflection;
mod value;
mod witness;

pub use pattern::{FillCollector, FillOp, Pattern};

use crate::access::{accessor_program, AccessStrategy, AccessorOptions};
use crate::blob::{ConstantBlob, SectionKind};
use crate::context::CompilationContext;
use crate::error::IrGenResult;
use crate::naming::{data_string, DeclNames};
use keystone_abi::opcode::encode_program;
use keystone_abi::AccessOp;
use keystone_ast::{DeclId, DeclKind};
use tracing::{debug, debug_span, trace};

/// Emit every artifact of one declaration except its conformances
pub fn emit_decl(cx: &mut CompilationContext<'_>, id: DeclId) -> IrGenResult<()> {
    let decl = cx.decl(id)?;
    let span = debug_span!("emit_decl", decl = %decl.name, kind = decl.kind.keyword());
    let _guard = span.enter();
    match decl.kind {
        DeclKind::Protocol => protocol::emit_protocol(cx, id)?,
        DeclKind::Class => class::emit_class(cx, id)?,
        DeclKind::Struct | DeclKind::Enum => value::emit_value_type(cx, id)?,
    }
    if decl.kind != DeclKind::Protocol {
        descriptor::emit_descriptor(cx, id)?;
        field_types::emit_field_type_accessor(cx, id)?;
        emit_method_stubs(cx, id)?;
    }
    if cx.options.emit_reflection {
        reflection::emit_field_descriptor(cx, id)?;
    }
    Ok(())
}

/// Emit the witness tables of every conformance a declaration states
pub fn emit_conformances(cx: &mut CompilationContext<'_>, id: DeclId) -> IrGenResult<()> {
    let decl = cx.decl(id)?;
    for index in 0..decl.conformances.len() {
        witness::emit_witness_table(cx, id, index)?;
        if cx.options.emit_reflection {
            reflection::emit_associated_types(cx, id, index)?;
        }
    }
    Ok(())
}

/// NUL-terminated string in the data section, shared by every user
pub(crate) fn string_ref(cx: &mut CompilationContext<'_>, text: &str) -> IrGenResult<String> {
    let name = data_string(text);
    if !cx.symbols.contains(&name) {
        let mut blob = ConstantBlob::new(cx.pointer_size());
        blob.emit_cstr(text);
        cx.symbols.define(name.clone(), SectionKind::Data, blob)?;
    }
    Ok(name)
}

/// Zero-initialized pointer-sized global
pub(crate) fn define_zero_word(cx: &mut CompilationContext<'_>, name: String) -> IrGenResult<()> {
    let mut blob = ConstantBlob::new(cx.pointer_size());
    blob.emit_word(0);
    cx.symbols.define(name, SectionKind::Data, blob)
}

fn program_blob(cx: &CompilationContext<'_>, ops: &[AccessOp<String>]) -> ConstantBlob {
    let mut blob = ConstantBlob::new(cx.pointer_size());
    encode_program(ops, &mut blob);
    blob
}

/// Define a function body in the text section
pub(crate) fn define_program(
    cx: &mut CompilationContext<'_>,
    name: String,
    ops: &[AccessOp<String>],
) -> IrGenResult<()> {
    trace!(symbol = %name, ops = ops.len(), "function body");
    let blob = program_blob(cx, ops);
    cx.symbols.define(name, SectionKind::Text, blob)
}

/// Method body, defined on first reference
pub(crate) fn method_stub(
    cx: &mut CompilationContext<'_>,
    name: String,
    dead: bool,
) -> IrGenResult<String> {
    if !cx.symbols.contains(&name) {
        let ops = if dead {
            vec![AccessOp::Trap]
        } else {
            vec![AccessOp::Return]
        };
        let blob = program_blob(cx, &ops);
        cx.symbols.define(name.clone(), SectionKind::Text, blob)?;
    }
    Ok(name)
}

fn emit_method_stubs(cx: &mut CompilationContext<'_>, id: DeclId) -> IrGenResult<()> {
    let decl = cx.decl(id)?;
    let names = DeclNames::new(decl);
    for method in &decl.methods {
        method_stub(cx, names.method(&method.name), method.dead)?;
    }
    Ok(())
}

/// Define the access function and the globals its strategy reads
pub(crate) fn emit_accessor(
    cx: &mut CompilationContext<'_>,
    names: &DeclNames,
    strategy: AccessStrategy,
    initialize: Option<AccessOp<String>>,
) -> IrGenResult<()> {
    if strategy.uses_cache() {
        define_zero_word(cx, names.lazy_cache())?;
    }
    if strategy == AccessStrategy::SingletonInit {
        define_zero_word(cx, names.once_token())?;
    }
    let options = AccessorOptions {
        tsan: cx.options.tsan,
        skip_redundant_stores: cx.options.skip_redundant_stores,
    };
    let ops = accessor_program(names, strategy, options, initialize);
    debug!(accessor = %names.accessor(), ?strategy, "generated access function");
    define_program(cx, names.accessor(), &ops)
}

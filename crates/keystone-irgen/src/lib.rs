//! Keystone IRGen - type metadata layout and emission
//!
//! Turns a validated declaration graph into a linked image: metadata records
//! (or generic patterns), nominal and protocol descriptors, witness tables,
//! access functions and reflection sections.

pub mod access;
pub mod blob;
pub mod context;
pub mod diagnostic;
pub mod emit;
pub mod error;
pub mod layout;
pub mod linker;
pub mod naming;
pub mod recipe;
pub mod typeinfo;

pub use access::{AccessStrategy, AccessorOptions};
pub use blob::{ConstantBlob, SectionKind, SymbolTable};
pub use context::{CompilationContext, CompileOptions};
pub use diagnostic::{emit_diagnostics, Diagnostic, Severity};
pub use error::{IrGenError, IrGenResult, LayoutError};
pub use layout::{LayoutPlan, MetadataLayout, SlotName, StoredOffset};
pub use naming::DeclNames;
pub use typeinfo::TypeInfo;

use keystone_abi::Image;
use keystone_ast::Program;
use std::sync::Arc;
use tracing::{info, instrument};

/// Result of one compilation
#[derive(Debug)]
pub struct Compilation {
    pub image: Image,
    /// Every metadata layout that was scanned, by declaration
    pub layouts: Vec<Arc<MetadataLayout>>,
    pub diagnostics: Vec<Diagnostic>,
    /// Every emitted symbol in definition order
    pub symbols: Vec<String>,
}

impl Compilation {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }
}

/// Main compiler entry point
pub struct Compiler<'a> {
    program: &'a Program,
    module: String,
    options: CompileOptions,
}

impl<'a> Compiler<'a> {
    pub fn new(program: &'a Program, module: impl Into<String>, options: CompileOptions) -> Self {
        Self {
            program,
            module: module.into(),
            options,
        }
    }

    /// Validate, emit every declaration and link the result
    #[instrument(skip(self), fields(module = %self.module))]
    pub fn compile(&self) -> IrGenResult<Compilation> {
        self.program.validate()?;
        let mut cx = CompilationContext::new(self.program, self.module.clone(), self.options.clone())?;
        for (id, _) in self.program.iter() {
            emit::emit_decl(&mut cx, id)?;
        }
        for (id, _) in self.program.iter() {
            emit::emit_conformances(&mut cx, id)?;
        }
        let image = linker::link(
            &cx.module,
            cx.pointer_size(),
            &cx.symbols,
            cx.options.emit_reflection,
        )?;
        info!(
            declarations = self.program.len(),
            symbols = cx.symbols.len(),
            diagnostics = cx.diagnostics.len(),
            layout_cache_hits = cx.layouts.hits(),
            "compiled module"
        );
        Ok(Compilation {
            image,
            layouts: cx.layouts.sorted(),
            symbols: cx.symbols.names(),
            diagnostics: cx.diagnostics,
        })
    }
}

//! Subcommand implementations

pub mod demangle;
pub mod emit;
pub mod inspect;
pub mod layout;
pub mod reflect;
pub mod serve;
pub mod symbols;

use crate::output::Output;
use anyhow::Context;
use keystone_ast::{Manifest, ManifestError};
use keystone_irgen::{Compilation, CompileOptions, Compiler, Diagnostic};
use std::path::{Path, PathBuf};
use tracing::info;

/// Flags that override a manifest's `[target]` and `[options]` tables
#[derive(Debug, Clone, Default, clap::Args)]
pub struct CompileFlags {
    /// Architecture name
    #[arg(long)]
    pub arch: Option<String>,
    /// Object format name
    #[arg(long)]
    pub format: Option<String>,
    /// Pointer width in bytes
    #[arg(long)]
    pub pointer_size: Option<u8>,
    /// Insert acquire fences on accessor fast paths
    #[arg(long)]
    pub tsan: bool,
    /// Leave out reflection sections
    #[arg(long)]
    pub no_reflection: bool,
    /// TOML file with code generation options, applied before flags
    #[arg(long)]
    pub options: Option<PathBuf>,
}

impl CompileFlags {
    fn apply(&self, manifest: &Manifest) -> anyhow::Result<CompileOptions> {
        let mut options = match &self.options {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                CompileOptions::from_toml(&text)?
            }
            None => CompileOptions::from_manifest(manifest),
        };
        if let Some(arch) = &self.arch {
            options.arch = arch.clone();
        }
        if let Some(format) = &self.format {
            options.format = format.clone();
        }
        if self.pointer_size.is_some() {
            options.pointer_size = self.pointer_size;
        }
        options.tsan |= self.tsan;
        if self.no_reflection {
            options.emit_reflection = false;
        }
        Ok(options)
    }
}

/// Load a manifest and compile it, printing diagnostics on the way
///
/// Unsupported features are reported but do not stop compilation; callers
/// that write an image check `Compilation::has_errors` themselves.
pub fn compile_manifest(out: &mut Output, path: &Path, flags: &CompileFlags) -> anyhow::Result<Compilation> {
    let source = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file_name = path.display().to_string();
    let (manifest, program) = match Manifest::parse(&source).and_then(|m| m.build_program().map(|p| (m, p))) {
        Ok(parsed) => parsed,
        Err(e) => return Err(manifest_failure(out, &file_name, &source, e)),
    };
    let options = flags.apply(&manifest)?;
    let compilation = Compiler::new(&program, manifest.module.name.clone(), options)
        .compile()
        .with_context(|| format!("compiling {}", file_name))?;
    out.diagnostics(&file_name, &source, &compilation.diagnostics)?;
    info!(
        module = %manifest.module.name,
        symbols = compilation.symbols.len(),
        "compiled manifest"
    );
    Ok(compilation)
}

fn manifest_failure(out: &mut Output, file_name: &str, source: &str, error: ManifestError) -> anyhow::Error {
    if let Some(span) = error.span() {
        let diagnostic = Diagnostic::error(error.to_string()).with_span(Some(span), "here");
        if out.diagnostics(file_name, source, &[diagnostic]).is_ok() {
            return anyhow::anyhow!("{}: invalid manifest", file_name);
        }
    }
    anyhow::Error::new(error).context(format!("loading {}", file_name))
}

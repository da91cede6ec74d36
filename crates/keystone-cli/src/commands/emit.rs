//! `keystone emit`: compile a manifest to a linked image file

use super::{compile_manifest, CompileFlags};
use crate::output::Output;
use anyhow::{bail, Context};
use std::path::Path;
use tracing::info;

pub fn execute(out: &mut Output, manifest: &Path, output: &Path, flags: &CompileFlags) -> anyhow::Result<()> {
    let compilation = compile_manifest(out, manifest, flags)?;
    if compilation.has_errors() {
        bail!("{}: not writing an image with errors", manifest.display());
    }
    compilation
        .image
        .write_to_file(output)
        .with_context(|| format!("writing {}", output.display()))?;
    info!(
        image = %output.display(),
        size = compilation.image.total_size(),
        sections = compilation.image.sections.len(),
        "wrote image"
    );
    Ok(())
}

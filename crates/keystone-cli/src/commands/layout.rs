//! `keystone layout`: metadata record layouts of a manifest's types

use super::{compile_manifest, CompileFlags};
use crate::output::Output;
use anyhow::bail;
use keystone_irgen::MetadataLayout;
use std::io::Write;
use std::path::Path;

pub fn execute(
    out: &mut Output,
    manifest: &Path,
    type_name: Option<&str>,
    json: bool,
    flags: &CompileFlags,
) -> anyhow::Result<()> {
    let compilation = compile_manifest(out, manifest, flags)?;
    let layouts: Vec<&MetadataLayout> = compilation
        .layouts
        .iter()
        .map(|layout| layout.as_ref())
        .filter(|layout| type_name.is_none_or(|name| layout.name == name))
        .collect();
    if let Some(name) = type_name {
        if layouts.is_empty() {
            bail!("no type named '{}' in {}", name, manifest.display());
        }
    }

    if json {
        serde_json::to_writer_pretty(&mut *out.stdout(), &layouts)?;
        writeln!(out.stdout())?;
        return Ok(());
    }
    for (index, layout) in layouts.iter().enumerate() {
        if index > 0 {
            writeln!(out.stdout())?;
        }
        print_layout(out, layout)?;
    }
    Ok(())
}

fn print_layout(out: &mut Output, layout: &MetadataLayout) -> anyhow::Result<()> {
    out.heading(&format!("{} {}", layout.kind.keyword(), layout.name))?;
    let shape = if layout.has_dynamic_slots() {
        "dynamic"
    } else {
        "static"
    };
    writeln!(
        out.stdout(),
        "  size {}  address point {}  {}",
        layout.total_size,
        layout.address_point,
        shape
    )?;
    for slot in &layout.slots {
        out.dim(&format!("  {:>6}", slot.position))?;
        writeln!(out.stdout(), "  {:<10} {}", slot.offset.to_string(), slot.name)?;
    }
    Ok(())
}

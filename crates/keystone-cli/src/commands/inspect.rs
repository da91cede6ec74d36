//! `keystone inspect`: contents of a linked image file

use crate::output::Output;
use anyhow::{anyhow, Context};
use keystone_abi::bytes::read_cstr;
use keystone_abi::mangle::demangle_to_string;
use keystone_abi::records::{
    parse_associated_type_section, parse_builtin_section, parse_field_section, RelRef,
};
use keystone_abi::{Image, ReflectionSection, SymbolKind};
use serde_json::json;
use std::io::Write;
use std::path::Path;

pub fn execute(out: &mut Output, path: &Path, json: bool) -> anyhow::Result<()> {
    let image = Image::read_from_file(path).with_context(|| format!("reading {}", path.display()))?;
    if json {
        serde_json::to_writer_pretty(out.stdout(), &summary(&image))?;
        writeln!(out.stdout())?;
        return Ok(());
    }

    out.heading(&format!("image {}", image.module))?;
    writeln!(
        out.stdout(),
        "  pointer size {}  reflection version {}  size {}  rebases {}  binds {}",
        image.pointer_size,
        image.reflection_version,
        image.total_size(),
        image.rebases.len(),
        image.binds.len()
    )?;

    writeln!(out.stdout())?;
    out.heading("sections")?;
    for section in &image.sections {
        writeln!(
            out.stdout(),
            "  {:<10} {:#08x}  {:>6} bytes  align {}",
            section.name,
            section.address,
            section.bytes.len(),
            section.align
        )?;
    }

    writeln!(out.stdout())?;
    out.heading("symbols")?;
    for symbol in &image.symbols {
        let address = image
            .sections
            .get(symbol.section as usize)
            .map(|section| section.address + symbol.offset)
            .unwrap_or(symbol.offset);
        let kind = match symbol.kind {
            SymbolKind::Data => "data",
            SymbolKind::Function => "func",
        };
        out.dim(&format!("  {:#08x} {} {:>5}", address, kind, symbol.size))?;
        writeln!(out.stdout(), "  {}  {}", symbol.name, demangle_to_string(&symbol.name))?;
    }

    reflection(out, &image)
}

/// Field, builtin and associated type records of the reflection sections
fn reflection(out: &mut Output, image: &Image) -> anyhow::Result<()> {
    let strings = Strings { image };
    if let Some(section) = image.section(ReflectionSection::FieldMetadata.name()) {
        writeln!(out.stdout())?;
        out.heading("field descriptors")?;
        for descriptor in parse_field_section(&section.bytes)? {
            let name = strings.get(&descriptor.mangled_type_name, section.address)?;
            writeln!(out.stdout(), "  {:?} {}", descriptor.kind, demangle_type_name(&name))?;
            for field in &descriptor.fields {
                let field_name = strings.get(&field.field_name, section.address)?;
                let ty = match field.mangled_type_name.resolve(section.address) {
                    Some(_) => demangle_type_name(&strings.get(&field.mangled_type_name, section.address)?),
                    None => "()".to_string(),
                };
                writeln!(out.stdout(), "    {}: {}  flags {:#x}", field_name, ty, field.flags)?;
            }
        }
    }

    if let Some(section) = image.section(ReflectionSection::Builtin.name()) {
        writeln!(out.stdout())?;
        out.heading("builtin types")?;
        for builtin in parse_builtin_section(&section.bytes)? {
            let name = strings.get(&builtin.type_name, section.address)?;
            writeln!(
                out.stdout(),
                "  {:<16} size {} align {} stride {} extra inhabitants {}",
                demangle_type_name(&name),
                builtin.size,
                builtin.alignment,
                builtin.stride,
                builtin.extra_inhabitants
            )?;
        }
    }

    if let Some(section) = image.section(ReflectionSection::AssociatedTypes.name()) {
        writeln!(out.stdout())?;
        out.heading("associated types")?;
        for conformance in parse_associated_type_section(&section.bytes)? {
            let conforming = strings.get(&conformance.conforming_type_name, section.address)?;
            let protocol = strings.get(&conformance.protocol_type_name, section.address)?;
            writeln!(
                out.stdout(),
                "  {}: {}",
                demangle_type_name(&conforming),
                demangle_type_name(&protocol)
            )?;
            for record in &conformance.records {
                writeln!(
                    out.stdout(),
                    "    {} = {}",
                    strings.get(&record.name, section.address)?,
                    demangle_type_name(&strings.get(&record.substituted_type_name, section.address)?)
                )?;
            }
        }
    }
    Ok(())
}

fn demangle_type_name(mangled: &str) -> String {
    keystone_abi::mangle::demangle_type(mangled)
        .map(|ty| ty.to_string())
        .unwrap_or_else(|_| mangled.to_string())
}

/// Strings referenced from reflection records, read from the image itself
struct Strings<'a> {
    image: &'a Image,
}

impl Strings<'_> {
    fn get(&self, reference: &RelRef, section_address: u64) -> anyhow::Result<String> {
        let target = reference
            .resolve(section_address)
            .ok_or_else(|| anyhow!("null string reference at {:#x}", section_address + reference.at))?;
        let section = self
            .image
            .section_containing(target)
            .ok_or_else(|| anyhow!("string reference to {:#x} is outside the image", target))?;
        Ok(read_cstr(&section.bytes, (target - section.address) as usize)?.to_string())
    }
}

fn summary(image: &Image) -> serde_json::Value {
    json!({
        "module": image.module,
        "pointer_size": image.pointer_size,
        "reflection_version": image.reflection_version,
        "size": image.total_size(),
        "sections": image.sections.iter().map(|s| json!({
            "name": s.name,
            "address": s.address,
            "size": s.bytes.len(),
            "align": s.align,
        })).collect::<Vec<_>>(),
        "symbols": image.symbols.iter().map(|s| json!({
            "name": s.name,
            "section": s.section,
            "offset": s.offset,
            "size": s.size,
        })).collect::<Vec<_>>(),
        "rebases": image.rebases.len(),
        "binds": image.binds.iter().map(|b| json!({
            "offset": b.offset,
            "symbol": b.symbol,
            "addend": b.addend,
        })).collect::<Vec<_>>(),
    })
}

//! Image linker
//!
//! Places every definition in its section, resolves relative references,
//! and turns absolute references into rebase entries (targets in the image)
//! or bind entries (symbols the runtime provides).

use crate::blob::{Definition, Fixup, SectionKind, SymbolTable};
use crate::error::{IrGenError, IrGenResult};
use keystone_abi::{align_up, Bind, Image, Rebase, ReflectionSection, Symbol};
use tracing::{debug, trace};

/// Section placement order
fn section_order(emit_reflection: bool) -> Vec<SectionKind> {
    let mut order = vec![SectionKind::Data, SectionKind::Text];
    if emit_reflection {
        order.extend(ReflectionSection::ALL.iter().map(|s| SectionKind::Reflection(*s)));
    }
    order
}

struct Placed<'d> {
    def: &'d Definition,
    section: usize,
    /// Offset within the section
    offset: usize,
}

fn write_word(bytes: &mut [u8], at: usize, value: u64, pointer_size: u8) {
    match pointer_size {
        4 => bytes[at..at + 4].copy_from_slice(&(value as u32).to_le_bytes()),
        _ => bytes[at..at + 8].copy_from_slice(&value.to_le_bytes()),
    }
}

/// Link every definition into an image
pub fn link(
    module: &str,
    pointer_size: u8,
    symbols: &SymbolTable,
    emit_reflection: bool,
) -> IrGenResult<Image> {
    let mut order = section_order(emit_reflection);
    for def in symbols.definitions() {
        if !order.contains(&def.section) {
            order.push(def.section);
        }
    }

    let mut contents: Vec<Vec<u8>> = vec![Vec::new(); order.len()];
    let mut placed = Vec::with_capacity(symbols.len());
    for def in symbols.definitions() {
        let section = order
            .iter()
            .position(|kind| *kind == def.section)
            .unwrap_or_default();
        let bytes = &mut contents[section];
        let offset = align_up(bytes.len(), def.section.alignment(pointer_size));
        bytes.resize(offset, 0);
        bytes.extend_from_slice(def.blob.bytes());
        placed.push(Placed {
            def,
            section,
            offset,
        });
    }

    // Same placement rule as `Image::push_section`.
    let mut addresses = Vec::with_capacity(order.len());
    let mut end = 0usize;
    for (kind, bytes) in order.iter().zip(&contents) {
        let address = align_up(end, kind.alignment(pointer_size));
        addresses.push(address as u64);
        end = address + bytes.len();
    }

    let address_of = |name: &str| -> Option<u64> {
        let (index, label) = symbols.position(name)?;
        let p = &placed[index];
        Some(addresses[p.section] + (p.offset + label) as u64)
    };

    let mut rebases = Vec::new();
    let mut binds = Vec::new();
    for p in &placed {
        let base = addresses[p.section] + p.offset as u64;
        for fixup in p.def.blob.fixups() {
            let at = p.offset + fixup.at();
            let field = base + fixup.at() as u64;
            match fixup {
                Fixup::Absolute { target, addend, .. } => match address_of(target) {
                    Some(address) => {
                        let value = address.wrapping_add(*addend as u64);
                        write_word(&mut contents[p.section], at, value, pointer_size);
                        rebases.push(Rebase { offset: field });
                    }
                    None => {
                        trace!(symbol = %target, from = %p.def.name, "bind");
                        binds.push(Bind {
                            offset: field,
                            symbol: target.clone(),
                            addend: *addend,
                        });
                    }
                },
                Fixup::Relative { target, .. } => {
                    let address = address_of(target).ok_or_else(|| IrGenError::UndefinedSymbol {
                        name: target.clone(),
                        from: p.def.name.clone(),
                    })?;
                    let delta = address as i64 - field as i64;
                    let delta = i32::try_from(delta).map_err(|_| IrGenError::RelativeOutOfRange {
                        name: target.clone(),
                        from: p.def.name.clone(),
                    })?;
                    contents[p.section][at..at + 4].copy_from_slice(&delta.to_le_bytes());
                }
            }
        }
    }

    let mut image = Image::new(module, pointer_size);
    for (kind, bytes) in order.iter().zip(contents) {
        image.push_section(kind.name(), kind.alignment(pointer_size) as u32, bytes);
    }
    debug_assert!(image
        .sections
        .iter()
        .zip(&addresses)
        .all(|(section, address)| section.address == *address));

    for p in &placed {
        let size = p.def.blob.len() as u64;
        image.symbols.push(Symbol {
            name: p.def.name.clone(),
            section: p.section as u32,
            offset: p.offset as u64,
            size,
            kind: p.def.kind,
        });
        for (label, at) in p.def.blob.labels() {
            image.symbols.push(Symbol {
                name: label.clone(),
                section: p.section as u32,
                offset: (p.offset + at) as u64,
                size: size - *at as u64,
                kind: p.def.kind,
            });
        }
    }
    image.rebases = rebases;
    image.binds = binds;
    debug!(
        module,
        sections = image.sections.len(),
        symbols = image.symbols.len(),
        rebases = image.rebases.len(),
        binds = image.binds.len(),
        size = image.total_size(),
        "linked image"
    );
    Ok(image)
}

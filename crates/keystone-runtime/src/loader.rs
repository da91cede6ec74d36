//! Image loading
//!
//! Copies an image's sections into runtime memory, slides rebased words by
//! the load address, binds runtime symbols and publishes the image's exported
//! symbols. Private `.L` labels stay local to the image.

use crate::error::LoadError;
use crate::Runtime;
use dashmap::mapref::entry::Entry;
use keystone_abi::{Image, ImageError, ReflectionSection};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// A section's place in memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionRange {
    pub start: u64,
    pub size: u64,
}

impl SectionRange {
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end()
    }
}

/// An image mapped into runtime memory
#[derive(Debug)]
pub struct LoadedImage {
    pub module: String,
    pub base: u64,
    pub size: u64,
    symbols: FxHashMap<String, u64>,
    sections: Vec<(String, SectionRange)>,
}

impl LoadedImage {
    /// Address of a symbol defined by this image, private labels included
    pub fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    /// Every symbol defined by this image
    pub fn symbols(&self) -> impl Iterator<Item = (&str, u64)> {
        self.symbols.iter().map(|(name, address)| (name.as_str(), *address))
    }

    pub fn section(&self, name: &str) -> Option<SectionRange> {
        self.sections
            .iter()
            .find(|(section, _)| section == name)
            .map(|(_, range)| *range)
    }

    /// Reflection sections in wire order; missing sections are empty
    pub fn reflection_sections(&self) -> [SectionRange; 6] {
        ReflectionSection::ALL.map(|kind| self.section(kind.name()).unwrap_or_default())
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.base + self.size
    }
}

impl Runtime {
    /// Map an image and make its exported symbols available to later images
    #[instrument(skip(self, image), fields(module = %image.module))]
    pub fn load(&self, image: &Image) -> Result<Arc<LoadedImage>, LoadError> {
        if image.pointer_size != self.target.pointer_size {
            return Err(LoadError::PointerSize {
                module: image.module.clone(),
                pointer_size: image.pointer_size,
                expected: self.target.pointer_size,
            });
        }
        let bytes = image.flatten();
        let size = bytes.len() as u64;
        let base = self.memory.allocate_bytes(&bytes)?;
        let word = image.pointer_size as u64;
        let out_of_range = |offset: u64| LoadError::RelocationOutOfRange {
            module: image.module.clone(),
            offset,
        };

        for rebase in &image.rebases {
            if rebase.offset + word > size {
                return Err(out_of_range(rebase.offset));
            }
            let address = base + rebase.offset;
            let value = self.memory.read_word(address)?;
            self.memory.write_word(address, value.wrapping_add(base))?;
        }

        // Exports of this image are visible to its own binds.
        let mut symbols = FxHashMap::default();
        for symbol in &image.symbols {
            let section = image
                .sections
                .get(symbol.section as usize)
                .ok_or_else(|| ImageError::BadSection(symbol.name.clone(), symbol.section))?;
            symbols.insert(symbol.name.clone(), base + section.address + symbol.offset);
        }

        for bind in &image.binds {
            if bind.offset + word > size {
                return Err(out_of_range(bind.offset));
            }
            let target = self
                .symbol(&bind.symbol)
                .or_else(|| symbols.get(&bind.symbol).copied())
                .ok_or_else(|| LoadError::UnresolvedSymbol {
                    module: image.module.clone(),
                    symbol: bind.symbol.clone(),
                })?;
            self.memory
                .write_word(base + bind.offset, target.wrapping_add(bind.addend as u64))?;
        }

        for (name, address) in &symbols {
            if name.starts_with(".L") {
                continue;
            }
            if self.builtins.symbol(name).is_some() {
                debug!(symbol = %name, "image symbol shadowed by a runtime builtin");
                continue;
            }
            match self.symbols.entry(name.clone()) {
                Entry::Occupied(_) => {
                    debug!(symbol = %name, "duplicate symbol; keeping the first definition")
                }
                Entry::Vacant(entry) => {
                    entry.insert(*address);
                }
            }
        }

        let sections = image
            .sections
            .iter()
            .map(|section| {
                (
                    section.name.clone(),
                    SectionRange {
                        start: base + section.address,
                        size: section.bytes.len() as u64,
                    },
                )
            })
            .collect();
        let loaded = Arc::new(LoadedImage {
            module: image.module.clone(),
            base,
            size,
            symbols,
            sections,
        });
        self.images.write().push(loaded.clone());
        info!(
            base,
            size,
            symbols = loaded.symbols.len(),
            rebases = image.rebases.len(),
            binds = image.binds.len(),
            "loaded image"
        );
        Ok(loaded)
    }

    /// Image containing an address
    pub fn image_containing(&self, address: u64) -> Option<Arc<LoadedImage>> {
        self.images
            .read()
            .iter()
            .find(|image| image.contains(address))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_abi::{Bind, Rebase, Symbol, SymbolKind, TargetAbi};

    fn image() -> Image {
        let mut image = Image::new("demo", TargetAbi::host().pointer_size);
        let mut data = vec![0u8; 24];
        data[0..8].copy_from_slice(&16u64.to_le_bytes());
        data[16..24].copy_from_slice(&0x1234u64.to_le_bytes());
        image.push_section("data", 16, data);
        image.symbols.push(Symbol {
            name: "demo_cell".to_string(),
            section: 0,
            offset: 16,
            size: 8,
            kind: SymbolKind::Data,
        });
        image.rebases.push(Rebase { offset: 0 });
        image.binds.push(Bind {
            offset: 8,
            symbol: "$sBi32_N".to_string(),
            addend: 0,
        });
        image
    }

    #[test]
    fn test_rebase_bind_and_export() {
        let rt = Runtime::new().unwrap();
        let loaded = rt.load(&image()).unwrap();
        let cell = rt.symbol("demo_cell").unwrap();
        assert_eq!(cell, loaded.base + 16);
        assert_eq!(rt.memory().read_word(loaded.base).unwrap(), cell);
        assert_eq!(
            rt.memory().read_word(loaded.base + 8).unwrap(),
            rt.symbol("$sBi32_N").unwrap()
        );
        assert_eq!(rt.memory().read_word(cell).unwrap(), 0x1234);
        assert!(loaded.contains(cell));
        assert_eq!(rt.image_containing(cell).unwrap().module, "demo");
    }

    #[test]
    fn test_unresolved_bind_fails() {
        let rt = Runtime::new().unwrap();
        let mut image = image();
        image.binds[0].symbol = "missing".to_string();
        assert!(matches!(
            rt.load(&image),
            Err(LoadError::UnresolvedSymbol { symbol, .. }) if symbol == "missing"
        ));
    }

    #[test]
    fn test_relocation_out_of_range() {
        let rt = Runtime::new().unwrap();
        let mut image = image();
        image.rebases.push(Rebase { offset: 20 });
        assert!(matches!(
            rt.load(&image),
            Err(LoadError::RelocationOutOfRange { offset: 20, .. })
        ));
    }

    #[test]
    fn test_first_definition_wins() {
        let rt = Runtime::new().unwrap();
        let first = rt.load(&image()).unwrap();
        let second = rt.load(&image()).unwrap();
        assert_ne!(first.base, second.base);
        assert_eq!(rt.symbol("demo_cell"), Some(first.base + 16));
        assert_eq!(second.symbol("demo_cell"), Some(second.base + 16));
        assert_eq!(rt.images().len(), 2);
    }
}

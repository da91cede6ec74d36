//! Linked image format
//!
//! An image is the unit the compiler hands to the runtime: a handful of
//! sections placed at fixed offsets from the image base, a symbol table, and
//! two relocation lists. Rebases name words that hold image offsets and must
//! have the load address added; binds name words that must receive the
//! address of a runtime-provided symbol. Relative pointers need neither and
//! are final once linked.

use crate::bytes::{align_up, ByteReader, ByteWriter, DecodeError};
use std::path::Path;
use thiserror::Error;

/// Magic number for Keystone images: "KSIM"
pub const MAGIC: [u8; 4] = *b"KSIM";

/// Current image version
pub const VERSION: u16 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Image encoding/decoding errors
#[derive(Debug, Error)]
pub enum ImageError {
    /// Decode error
    #[error("Decode error: {0}")]
    DecodeError(#[from] DecodeError),

    /// Invalid magic number
    #[error("Invalid magic number: expected KSIM, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("Unsupported version: {0} (current: {VERSION})")]
    UnsupportedVersion(u16),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Stored checksum
        expected: u32,
        /// Checksum of the payload
        actual: u32,
    },

    /// Section index out of range
    #[error("Symbol '{0}' refers to missing section {1}")]
    BadSection(String, u32),

    /// File system error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Symbol kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SymbolKind {
    /// Data object
    Data = 0,
    /// Function body in the `text` section
    Function = 1,
}

impl SymbolKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SymbolKind::Data),
            1 => Some(SymbolKind::Function),
            _ => None,
        }
    }
}

/// A placed section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Section name
    pub name: String,
    /// Offset from the image base
    pub address: u64,
    /// Alignment
    pub align: u32,
    /// Contents
    pub bytes: Vec<u8>,
}

impl Section {
    /// End offset from the image base
    pub fn end(&self) -> u64 {
        self.address + self.bytes.len() as u64
    }

    /// Whether an image offset falls inside this section
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.address && offset < self.end()
    }
}

/// A defined symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Mangled name
    pub name: String,
    /// Index of the defining section
    pub section: u32,
    /// Offset within the section
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
    /// Kind
    pub kind: SymbolKind,
}

/// Word holding an image offset that must be slid by the load address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rebase {
    /// Image offset of the word
    pub offset: u64,
}

/// Word that must receive a runtime symbol's address plus an addend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    /// Image offset of the word
    pub offset: u64,
    /// Runtime symbol name
    pub symbol: String,
    /// Addend
    pub addend: i64,
}

/// A linked image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Module the image was compiled from
    pub module: String,
    /// Pointer size of the target
    pub pointer_size: u8,
    /// Reflection metadata version of the embedded sections
    pub reflection_version: u16,
    /// Sections in placement order
    pub sections: Vec<Section>,
    /// Defined symbols
    pub symbols: Vec<Symbol>,
    /// Rebase list
    pub rebases: Vec<Rebase>,
    /// Bind list
    pub binds: Vec<Bind>,
}

impl Image {
    /// Empty image
    pub fn new(module: impl Into<String>, pointer_size: u8) -> Self {
        Self {
            module: module.into(),
            pointer_size,
            reflection_version: crate::records::REFLECTION_METADATA_VERSION,
            sections: Vec::new(),
            symbols: Vec::new(),
            rebases: Vec::new(),
            binds: Vec::new(),
        }
    }

    /// Append a section at the next suitably aligned offset, returning its index
    pub fn push_section(&mut self, name: impl Into<String>, align: u32, bytes: Vec<u8>) -> u32 {
        let address = align_up(self.total_size() as usize, align.max(1) as usize) as u64;
        self.sections.push(Section {
            name: name.into(),
            address,
            align,
            bytes,
        });
        (self.sections.len() - 1) as u32
    }

    /// Bytes spanned by all sections
    pub fn total_size(&self) -> u64 {
        self.sections.iter().map(Section::end).max().unwrap_or(0)
    }

    /// Find a section by name
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Index of a section by name
    pub fn section_index(&self, name: &str) -> Option<u32> {
        self.sections
            .iter()
            .position(|s| s.name == name)
            .map(|i| i as u32)
    }

    /// Section containing an image offset
    pub fn section_containing(&self, offset: u64) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains(offset))
    }

    /// Find a symbol by name
    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// Image offset of a symbol
    pub fn symbol_offset(&self, name: &str) -> Option<u64> {
        let symbol = self.symbol(name)?;
        let section = self.sections.get(symbol.section as usize)?;
        Some(section.address + symbol.offset)
    }

    /// Symbol defined at an image offset, if any
    pub fn symbol_at(&self, offset: u64) -> Option<&Symbol> {
        self.symbols.iter().find(|s| {
            self.sections
                .get(s.section as usize)
                .is_some_and(|sec| sec.address + s.offset == offset)
        })
    }

    /// All sections laid out contiguously from offset zero, gaps zero-filled
    pub fn flatten(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.total_size() as usize];
        for section in &self.sections {
            let start = section.address as usize;
            out[start..start + section.bytes.len()].copy_from_slice(&section.bytes);
        }
        out
    }

    /// Encode the image to binary form
    ///
    /// Format:
    /// - Header: magic (4 bytes) + version (u16) + pointer size (u8) + reserved (u8) + checksum (u32)
    /// - Module name, reflection version
    /// - Section table with contents
    /// - Symbol table
    /// - Rebase list
    /// - Bind list
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new(self.pointer_size);

        writer.emit_bytes(&MAGIC);
        writer.emit_u16(VERSION);
        writer.emit_u8(self.pointer_size);
        writer.emit_u8(0);
        let checksum_offset = writer.reserve_u32();

        writer.emit_string(&self.module);
        writer.emit_u16(self.reflection_version);

        writer.emit_u32(self.sections.len() as u32);
        for section in &self.sections {
            writer.emit_string(&section.name);
            writer.emit_u64(section.address);
            writer.emit_u32(section.align);
            writer.emit_u32(section.bytes.len() as u32);
            writer.emit_bytes(&section.bytes);
        }

        writer.emit_u32(self.symbols.len() as u32);
        for symbol in &self.symbols {
            writer.emit_string(&symbol.name);
            writer.emit_u32(symbol.section);
            writer.emit_u64(symbol.offset);
            writer.emit_u64(symbol.size);
            writer.emit_u8(symbol.kind as u8);
        }

        writer.emit_u32(self.rebases.len() as u32);
        for rebase in &self.rebases {
            writer.emit_u64(rebase.offset);
        }

        writer.emit_u32(self.binds.len() as u32);
        for bind in &self.binds {
            writer.emit_u64(bind.offset);
            writer.emit_string(&bind.symbol);
            writer.emit_u64(bind.addend as u64);
        }

        let checksum = crc32fast::hash(&writer.buffer()[HEADER_SIZE..]);
        writer.patch_u32(checksum_offset, checksum);
        writer.into_bytes()
    }

    /// Decode an image from binary form
    pub fn decode(data: &[u8]) -> Result<Self, ImageError> {
        let mut reader = ByteReader::new(data, 8);

        let magic = reader.read_bytes(4)?;
        let magic: [u8; 4] = [magic[0], magic[1], magic[2], magic[3]];
        if magic != MAGIC {
            return Err(ImageError::InvalidMagic(magic));
        }
        let version = reader.read_u16()?;
        if version != VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }
        let pointer_size = reader.read_u8()?;
        if pointer_size != 4 && pointer_size != 8 {
            return Err(DecodeError::BadPointerSize(pointer_size).into());
        }
        reader.read_u8()?;
        let stored_checksum = reader.read_u32()?;

        let actual = crc32fast::hash(&data[HEADER_SIZE..]);
        if stored_checksum != actual {
            return Err(ImageError::ChecksumMismatch {
                expected: stored_checksum,
                actual,
            });
        }

        let module = reader.read_string()?;
        let reflection_version = reader.read_u16()?;

        let count = reader.read_u32()? as usize;
        let mut sections = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let name = reader.read_string()?;
            let address = reader.read_u64()?;
            let align = reader.read_u32()?;
            let len = reader.read_u32()? as usize;
            let bytes = reader.read_bytes(len)?.to_vec();
            sections.push(Section {
                name,
                address,
                align,
                bytes,
            });
        }

        let count = reader.read_u32()? as usize;
        let mut symbols = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let name = reader.read_string()?;
            let section = reader.read_u32()?;
            let offset = reader.read_u64()?;
            let size = reader.read_u64()?;
            let at = reader.position();
            let raw_kind = reader.read_u8()?;
            let kind =
                SymbolKind::from_u8(raw_kind).ok_or(DecodeError::InvalidTag(raw_kind, at))?;
            if section as usize >= sections.len() {
                return Err(ImageError::BadSection(name, section));
            }
            symbols.push(Symbol {
                name,
                section,
                offset,
                size,
                kind,
            });
        }

        let count = reader.read_u32()? as usize;
        let mut rebases = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            rebases.push(Rebase {
                offset: reader.read_u64()?,
            });
        }

        let count = reader.read_u32()? as usize;
        let mut binds = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let offset = reader.read_u64()?;
            let symbol = reader.read_string()?;
            let addend = reader.read_u64()? as i64;
            binds.push(Bind {
                offset,
                symbol,
                addend,
            });
        }

        Ok(Self {
            module,
            pointer_size,
            reflection_version,
            sections,
            symbols,
            rebases,
            binds,
        })
    }

    /// Write the encoded image to a file
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        std::fs::write(path, self.encode())?;
        Ok(())
    }

    /// Read and decode an image file
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let data = std::fs::read(path)?;
        Self::decode(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Image {
        let mut image = Image::new("main", 8);
        let data = image.push_section("data", 8, vec![1, 2, 3]);
        let text = image.push_section("text", 16, vec![9; 5]);
        image.symbols.push(Symbol {
            name: "$s4main5PointVN".to_string(),
            section: data,
            offset: 1,
            size: 2,
            kind: SymbolKind::Data,
        });
        image.symbols.push(Symbol {
            name: "$s4main5PointVMa".to_string(),
            section: text,
            offset: 0,
            size: 5,
            kind: SymbolKind::Function,
        });
        image.rebases.push(Rebase { offset: 0 });
        image.binds.push(Bind {
            offset: 8,
            symbol: "$sBi32_WV".to_string(),
            addend: -8,
        });
        image
    }

    #[test]
    fn test_section_placement() {
        let image = sample();
        assert_eq!(image.sections[0].address, 0);
        assert_eq!(image.sections[1].address, 16);
        assert_eq!(image.total_size(), 21);
        assert_eq!(image.symbol_offset("$s4main5PointVMa"), Some(16));
        assert_eq!(image.section_containing(17).map(|s| s.name.as_str()), Some("text"));
        assert!(image.section_containing(10).is_none());
        let flat = image.flatten();
        assert_eq!(&flat[..3], &[1, 2, 3]);
        assert_eq!(flat[16], 9);
    }

    #[test]
    fn test_encode_decode() {
        let image = sample();
        let decoded = Image::decode(&image.encode()).unwrap();
        assert_eq!(decoded, image);
        assert_eq!(
            decoded.symbol_at(1).map(|s| s.name.as_str()),
            Some("$s4main5PointVN")
        );
    }

    #[test]
    fn test_corruption_detected() {
        let mut bytes = sample().encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            Image::decode(&bytes),
            Err(ImageError::ChecksumMismatch { .. })
        ));

        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert!(matches!(Image::decode(&bytes), Err(ImageError::InvalidMagic(_))));
    }
}

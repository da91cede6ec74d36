//! Constant data and the session symbol table
//!
//! A `ConstantBlob` is literal bytes plus a list of fix-ups naming the symbols
//! some of those bytes must point at. Nothing is resolved until the linker
//! places every blob.

use crate::error::{IrGenError, IrGenResult};
use keystone_abi::opcode::OpSink;
use keystone_abi::{ByteWriter, ReflectionSection, SymbolKind};
use rustc_hash::FxHashMap;

/// A reference the linker must resolve
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fixup {
    /// Pointer-sized word holding the target's address plus `addend`
    Absolute {
        at: usize,
        target: String,
        addend: i64,
    },
    /// 32-bit offset from the field itself to the target
    Relative { at: usize, target: String },
}

impl Fixup {
    pub fn at(&self) -> usize {
        match self {
            Fixup::Absolute { at, .. } | Fixup::Relative { at, .. } => *at,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Fixup::Absolute { target, .. } | Fixup::Relative { target, .. } => target,
        }
    }
}

/// Bytes with unresolved references
#[derive(Debug, Clone)]
pub struct ConstantBlob {
    writer: ByteWriter,
    fixups: Vec<Fixup>,
    labels: Vec<(String, usize)>,
}

impl ConstantBlob {
    pub fn new(pointer_size: u8) -> Self {
        Self {
            writer: ByteWriter::new(pointer_size),
            fixups: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn pointer_size(&self) -> u8 {
        self.writer.pointer_size()
    }

    pub fn len(&self) -> usize {
        self.writer.offset()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        self.writer.buffer()
    }

    pub fn fixups(&self) -> &[Fixup] {
        &self.fixups
    }

    /// Extra symbols defined inside the blob
    pub fn labels(&self) -> &[(String, usize)] {
        &self.labels
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<Fixup>, Vec<(String, usize)>) {
        (self.writer.into_bytes(), self.fixups, self.labels)
    }

    pub fn emit_u8(&mut self, value: u8) {
        self.writer.emit_u8(value);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.writer.emit_u16(value);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.writer.emit_u32(value);
    }

    pub fn emit_i32(&mut self, value: i32) {
        self.writer.emit_i32(value);
    }

    pub fn emit_word(&mut self, value: u64) {
        self.writer.emit_word(value);
    }

    pub fn emit_zeros(&mut self, count: usize) {
        self.writer.emit_bytes(&vec![0u8; count]);
    }

    pub fn emit_cstr(&mut self, text: &str) {
        self.writer.emit_cstr(text);
    }

    pub fn align_to(&mut self, align: usize) {
        self.writer.align_to(align);
    }

    /// Pointer-sized absolute reference
    pub fn emit_address(&mut self, target: impl Into<String>) {
        self.emit_address_with_addend(target, 0);
    }

    pub fn emit_address_with_addend(&mut self, target: impl Into<String>, addend: i64) {
        self.fixups.push(Fixup::Absolute {
            at: self.len(),
            target: target.into(),
            addend,
        });
        self.writer.emit_word(0);
    }

    /// 32-bit relative reference
    pub fn emit_relative(&mut self, target: impl Into<String>) {
        self.fixups.push(Fixup::Relative {
            at: self.len(),
            target: target.into(),
        });
        self.writer.emit_i32(0);
    }

    /// Relative reference that may be null
    pub fn emit_optional_relative(&mut self, target: Option<String>) {
        match target {
            Some(target) => self.emit_relative(target),
            None => self.emit_i32(0),
        }
    }

    /// Define `name` at the current offset
    pub fn label(&mut self, name: impl Into<String>) {
        self.labels.push((name.into(), self.len()));
    }

    /// Overwrite a previously emitted 32-bit field
    pub fn patch_u32(&mut self, at: usize, value: u32) {
        self.writer.patch_u32(at, value);
    }

    /// Append another blob, keeping its fix-ups and labels
    pub fn append(&mut self, other: ConstantBlob) {
        let base = self.len();
        let (bytes, fixups, labels) = other.into_parts();
        self.writer.emit_bytes(&bytes);
        self.fixups.extend(fixups.into_iter().map(|f| match f {
            Fixup::Absolute { at, target, addend } => Fixup::Absolute {
                at: at + base,
                target,
                addend,
            },
            Fixup::Relative { at, target } => Fixup::Relative {
                at: at + base,
                target,
            },
        }));
        self.labels
            .extend(labels.into_iter().map(|(name, at)| (name, at + base)));
    }
}

impl OpSink<String> for ConstantBlob {
    fn emit_u8(&mut self, value: u8) {
        ConstantBlob::emit_u8(self, value);
    }
    fn emit_u16(&mut self, value: u16) {
        ConstantBlob::emit_u16(self, value);
    }
    fn emit_u32(&mut self, value: u32) {
        ConstantBlob::emit_u32(self, value);
    }
    fn emit_i32(&mut self, value: i32) {
        ConstantBlob::emit_i32(self, value);
    }
    fn emit_ref(&mut self, target: &String) {
        self.emit_relative(target.clone());
    }
}

/// Output section of a definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionKind {
    Data,
    Text,
    Reflection(ReflectionSection),
}

impl SectionKind {
    pub fn name(self) -> &'static str {
        match self {
            SectionKind::Data => "data",
            SectionKind::Text => "text",
            SectionKind::Reflection(section) => section.name(),
        }
    }

    /// Alignment of each definition placed in the section
    pub fn alignment(self, pointer_size: u8) -> usize {
        match self {
            SectionKind::Data => pointer_size as usize,
            SectionKind::Text => 4,
            SectionKind::Reflection(ReflectionSection::TypeRef)
            | SectionKind::Reflection(ReflectionSection::ReflectionStrings) => 1,
            SectionKind::Reflection(_) => 4,
        }
    }

    fn symbol_kind(self) -> SymbolKind {
        match self {
            SectionKind::Text => SymbolKind::Function,
            _ => SymbolKind::Data,
        }
    }
}

/// A named blob awaiting placement
#[derive(Debug, Clone)]
pub struct Definition {
    pub name: String,
    pub section: SectionKind,
    pub kind: SymbolKind,
    pub blob: ConstantBlob,
}

/// Every symbol defined in the session, in definition order
#[derive(Debug, Default)]
pub struct SymbolTable {
    definitions: Vec<Definition>,
    index: FxHashMap<String, (usize, usize)>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a symbol and the labels inside its blob
    pub fn define(
        &mut self,
        name: impl Into<String>,
        section: SectionKind,
        blob: ConstantBlob,
    ) -> IrGenResult<()> {
        let name = name.into();
        let names = std::iter::once((name.clone(), 0)).chain(blob.labels().iter().cloned());
        let entries: Vec<(String, usize)> = names.collect();
        for (label, _) in &entries {
            if self.index.contains_key(label) {
                return Err(IrGenError::DuplicateSymbol {
                    name: label.clone(),
                });
            }
        }
        let slot = self.definitions.len();
        for (label, offset) in entries {
            self.index.insert(label, (slot, offset));
        }
        self.definitions.push(Definition {
            name,
            section,
            kind: section.symbol_kind(),
            blob,
        });
        Ok(())
    }

    /// Define a symbol unless it already exists; returns whether it was added
    pub fn define_if_absent(
        &mut self,
        name: impl Into<String>,
        section: SectionKind,
        blob: ConstantBlob,
    ) -> IrGenResult<bool> {
        let name = name.into();
        if self.contains(&name) {
            return Ok(false);
        }
        self.define(name, section, blob)?;
        Ok(true)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Definition containing `name` and the offset of `name` inside it
    pub fn lookup(&self, name: &str) -> Option<(&Definition, usize)> {
        let (slot, offset) = *self.index.get(name)?;
        Some((&self.definitions[slot], offset))
    }

    /// Index of the definition containing `name` and the offset inside it
    pub fn position(&self, name: &str) -> Option<(usize, usize)> {
        self.index.get(name).copied()
    }

    pub fn definitions(&self) -> &[Definition] {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Every defined name, labels after their definition
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.index.len());
        for def in &self.definitions {
            names.push(def.name.clone());
            names.extend(def.blob.labels().iter().map(|(label, _)| label.clone()));
        }
        names
    }

    pub fn into_definitions(self) -> Vec<Definition> {
        self.definitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_abi::opcode::{decode_program, encode_program};
    use keystone_abi::AccessOp;

    #[test]
    fn test_append_shifts_fixups_and_labels() {
        let mut head = ConstantBlob::new(8);
        head.emit_word(7);
        let mut tail = ConstantBlob::new(8);
        tail.label("inner");
        tail.emit_address("target");
        tail.emit_relative("other");
        head.append(tail);
        assert_eq!(head.len(), 20);
        assert_eq!(head.labels(), &[("inner".to_string(), 8)]);
        assert_eq!(head.fixups()[0].at(), 8);
        assert_eq!(head.fixups()[1].at(), 16);
        assert_eq!(head.fixups()[1].target(), "other");
    }

    #[test]
    fn test_program_refs_become_relative_fixups() {
        let ops: Vec<AccessOp<String>> = vec![
            AccessOp::Instantiate("$s4main3BoxVMP".to_string()),
            AccessOp::Return,
        ];
        let mut blob = ConstantBlob::new(8);
        encode_program(&ops, &mut blob);
        assert_eq!(blob.fixups().len(), 1);
        assert_eq!(blob.fixups()[0].at(), 5);
        let decoded = decode_program(blob.bytes(), 0x1000).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1], AccessOp::Return);
    }

    #[test]
    fn test_duplicate_definitions_are_rejected() {
        let mut symbols = SymbolTable::new();
        let mut blob = ConstantBlob::new(8);
        blob.emit_word(0);
        blob.label("alias");
        symbols.define("a", SectionKind::Data, blob.clone()).unwrap();
        assert!(matches!(
            symbols.define("alias", SectionKind::Data, ConstantBlob::new(8)),
            Err(IrGenError::DuplicateSymbol { .. })
        ));
        assert!(!symbols
            .define_if_absent("a", SectionKind::Data, ConstantBlob::new(8))
            .unwrap());
        let (def, offset) = symbols.lookup("alias").unwrap();
        assert_eq!(def.name, "a");
        assert_eq!(offset, 8);
        assert_eq!(symbols.names(), vec!["a".to_string(), "alias".to_string()]);
    }
}

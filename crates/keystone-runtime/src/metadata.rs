//! Reading metadata records
//!
//! Helpers shared by class and value initialization, object allocation and
//! the diagnostic dump: kind decoding, descriptor lookup, value layout from a
//! value witness table, and field types through the field type accessor.

use crate::error::{RuntimeError, RuntimeResult};
use crate::Runtime;
use keystone_abi::kind::{class_layout, descriptor_layout, field_type_flags, vwt};
use keystone_abi::{DescriptorKind, MetadataKind, ValueLayout};
use std::fmt::Write as _;

/// One entry of a field type vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldType {
    /// Field metadata with the flag bits cleared
    pub metadata: u64,
    /// `field_type_flags` bits
    pub flags: u64,
}

impl FieldType {
    fn from_entry(entry: u64) -> Self {
        Self {
            metadata: entry & !field_type_flags::MASK,
            flags: entry & field_type_flags::MASK,
        }
    }

    /// Stored as a reference regardless of the field type
    pub fn is_reference(&self) -> bool {
        self.flags != 0
    }
}

pub(crate) fn is_class_kind(kind: MetadataKind) -> bool {
    matches!(kind, MetadataKind::Class | MetadataKind::ForeignClass)
}

impl Runtime {
    pub(crate) fn kind_of(&self, metadata: u64) -> RuntimeResult<MetadataKind> {
        let word = self.memory.read_word(metadata)?;
        MetadataKind::from_word(word).ok_or(RuntimeError::UnknownMetadataKind {
            metadata,
            kind: word,
        })
    }

    /// Nominal type descriptor of class, struct or enum metadata
    pub(crate) fn descriptor_of(&self, metadata: u64) -> RuntimeResult<u64> {
        let slot = match self.kind_of(metadata)? {
            kind if is_class_kind(kind) => metadata.wrapping_add(class_layout::DESCRIPTOR as u64),
            MetadataKind::Struct | MetadataKind::Enum | MetadataKind::Optional => metadata + 8,
            _ => return Err(RuntimeError::MissingDescriptor { metadata }),
        };
        match self.memory.read_word(slot)? {
            0 => Err(RuntimeError::MissingDescriptor { metadata }),
            descriptor => Ok(descriptor),
        }
    }

    /// Layout of a value of the type, as stored in a field
    pub(crate) fn value_layout_of(&self, metadata: u64) -> RuntimeResult<ValueLayout> {
        let kind = self.kind_of(metadata)?;
        if is_class_kind(kind) || kind == MetadataKind::ObjCClassWrapper {
            return Ok(ValueLayout::reference(
                self.target.pointer_size,
                self.target.least_valid_pointer,
            ));
        }
        let table = self.memory.read_word(metadata.wrapping_sub(8))?;
        let word = |index: usize| self.memory.read_word(table + index as u64 * 8);
        Ok(ValueLayout::from_vwt(
            word(vwt::SIZE)?,
            word(vwt::FLAGS)?,
            word(vwt::STRIDE)?,
            word(vwt::EXTRA_INHABITANTS)?,
        ))
    }

    /// Field types from the descriptor's field type accessor
    pub(crate) fn field_types(&self, metadata: u64, descriptor: u64) -> RuntimeResult<Vec<FieldType>> {
        let count = self
            .memory
            .read_u32(descriptor + descriptor_layout::NUM_FIELDS as u64)?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let accessor = self
            .memory
            .read_relative(descriptor + descriptor_layout::FIELD_TYPE_ACCESSOR as u64)?;
        let vector = self.call(accessor, &[], metadata)?;
        (0..count as u64)
            .map(|index| Ok(FieldType::from_entry(self.memory.read_word(vector + index * 8)?)))
            .collect()
    }

    /// Field types of a class's own stored properties, or an enum's payload cases
    pub fn field_types_of(&self, metadata: u64) -> RuntimeResult<Vec<FieldType>> {
        let descriptor = self.descriptor_of(metadata)?;
        self.field_types(metadata, descriptor)
    }

    /// Name of the type a descriptor describes, as `module.name`
    pub(crate) fn descriptor_name(&self, descriptor: u64) -> RuntimeResult<String> {
        let name = self
            .memory
            .read_relative(descriptor + descriptor_layout::NAME as u64)?;
        let module = self
            .memory
            .read_relative(descriptor + descriptor_layout::MODULE as u64)?;
        Ok(format!(
            "{}.{}",
            self.memory.read_cstr(module)?,
            self.memory.read_cstr(name)?
        ))
    }

    /// One-line summary of a metadata record
    pub fn describe(&self, metadata: u64) -> RuntimeResult<String> {
        let kind = self.kind_of(metadata)?;
        let mut out = format!("{:?} @ {:#x}", kind, metadata);
        if let Ok(descriptor) = self.descriptor_of(metadata) {
            let _ = write!(out, " {}", self.descriptor_name(descriptor)?);
            let raw = self
                .memory
                .read_u32(descriptor + descriptor_layout::KIND as u64)?;
            if DescriptorKind::from_u32(raw) == Some(DescriptorKind::Class) {
                let size = self
                    .memory
                    .read_u32(metadata.wrapping_add(class_layout::INSTANCE_SIZE as u64))?;
                let _ = write!(out, " instance_size={}", size);
                return Ok(out);
            }
        }
        let layout = self.value_layout_of(metadata)?;
        let _ = write!(
            out,
            " size={} align={} stride={}",
            layout.size, layout.align, layout.stride
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_type_entry_flags() {
        let entry = FieldType::from_entry(0x1000 | field_type_flags::WEAK);
        assert_eq!(entry.metadata, 0x1000);
        assert!(entry.is_reference());
        assert!(!FieldType::from_entry(0x2000).is_reference());
    }

    #[test]
    fn test_builtin_layout_from_witnesses() {
        let rt = Runtime::new().unwrap();
        let int16 = rt.symbol("$sBi16_N").unwrap();
        let layout = rt.value_layout_of(int16).unwrap();
        assert_eq!((layout.size, layout.align, layout.stride), (2, 2, 2));
        assert_eq!(
            rt.descriptor_of(int16),
            Err(RuntimeError::MissingDescriptor { metadata: int16 })
        );
        assert!(rt.describe(int16).unwrap().starts_with("Opaque"));
    }
}

//! Completing struct and enum metadata whose layout depends on field types

use crate::error::{RuntimeError, RuntimeResult};
use crate::Runtime;
use keystone_abi::kind::{descriptor_layout, vwt};
use keystone_abi::value::{layout_enum, layout_record};
use keystone_abi::{DescriptorKind, ValueLayout};
use tracing::debug;

impl Runtime {
    /// Compute the layout of a value type and write its field offsets and
    /// value witness table
    pub(crate) fn initialize_value(&self, metadata: u64) -> RuntimeResult<()> {
        let descriptor = self.descriptor_of(metadata)?;
        let kind = self
            .memory
            .read_u32(descriptor + descriptor_layout::KIND as u64)?;
        let reference = ValueLayout::reference(
            self.target.pointer_size,
            self.target.least_valid_pointer,
        );
        let fields = self
            .field_types(metadata, descriptor)?
            .into_iter()
            .map(|field| {
                if field.is_reference() {
                    Ok(reference)
                } else {
                    self.value_layout_of(field.metadata)
                }
            })
            .collect::<RuntimeResult<Vec<_>>>()?;
        let word_at = |field: usize| -> RuntimeResult<u64> {
            Ok(self.memory.read_u32(descriptor + field as u64)? as u64 * 8)
        };

        let layout = match DescriptorKind::from_u32(kind) {
            Some(DescriptorKind::Struct) => {
                let record = layout_record(&fields);
                let vector = word_at(descriptor_layout::FIELD_OFFSET_VECTOR)?;
                if vector != 0 {
                    for (index, offset) in record.offsets.iter().enumerate() {
                        self.memory
                            .write_word(metadata + vector + index as u64 * 8, *offset)?;
                    }
                }
                record.layout
            }
            Some(DescriptorKind::Enum) => {
                let empty = self
                    .memory
                    .read_u32(descriptor + descriptor_layout::NUM_EMPTY_CASES as u64)?;
                let layout = layout_enum(&fields, empty as u64);
                let payload_size = word_at(descriptor_layout::PAYLOAD_SIZE_OFFSET)?;
                if payload_size != 0 {
                    self.memory
                        .write_word(metadata + payload_size, layout.payload_size)?;
                }
                layout.layout
            }
            _ => return Err(RuntimeError::NotAValueType { metadata }),
        };

        let table = self.memory.read_word(metadata - 8)?;
        let store = |index: usize, value: u64| self.memory.write_word(table + index as u64 * 8, value);
        store(vwt::SIZE, layout.size)?;
        store(vwt::FLAGS, layout.vwt_flags(self.target.pointer_size))?;
        store(vwt::STRIDE, layout.stride)?;
        store(vwt::EXTRA_INHABITANTS, layout.extra_inhabitants as u64)?;
        debug!(
            metadata,
            size = layout.size,
            align = layout.align,
            "initialized value metadata"
        );
        Ok(())
    }
}

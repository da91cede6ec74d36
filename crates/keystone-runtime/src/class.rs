//! Completing class metadata at first access
//!
//! A class record the compiler could not finish carries only its own members.
//! Completion links the superclass, copies the inherited member area, patches
//! vtable overrides and, when the instance layout depends on field types only
//! known now, lays out the instance and publishes the field offsets.
//!
//! When a resilient ancestor's member area turned out to have a different
//! size than this module assumed, the record is rebuilt at the right size:
//! the header is copied, the class's own members move to the end of the
//! ancestor's area, and the base-offset global records where they landed.
//! Descriptor offsets stay in the compiled view, so readers add that shift.

use crate::error::{RuntimeError, RuntimeResult};
use crate::interpreter::Scope;
use crate::metadata::is_class_kind;
use crate::Runtime;
use keystone_abi::kind::{class_layout, descriptor_flags, descriptor_layout};
use keystone_abi::value::layout_instance;
use keystone_abi::{ClassInit, SlotRef, ValueLayout};
use tracing::{debug, trace};

fn at(metadata: u64, offset: i64) -> u64 {
    metadata.wrapping_add(offset as u64)
}

impl Runtime {
    fn require_class(&self, metadata: u64) -> RuntimeResult<()> {
        if is_class_kind(self.kind_of(metadata)?) {
            Ok(())
        } else {
            Err(RuntimeError::NotAClass { metadata })
        }
    }

    /// End of a class's member area, in bytes from its address point
    fn members_end(&self, class: u64) -> RuntimeResult<u64> {
        let size = self.memory.read_u32(at(class, class_layout::CLASS_SIZE))? as u64;
        let address_point = self
            .memory
            .read_u32(at(class, class_layout::CLASS_ADDRESS_POINT))? as u64;
        Ok(size.saturating_sub(address_point))
    }

    /// Finish a class record; returns its final address
    ///
    /// `publish` is told about the record again if it moves, so recursive
    /// requests made while field types are computed see the final address.
    pub(crate) fn initialize_class(
        &self,
        metadata: u64,
        init: &ClassInit<u64>,
        publish: &dyn Fn(u64),
    ) -> RuntimeResult<u64> {
        self.require_class(metadata)?;
        let superclass = match &init.superclass {
            Some(recipe) => {
                let superclass = self.materialize(recipe, Scope::context(metadata))?;
                self.require_class(superclass)?;
                Some(superclass)
            }
            None => None,
        };
        let super_end = match superclass {
            Some(superclass) => self.members_end(superclass)?,
            None => class_layout::MEMBERS as u64,
        };

        let members_size = init.members_size as u64;
        let members_start = if members_size == 0 {
            self.members_end(metadata)?
        } else {
            init.members_start as u64
        };
        let mut metadata = metadata;
        let mut shift = 0i64;
        let moved = if init.base_offset.is_some() {
            super_end != members_start
        } else {
            super_end > members_start
        };
        if moved {
            metadata = self.relocate(metadata, super_end, members_start, members_size)?;
            shift = super_end as i64 - members_start as i64;
            publish(metadata);
        }
        if let Some(base) = init.base_offset {
            self.memory.write_word(base, super_end)?;
        }

        if let Some(superclass) = superclass {
            self.memory
                .write_word(at(metadata, class_layout::SUPERCLASS), superclass)?;
            let own_start = (members_start as i64 + shift) as u64;
            let inherited = super_end.min(own_start);
            let first = class_layout::MEMBERS as u64;
            if inherited > first {
                self.memory.copy(
                    superclass + first,
                    metadata + first,
                    inherited - first,
                )?;
            }
        }

        for (slot, implementation) in &init.overrides {
            let offset = match slot {
                SlotRef::Static(offset) => *offset as i64,
                SlotRef::Dynamic { base, relative } => {
                    self.memory.read_word(*base)? as i64 + *relative as i64
                }
            };
            self.memory.write_word(at(metadata, offset), *implementation)?;
        }

        if self.memory.read_u32(at(metadata, class_layout::INSTANCE_SIZE))? == 0 {
            self.layout_class_instance(metadata, superclass, shift, &init.field_offset_globals)?;
        }
        debug!(
            metadata,
            superclass = superclass.unwrap_or(0),
            shift,
            "initialized class metadata"
        );
        Ok(metadata)
    }

    /// Copy a class record into a larger or smaller allocation so its own
    /// members start at `super_end`
    fn relocate(
        &self,
        metadata: u64,
        super_end: u64,
        members_start: u64,
        members_size: u64,
    ) -> RuntimeResult<u64> {
        let descriptor = self.descriptor_of(metadata)?;
        let flags = self
            .memory
            .read_u32(descriptor + descriptor_layout::FLAGS as u64)?;
        if flags & descriptor_flags::IS_GENERIC != 0 {
            return Err(RuntimeError::UnsupportedRelocation { metadata });
        }
        let address_point = self
            .memory
            .read_u32(at(metadata, class_layout::CLASS_ADDRESS_POINT))? as u64;
        let size = address_point + super_end + members_size;
        let base = self.memory.allocate(size)?;
        let moved = base + address_point;
        self.memory.copy(
            metadata - address_point,
            base,
            address_point + class_layout::MEMBERS as u64,
        )?;
        self.memory
            .copy(metadata + members_start, moved + super_end, members_size)?;
        self.memory
            .write_u32(at(moved, class_layout::CLASS_SIZE), size as u32)?;
        trace!(from = metadata, to = moved, size, "relocated class members");
        Ok(moved)
    }

    fn layout_class_instance(
        &self,
        metadata: u64,
        superclass: Option<u64>,
        shift: i64,
        field_offset_globals: &[u64],
    ) -> RuntimeResult<()> {
        let start = match superclass {
            Some(superclass) => {
                let size = self
                    .memory
                    .read_u32(at(superclass, class_layout::INSTANCE_SIZE))?;
                if size == 0 {
                    return Err(RuntimeError::UninitializedClass {
                        metadata: superclass,
                    });
                }
                let mask = self
                    .memory
                    .read_u16(at(superclass, class_layout::INSTANCE_ALIGN_MASK))?;
                Some((size as u64, mask as u64 + 1))
            }
            None => None,
        };

        let descriptor = self.descriptor_of(metadata)?;
        let reference = ValueLayout::reference(
            self.target.pointer_size,
            self.target.least_valid_pointer,
        );
        let layouts = self
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
        let record = layout_instance(self.target.pointer_size, start, &layouts);

        self.memory.write_u32(
            at(metadata, class_layout::INSTANCE_SIZE),
            record.layout.size as u32,
        )?;
        self.memory.write_u16(
            at(metadata, class_layout::INSTANCE_ALIGN_MASK),
            record.layout.align_mask() as u16,
        )?;
        if !record.offsets.is_empty() {
            let vector = self
                .memory
                .read_u32(descriptor + descriptor_layout::FIELD_OFFSET_VECTOR as u64)?
                as i64
                * 8
                + shift;
            for (index, offset) in record.offsets.iter().enumerate() {
                self.memory
                    .write_word(at(metadata, vector + index as i64 * 8), *offset)?;
            }
        }
        for (global, offset) in field_offset_globals.iter().zip(&record.offsets) {
            self.memory.write_word(*global, *offset)?;
        }
        trace!(
            metadata,
            size = record.layout.size,
            fields = record.offsets.len(),
            "laid out class instance"
        );
        Ok(())
    }
}

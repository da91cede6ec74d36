//! Heap objects and existential containers
//!
//! Enough of the object model to give the reflection library real values to
//! inspect: class instances with a two-word header and existential containers
//! that hold a value inline or boxed.

use crate::error::{RuntimeError, RuntimeResult};
use crate::metadata::is_class_kind;
use crate::Runtime;
use keystone_abi::kind::class_layout;
use keystone_abi::symbols::ISA_MASK;
use keystone_abi::value::EXISTENTIAL_BUFFER_WORDS;
use tracing::trace;

impl Runtime {
    /// Allocate a zeroed instance of a class
    ///
    /// The first word is the class metadata, the second the reference count.
    pub fn allocate_object(&self, class: u64) -> RuntimeResult<u64> {
        if !is_class_kind(self.kind_of(class)?) {
            return Err(RuntimeError::NotAClass { metadata: class });
        }
        let size = self
            .memory
            .read_u32(class.wrapping_add(class_layout::INSTANCE_SIZE as u64))?;
        if size == 0 {
            return Err(RuntimeError::UninitializedClass { metadata: class });
        }
        let object = self.memory.allocate(size as u64)?;
        self.memory.write_word(object, class)?;
        self.memory.write_word(object + 8, 1)?;
        trace!(class, object, size, "allocated object");
        Ok(object)
    }

    /// Class of a heap object
    pub fn object_metadata(&self, object: u64) -> RuntimeResult<u64> {
        let isa = self.memory.read_word(object)?;
        let mask = match self.symbol(ISA_MASK) {
            Some(address) => self.memory.read_word(address)?,
            None => u64::MAX,
        };
        Ok(isa & mask)
    }

    /// Opaque existential container holding `value` of type `ty`
    ///
    /// Values that fit the three-word buffer are stored inline; anything else
    /// is copied to a heap box whose address goes in the first buffer word.
    pub fn make_existential(&self, ty: u64, value: &[u8], witness_tables: &[u64]) -> RuntimeResult<u64> {
        let buffer = EXISTENTIAL_BUFFER_WORDS * 8;
        let words = EXISTENTIAL_BUFFER_WORDS + 1 + witness_tables.len() as u64;
        let container = self.memory.allocate(words * 8)?;
        let layout = self.value_layout_of(ty)?;
        if layout.fits_inline(self.target.pointer_size) {
            self.memory.write_bytes(container, value)?;
        } else {
            let boxed = self.memory.allocate_bytes(value)?;
            self.memory.write_word(container, boxed)?;
        }
        self.memory.write_word(container + buffer, ty)?;
        for (index, table) in witness_tables.iter().enumerate() {
            self.memory
                .write_word(container + buffer + 8 + index as u64 * 8, *table)?;
        }
        Ok(container)
    }

    /// Class-bound existential container holding an object reference
    pub fn make_class_existential(&self, object: u64, witness_tables: &[u64]) -> RuntimeResult<u64> {
        let container = self
            .memory
            .allocate((1 + witness_tables.len() as u64) * 8)?;
        self.memory.write_word(container, object)?;
        for (index, table) in witness_tables.iter().enumerate() {
            self.memory
                .write_word(container + 8 + index as u64 * 8, *table)?;
        }
        Ok(container)
    }
}

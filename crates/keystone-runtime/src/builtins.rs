//! Symbols every image may bind to
//!
//! Builtin type metadata with its value witness table, the value witness and
//! destructor stubs, the deleted-method trap and the isa mask word.

use crate::error::RuntimeResult;
use crate::memory::Memory;
use keystone_abi::kind::vwt;
use keystone_abi::opcode::{encode_program, program_size, AddressSink};
use keystone_abi::symbols::{
    builtin_metadata, builtin_value_witnesses, BUILTIN_CODES, DELETED_METHOD_ERROR, ISA_MASK,
    OBJECT_DESTROY, VALUE_WITNESS_FUNCTIONS,
};
use keystone_abi::value::builtin_layout;
use keystone_abi::{AccessOp, MetadataKind, TargetAbi};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Bytes of a builtin block: value witness table, its pointer, then the kind word
const BUILTIN_BLOCK: u64 = (vwt::WORDS as u64 + 2) * 8;

/// Runtime-provided symbols
#[derive(Debug)]
pub struct Builtins {
    symbols: FxHashMap<String, u64>,
    value_witness_functions: [u64; 4],
}

/// Place an op program in memory
pub(crate) fn install_program(memory: &Memory, ops: &[AccessOp<u64>]) -> RuntimeResult<u64> {
    let address = memory.allocate(program_size(ops) as u64)?;
    let mut sink = AddressSink::new(address);
    encode_program(ops, &mut sink);
    memory.write_bytes(address, &sink.into_bytes())?;
    Ok(address)
}

impl Builtins {
    pub fn install(memory: &Memory, target: &TargetAbi) -> RuntimeResult<Self> {
        let mut symbols = FxHashMap::default();

        let mut value_witness_functions = [0u64; 4];
        for (slot, name) in value_witness_functions.iter_mut().zip(VALUE_WITNESS_FUNCTIONS) {
            *slot = install_program(memory, &[AccessOp::Return])?;
            symbols.insert(name.to_string(), *slot);
        }
        symbols.insert(
            OBJECT_DESTROY.to_string(),
            install_program(memory, &[AccessOp::Return])?,
        );
        symbols.insert(
            DELETED_METHOD_ERROR.to_string(),
            install_program(memory, &[AccessOp::Trap])?,
        );
        symbols.insert(ISA_MASK.to_string(), memory.allocate_bytes(&u64::MAX.to_le_bytes())?);

        for code in BUILTIN_CODES {
            let Some(layout) = builtin_layout(code, target.pointer_size, target.least_valid_pointer)
            else {
                continue;
            };
            let block = memory.allocate(BUILTIN_BLOCK)?;
            for (index, function) in value_witness_functions.iter().enumerate() {
                memory.write_word(block + index as u64 * 8, *function)?;
            }
            memory.write_word(block + vwt::SIZE as u64 * 8, layout.size)?;
            memory.write_word(
                block + vwt::FLAGS as u64 * 8,
                layout.vwt_flags(target.pointer_size),
            )?;
            memory.write_word(block + vwt::STRIDE as u64 * 8, layout.stride)?;
            memory.write_word(
                block + vwt::EXTRA_INHABITANTS as u64 * 8,
                layout.extra_inhabitants as u64,
            )?;
            let metadata = block + BUILTIN_BLOCK - 8;
            memory.write_word(metadata - 8, block)?;
            memory.write_word(metadata, MetadataKind::Opaque.value())?;
            symbols.insert(builtin_value_witnesses(code), block);
            symbols.insert(builtin_metadata(code), metadata);
        }
        debug!(symbols = symbols.len(), "installed builtin symbols");
        Ok(Self {
            symbols,
            value_witness_functions,
        })
    }

    pub fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    /// Value witness functions in table order
    pub fn value_witness_functions(&self) -> [u64; 4] {
        self.value_witness_functions
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.symbols.iter().map(|(name, address)| (name.as_str(), *address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_abi::kind::vwt_flags;

    #[test]
    fn test_builtin_metadata_points_at_its_witnesses() {
        let memory = Memory::new();
        let builtins = Builtins::install(&memory, &TargetAbi::host()).unwrap();
        let metadata = builtins.symbol("$sBi32_N").unwrap();
        let table = builtins.symbol("$sBi32_WV").unwrap();
        assert_eq!(memory.read_word(metadata - 8).unwrap(), table);
        assert_eq!(memory.read_word(metadata).unwrap(), MetadataKind::Opaque.value());
        assert_eq!(memory.read_word(table + 4 * 8).unwrap(), 4);
        let flags = memory.read_word(table + 5 * 8).unwrap();
        assert_eq!(flags & vwt_flags::ALIGN_MASK, 3);
    }

    #[test]
    fn test_runtime_stubs_are_present() {
        let memory = Memory::new();
        let builtins = Builtins::install(&memory, &TargetAbi::host()).unwrap();
        assert!(builtins.symbol(DELETED_METHOD_ERROR).is_some());
        assert!(builtins.symbol("$sBoWV").is_some());
        let mask = builtins.symbol(ISA_MASK).unwrap();
        assert_eq!(memory.read_word(mask).unwrap(), u64::MAX);
    }
}

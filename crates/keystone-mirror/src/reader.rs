//! Access to the target's memory
//!
//! The mirror never dereferences a target address itself. Everything it
//! learns comes through a `MemoryReader`: an in-process runtime, a set of C
//! callbacks supplied by an embedder, or a pipe to another process.

use crate::error::{MirrorError, MirrorResult};
use crate::pipe::MAX_READ;
use keystone_runtime::Runtime;
use std::ffi::{c_char, c_int, c_void, CString};
use tracing::trace;

/// Source of target memory and symbols
pub trait MemoryReader {
    /// Width of a target pointer in bytes
    fn pointer_size(&self) -> u8;

    /// Width of a target `size_t` in bytes
    fn size_size(&self) -> u8;

    /// Exactly `size` bytes starting at `address`
    fn read_bytes(&self, address: u64, size: u64) -> MirrorResult<Vec<u8>>;

    /// Length of the NUL-terminated string at `address`, without the NUL
    fn string_length(&self, address: u64) -> MirrorResult<u64>;

    /// Address of a symbol exported by the target
    fn symbol_address(&self, name: &str) -> MirrorResult<u64>;

    /// Pointer-sized little-endian word
    fn read_word(&self, address: u64) -> MirrorResult<u64> {
        let size = self.pointer_size() as u64;
        let bytes = self.read_bytes(address, size)?;
        Ok(decode_word(&bytes))
    }

    fn read_u32(&self, address: u64) -> MirrorResult<u32> {
        let bytes = self.read_bytes(address, 4)?;
        Ok(decode_word(&bytes) as u32)
    }

    /// Target of the 32-bit self-relative offset at `address`
    fn read_relative(&self, address: u64) -> MirrorResult<u64> {
        let delta = self.read_u32(address)? as i32;
        if delta == 0 {
            return Err(MirrorError::NullReference(address));
        }
        Ok(address.wrapping_add(delta as i64 as u64))
    }

    /// NUL-terminated string
    fn read_string(&self, address: u64) -> MirrorResult<String> {
        let len = self.string_length(address)?;
        let bytes = self.read_bytes(address, len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Little-endian value of up to eight bytes
pub(crate) fn decode_word(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .enumerate()
        .fold(0u64, |word, (index, byte)| word | (*byte as u64) << (index * 8))
}

/// Little-endian encoding of `value` in `size` bytes
pub(crate) fn encode_word(value: u64, size: u8) -> Vec<u8> {
    value.to_le_bytes()[..(size as usize).min(8)].to_vec()
}

/// Reads the memory of a runtime in this process
#[derive(Clone, Copy)]
pub struct RuntimeReader<'a> {
    runtime: &'a Runtime,
}

impl<'a> RuntimeReader<'a> {
    pub fn new(runtime: &'a Runtime) -> Self {
        Self { runtime }
    }
}

impl MemoryReader for RuntimeReader<'_> {
    fn pointer_size(&self) -> u8 {
        self.runtime.target().pointer_size
    }

    fn size_size(&self) -> u8 {
        self.runtime.target().pointer_size
    }

    fn read_bytes(&self, address: u64, size: u64) -> MirrorResult<Vec<u8>> {
        trace!(address, size, "in-process read");
        self.runtime
            .memory()
            .read_bytes(address, size)
            .map_err(|_| MirrorError::ReadFailed { address, size })
    }

    fn string_length(&self, address: u64) -> MirrorResult<u64> {
        self.runtime
            .memory()
            .read_cstr(address)
            .map(|text| text.len() as u64)
            .map_err(|_| MirrorError::ReadFailed { address, size: 1 })
    }

    fn symbol_address(&self, name: &str) -> MirrorResult<u64> {
        self.runtime
            .symbol(name)
            .ok_or_else(|| MirrorError::MissingSymbol(name.to_string()))
    }
}

impl<R: MemoryReader + ?Sized> MemoryReader for Box<R> {
    fn pointer_size(&self) -> u8 {
        (**self).pointer_size()
    }

    fn size_size(&self) -> u8 {
        (**self).size_size()
    }

    fn read_bytes(&self, address: u64, size: u64) -> MirrorResult<Vec<u8>> {
        (**self).read_bytes(address, size)
    }

    fn string_length(&self, address: u64) -> MirrorResult<u64> {
        (**self).string_length(address)
    }

    fn symbol_address(&self, name: &str) -> MirrorResult<u64> {
        (**self).symbol_address(name)
    }
}

/// Returns the target's pointer or size width
pub type WidthCallback = unsafe extern "C" fn(context: *mut c_void) -> u8;

/// Copies `size` bytes at `address` into `dest`; nonzero on success
pub type ReadBytesCallback =
    unsafe extern "C" fn(context: *mut c_void, address: u64, dest: *mut c_void, size: u64) -> c_int;

/// Length of the string at `address`
pub type StringLengthCallback = unsafe extern "C" fn(context: *mut c_void, address: u64) -> u64;

/// Address of the symbol `name[..length]`, or 0
pub type SymbolAddressCallback =
    unsafe extern "C" fn(context: *mut c_void, name: *const c_char, length: u64) -> u64;

/// Reader backed by an embedder's C callbacks
pub struct CallbackReader {
    context: *mut c_void,
    pointer_size: u8,
    size_size: u8,
    read_bytes: ReadBytesCallback,
    string_length: StringLengthCallback,
    symbol_address: SymbolAddressCallback,
}

impl CallbackReader {
    /// Wrap a set of callbacks, asking the widths once up front
    ///
    /// # Safety
    /// Every callback must be safe to call with `context` for as long as the
    /// reader lives.
    pub unsafe fn new(
        context: *mut c_void,
        pointer_size: WidthCallback,
        size_size: WidthCallback,
        read_bytes: ReadBytesCallback,
        string_length: StringLengthCallback,
        symbol_address: SymbolAddressCallback,
    ) -> Self {
        Self {
            context,
            pointer_size: pointer_size(context),
            size_size: size_size(context),
            read_bytes,
            string_length,
            symbol_address,
        }
    }
}

impl MemoryReader for CallbackReader {
    fn pointer_size(&self) -> u8 {
        self.pointer_size
    }

    fn size_size(&self) -> u8 {
        self.size_size
    }

    fn read_bytes(&self, address: u64, size: u64) -> MirrorResult<Vec<u8>> {
        if size > MAX_READ {
            return Err(MirrorError::ReadFailed { address, size });
        }
        let mut buffer = vec![0u8; size as usize];
        // SAFETY: the buffer holds `size` bytes; the callback contract is the
        // embedder's.
        let ok = unsafe {
            (self.read_bytes)(self.context, address, buffer.as_mut_ptr() as *mut c_void, size)
        };
        if ok == 0 {
            return Err(MirrorError::ReadFailed { address, size });
        }
        Ok(buffer)
    }

    fn string_length(&self, address: u64) -> MirrorResult<u64> {
        // SAFETY: see `CallbackReader::new`.
        let length = unsafe { (self.string_length)(self.context, address) };
        if length > MAX_READ {
            return Err(MirrorError::ReadFailed { address, size: length });
        }
        Ok(length)
    }

    fn symbol_address(&self, name: &str) -> MirrorResult<u64> {
        let text = CString::new(name).map_err(|_| MirrorError::MissingSymbol(name.to_string()))?;
        // SAFETY: `text` is NUL-terminated and outlives the call.
        let address =
            unsafe { (self.symbol_address)(self.context, text.as_ptr(), name.len() as u64) };
        if address == 0 {
            return Err(MirrorError::MissingSymbol(name.to_string()));
        }
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_word_codec() {
        assert_eq!(decode_word(&[0x78, 0x56, 0x34, 0x12]), 0x1234_5678);
        assert_eq!(encode_word(0x1_0000_0002, 4), vec![2, 0, 0, 0]);
        assert_eq!(decode_word(&encode_word(u64::MAX - 1, 8)), u64::MAX - 1);
    }

    #[test]
    fn test_runtime_reader_reports_unmapped_reads() {
        let rt = Runtime::new().unwrap();
        let reader = RuntimeReader::new(&rt);
        let int32 = reader.symbol_address("$sBi32_N").unwrap();
        assert_eq!(reader.read_word(int32).unwrap(), 8);
        assert!(matches!(
            reader.read_bytes(8, 8),
            Err(MirrorError::ReadFailed { address: 8, size: 8 })
        ));
        assert!(matches!(
            reader.symbol_address("nope"),
            Err(MirrorError::MissingSymbol(_))
        ));
    }

    static READS: AtomicU64 = AtomicU64::new(0);

    unsafe extern "C" fn width(_: *mut c_void) -> u8 {
        8
    }

    unsafe extern "C" fn counting_read(_: *mut c_void, _: u64, _: *mut c_void, _: u64) -> c_int {
        READS.fetch_add(1, Ordering::SeqCst);
        0
    }

    unsafe extern "C" fn huge_length(_: *mut c_void, _: u64) -> u64 {
        u64::MAX
    }

    unsafe extern "C" fn no_symbol(_: *mut c_void, _: *const c_char, _: u64) -> u64 {
        0
    }

    #[test]
    fn test_callback_reader_caps_target_lengths() {
        let reader = unsafe {
            CallbackReader::new(
                std::ptr::null_mut(),
                width,
                width,
                counting_read,
                huge_length,
                no_symbol,
            )
        };
        assert!(matches!(
            reader.read_string(0x1000),
            Err(MirrorError::ReadFailed { address: 0x1000, size: u64::MAX })
        ));
        assert!(matches!(
            reader.read_bytes(0x2000, MAX_READ + 1),
            Err(MirrorError::ReadFailed { address: 0x2000, .. })
        ));
        assert_eq!(READS.load(Ordering::SeqCst), 0);

        assert!(reader.read_word(0x3000).is_err());
        assert_eq!(READS.load(Ordering::SeqCst), 1);
    }
}

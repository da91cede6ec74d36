//! Process memory for images and runtime-built metadata
//!
//! Every byte the runtime hands out (loaded images, instantiated metadata,
//! field type vectors, heap objects) comes from this allocator. Regions are
//! zero-filled, 16-byte aligned and live until the `Memory` is dropped, with
//! one exception: a field type vector that lost its publish race is freed
//! right away.
//!
//! Addresses are plain `u64`s. Every access goes through a bounds check
//! against the region table, so a corrupt image yields `Unmapped` instead of
//! undefined behavior.

use crate::error::{RuntimeError, RuntimeResult};
use parking_lot::RwLock;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Alignment of every allocation
pub const ALLOCATION_ALIGN: usize = 16;

/// Owner of all runtime memory
pub struct Memory {
    /// Region start -> region size
    regions: RwLock<BTreeMap<u64, u64>>,
    allocated_bytes: AtomicUsize,
}

impl Memory {
    pub fn new() -> Self {
        Self {
            regions: RwLock::new(BTreeMap::new()),
            allocated_bytes: AtomicUsize::new(0),
        }
    }

    fn layout(size: u64) -> RuntimeResult<Layout> {
        Layout::from_size_align(size as usize, ALLOCATION_ALIGN)
            .map_err(|_| RuntimeError::OutOfMemory { size })
    }

    /// Allocate `size` zeroed bytes
    pub fn allocate(&self, size: u64) -> RuntimeResult<u64> {
        let size = size.max(8);
        let layout = Self::layout(size)?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(RuntimeError::OutOfMemory { size });
        }
        let address = ptr as u64;
        self.regions.write().insert(address, size);
        self.allocated_bytes.fetch_add(size as usize, Ordering::Relaxed);
        Ok(address)
    }

    /// Allocate and fill with `bytes`
    pub fn allocate_bytes(&self, bytes: &[u8]) -> RuntimeResult<u64> {
        let address = self.allocate(bytes.len() as u64)?;
        self.write_bytes(address, bytes)?;
        Ok(address)
    }

    /// Release an allocation made by `allocate`
    pub fn free(&self, address: u64) -> RuntimeResult<()> {
        let size = self
            .regions
            .write()
            .remove(&address)
            .ok_or(RuntimeError::InvalidFree { address })?;
        let layout = Self::layout(size)?;
        // SAFETY: `address` came from `alloc_zeroed` with this layout and was
        // removed from the table, so it cannot be freed twice.
        unsafe { dealloc(address as *mut u8, layout) };
        self.allocated_bytes.fetch_sub(size as usize, Ordering::Relaxed);
        Ok(())
    }

    /// Whether `[address, address + len)` lies inside one live region
    pub fn contains(&self, address: u64, len: u64) -> bool {
        let Some(end) = address.checked_add(len) else {
            return false;
        };
        self.regions
            .read()
            .range(..=address)
            .next_back()
            .is_some_and(|(start, size)| end <= start + size)
    }

    /// Bytes currently allocated
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    fn check(&self, address: u64, len: u64) -> RuntimeResult<*mut u8> {
        if self.contains(address, len) {
            Ok(address as *mut u8)
        } else {
            Err(RuntimeError::Unmapped { address, len })
        }
    }

    /// Copy `len` bytes out
    pub fn read_bytes(&self, address: u64, len: u64) -> RuntimeResult<Vec<u8>> {
        let ptr = self.check(address, len)?;
        let mut out = vec![0u8; len as usize];
        // SAFETY: the range is inside a live region.
        unsafe { std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), len as usize) };
        Ok(out)
    }

    /// Copy bytes in
    pub fn write_bytes(&self, address: u64, bytes: &[u8]) -> RuntimeResult<()> {
        let ptr = self.check(address, bytes.len() as u64)?;
        // SAFETY: the range is inside a live region.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        Ok(())
    }

    /// Copy between two mapped ranges
    pub fn copy(&self, from: u64, to: u64, len: u64) -> RuntimeResult<()> {
        let src = self.check(from, len)?;
        let dst = self.check(to, len)?;
        // SAFETY: both ranges are inside live regions; `copy` allows overlap.
        unsafe { std::ptr::copy(src as *const u8, dst, len as usize) };
        Ok(())
    }

    pub fn read_word(&self, address: u64) -> RuntimeResult<u64> {
        let ptr = self.check(address, 8)?;
        // SAFETY: eight mapped bytes.
        Ok(unsafe { std::ptr::read_unaligned(ptr as *const u64) })
    }

    pub fn write_word(&self, address: u64, value: u64) -> RuntimeResult<()> {
        let ptr = self.check(address, 8)?;
        // SAFETY: eight mapped bytes.
        unsafe { std::ptr::write_unaligned(ptr as *mut u64, value) };
        Ok(())
    }

    pub fn read_u32(&self, address: u64) -> RuntimeResult<u32> {
        let ptr = self.check(address, 4)?;
        // SAFETY: four mapped bytes.
        Ok(unsafe { std::ptr::read_unaligned(ptr as *const u32) })
    }

    pub fn write_u32(&self, address: u64, value: u32) -> RuntimeResult<()> {
        let ptr = self.check(address, 4)?;
        // SAFETY: four mapped bytes.
        unsafe { std::ptr::write_unaligned(ptr as *mut u32, value) };
        Ok(())
    }

    pub fn read_u16(&self, address: u64) -> RuntimeResult<u16> {
        let ptr = self.check(address, 2)?;
        // SAFETY: two mapped bytes.
        Ok(unsafe { std::ptr::read_unaligned(ptr as *const u16) })
    }

    pub fn write_u16(&self, address: u64, value: u16) -> RuntimeResult<()> {
        let ptr = self.check(address, 2)?;
        // SAFETY: two mapped bytes.
        unsafe { std::ptr::write_unaligned(ptr as *mut u16, value) };
        Ok(())
    }

    /// Target of a 32-bit relative reference stored at `address`
    pub fn read_relative(&self, address: u64) -> RuntimeResult<u64> {
        let delta = self.read_u32(address)? as i32;
        Ok(address.wrapping_add(delta as i64 as u64))
    }

    /// Target of an optional relative reference; zero reads as absent
    pub fn read_optional_relative(&self, address: u64) -> RuntimeResult<Option<u64>> {
        match self.read_u32(address)? {
            0 => Ok(None),
            _ => self.read_relative(address).map(Some),
        }
    }

    /// NUL-terminated string
    pub fn read_cstr(&self, address: u64) -> RuntimeResult<String> {
        let mut bytes = Vec::new();
        let mut at = address;
        loop {
            let ptr = self.check(at, 1)?;
            // SAFETY: one mapped byte.
            let byte = unsafe { *ptr };
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            at += 1;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Word at `address` viewed as an atomic
    pub fn atomic(&self, address: u64) -> RuntimeResult<&AtomicU64> {
        if address % 8 != 0 {
            return Err(RuntimeError::Misaligned { address });
        }
        let ptr = self.check(address, 8)?;
        // SAFETY: aligned, mapped, and regions are only freed through `free`,
        // which is never called on memory a published cache points into.
        Ok(unsafe { AtomicU64::from_ptr(ptr as *mut u64) })
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        for (address, size) in std::mem::take(self.regions.get_mut()) {
            if let Ok(layout) = Self::layout(size) {
                // SAFETY: every region in the table is a live allocation.
                unsafe { dealloc(address as *mut u8, layout) };
            }
        }
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("regions", &self.regions.read().len())
            .field("allocated_bytes", &self.allocated_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocations_are_zeroed_and_aligned() {
        let memory = Memory::new();
        let a = memory.allocate(24).unwrap();
        assert_eq!(a % ALLOCATION_ALIGN as u64, 0);
        assert_eq!(memory.read_bytes(a, 24).unwrap(), vec![0u8; 24]);
        assert!(memory.contains(a + 16, 8));
        assert!(!memory.contains(a + 16, 9));
    }

    #[test]
    fn test_word_and_relative_access() {
        let memory = Memory::new();
        let a = memory.allocate(32).unwrap();
        memory.write_word(a + 8, 0xDEAD_BEEF).unwrap();
        assert_eq!(memory.read_word(a + 8).unwrap(), 0xDEAD_BEEF);
        memory.write_u32(a + 16, (-16i32) as u32).unwrap();
        assert_eq!(memory.read_relative(a + 16).unwrap(), a);
        assert_eq!(memory.read_optional_relative(a + 20).unwrap(), None);
    }

    #[test]
    fn test_unmapped_access_is_an_error() {
        let memory = Memory::new();
        assert!(matches!(
            memory.read_word(0x10),
            Err(RuntimeError::Unmapped { address: 0x10, len: 8 })
        ));
    }

    #[test]
    fn test_free_removes_region() {
        let memory = Memory::new();
        let a = memory.allocate(64).unwrap();
        let before = memory.allocated_bytes();
        memory.free(a).unwrap();
        assert_eq!(memory.allocated_bytes(), before - 64);
        assert!(!memory.contains(a, 1));
        assert_eq!(memory.free(a), Err(RuntimeError::InvalidFree { address: a }));
    }

    #[test]
    fn test_cstr() {
        let memory = Memory::new();
        let a = memory.allocate_bytes(b"main\0").unwrap();
        assert_eq!(memory.read_cstr(a).unwrap(), "main");
    }
}

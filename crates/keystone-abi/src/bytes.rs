//! Little-endian byte encoding and decoding
//!
//! Every Keystone binary format (images, reflection records, function bodies)
//! is written with `ByteWriter` and read back with `ByteReader`. Words are
//! pointer-sized and take their width from the target.

use thiserror::Error;

/// Errors that can occur while decoding binary data
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Unexpected end of input
    #[error("Unexpected end of data at offset {0}")]
    UnexpectedEnd(usize),

    /// Invalid UTF-8 string
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    /// Unsupported word width
    #[error("Unsupported pointer size {0}")]
    BadPointerSize(u8),

    /// Unknown tag byte
    #[error("Invalid tag {0:#x} at offset {1}")]
    InvalidTag(u8, usize),
}

/// Byte writer
#[derive(Debug, Clone)]
pub struct ByteWriter {
    buffer: Vec<u8>,
    pointer_size: u8,
}

impl ByteWriter {
    /// Create a writer for the given pointer size (4 or 8)
    pub fn new(pointer_size: u8) -> Self {
        Self {
            buffer: Vec::new(),
            pointer_size,
        }
    }

    /// Current buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the buffer
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Current offset (length of the buffer)
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    /// Pointer size words are written with
    pub fn pointer_size(&self) -> u8 {
        self.pointer_size
    }

    // ===== Basic Emission =====

    /// Emit a raw byte
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Emit a 16-bit unsigned integer
    pub fn emit_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit unsigned integer
    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit signed integer
    pub fn emit_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit unsigned integer
    pub fn emit_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a pointer-sized word (truncated on 32-bit targets)
    pub fn emit_word(&mut self, value: u64) {
        if self.pointer_size == 4 {
            self.emit_u32(value as u32);
        } else {
            self.emit_u64(value);
        }
    }

    /// Emit raw bytes
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Emit a length-prefixed UTF-8 string
    pub fn emit_string(&mut self, value: &str) {
        self.emit_u32(value.len() as u32);
        self.buffer.extend_from_slice(value.as_bytes());
    }

    /// Emit a NUL-terminated string
    pub fn emit_cstr(&mut self, value: &str) {
        self.buffer.extend_from_slice(value.as_bytes());
        self.buffer.push(0);
    }

    /// Pad with zeros up to the next multiple of `align`
    pub fn align_to(&mut self, align: usize) {
        let aligned = align_up(self.buffer.len(), align);
        self.buffer.resize(aligned, 0);
    }

    /// Patch a previously emitted u32 value at the given offset
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Reserve space for a u32 value (returns offset for later patching)
    pub fn reserve_u32(&mut self) -> usize {
        let offset = self.offset();
        self.emit_u32(0);
        offset
    }
}

/// Round `value` up to a multiple of `align` (a power of two or zero)
pub fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        return value;
    }
    (value + align - 1) & !(align - 1)
}

/// Byte reader
pub struct ByteReader<'a> {
    buffer: &'a [u8],
    position: usize,
    pointer_size: u8,
}

impl<'a> ByteReader<'a> {
    /// Create a reader for the given pointer size
    pub fn new(buffer: &'a [u8], pointer_size: u8) -> Self {
        Self {
            buffer,
            position: 0,
            pointer_size,
        }
    }

    /// Create a reader positioned at `offset`
    pub fn at(buffer: &'a [u8], offset: usize, pointer_size: u8) -> Self {
        Self {
            buffer,
            position: offset,
            pointer_size,
        }
    }

    /// Current position
    pub fn position(&self) -> usize {
        self.position
    }

    /// Remaining bytes
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Whether there are more bytes to read
    pub fn has_more(&self) -> bool {
        self.position < self.buffer.len()
    }

    /// Seek to a position
    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self
            .position
            .checked_add(N)
            .ok_or(DecodeError::UnexpectedEnd(self.position))?;
        let slice = self
            .buffer
            .get(self.position..end)
            .ok_or(DecodeError::UnexpectedEnd(self.position))?;
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(slice);
        self.position = end;
        Ok(bytes)
    }

    // ===== Basic Reading =====

    /// Read a byte
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    /// Read a 16-bit unsigned integer
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    /// Read a 32-bit unsigned integer
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    /// Read a 32-bit signed integer
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    /// Read a 64-bit unsigned integer
    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    /// Read a pointer-sized word
    pub fn read_word(&mut self) -> Result<u64, DecodeError> {
        match self.pointer_size {
            4 => Ok(self.read_u32()? as u64),
            8 => self.read_u64(),
            other => Err(DecodeError::BadPointerSize(other)),
        }
    }

    /// Read `len` raw bytes
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .position
            .checked_add(len)
            .ok_or(DecodeError::UnexpectedEnd(self.position))?;
        let slice = self
            .buffer
            .get(self.position..end)
            .ok_or(DecodeError::UnexpectedEnd(self.position))?;
        self.position = end;
        Ok(slice)
    }

    /// Read a length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u32()? as usize;
        let start = self.position;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8(start))
    }
}

/// Read a NUL-terminated string starting at `offset`
pub fn read_cstr(buffer: &[u8], offset: usize) -> Result<&str, DecodeError> {
    let tail = buffer
        .get(offset..)
        .ok_or(DecodeError::UnexpectedEnd(offset))?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::UnexpectedEnd(buffer.len()))?;
    std::str::from_utf8(&tail[..len]).map_err(|_| DecodeError::InvalidUtf8(offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_width_follows_pointer_size() {
        let mut narrow = ByteWriter::new(4);
        narrow.emit_word(0x1_0000_0002);
        assert_eq!(narrow.buffer(), &[2, 0, 0, 0]);

        let mut wide = ByteWriter::new(8);
        wide.emit_word(0x1_0000_0002);
        assert_eq!(wide.offset(), 8);
        let mut reader = ByteReader::new(wide.buffer(), 8);
        assert_eq!(reader.read_word().unwrap(), 0x1_0000_0002);
        assert!(!reader.has_more());
    }

    #[test]
    fn test_short_read_reports_offset() {
        let mut reader = ByteReader::new(&[1, 2, 3], 8);
        assert_eq!(reader.read_u16().unwrap(), 0x0201);
        assert_eq!(reader.read_u32(), Err(DecodeError::UnexpectedEnd(2)));
    }

    #[test]
    fn test_patch_and_align() {
        let mut writer = ByteWriter::new(8);
        let slot = writer.reserve_u32();
        writer.emit_u8(7);
        writer.align_to(8);
        writer.patch_u32(slot, 0xdead_beef);
        assert_eq!(writer.offset(), 8);
        let mut reader = ByteReader::new(writer.buffer(), 8);
        assert_eq!(reader.read_u32().unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_read_cstr() {
        let data = b"abc\0def\0";
        assert_eq!(read_cstr(data, 4).unwrap(), "def");
        assert!(read_cstr(b"abc", 0).is_err());
        assert!(read_cstr(data, 99).is_err());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(5, 1), 5);
    }
}

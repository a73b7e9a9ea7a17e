//! Little-endian byte encoding for the trace wire format.
//!
//! All integers and floats are little-endian. Readers never panic on short
//! input; they report [`ProtocolError::Truncated`] with the failing offset.

use bytes::{Buf, BufMut, BytesMut};
use tidemark_core::ProtocolError;

/// Trait for types with a fixed wire representation
pub trait WireEncode {
    /// Append the wire form to `w`
    ///
    /// # Errors
    ///
    /// Returns error if a length does not fit the wire format
    fn encode(&self, w: &mut ByteWriter) -> Result<(), ProtocolError>;

    /// Encode into a fresh buffer
    ///
    /// # Errors
    ///
    /// Returns error if a length does not fit the wire format
    fn to_wire(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = ByteWriter::new();
        self.encode(&mut w)?;
        Ok(w.into_vec())
    }
}

/// Trait for types that can be read back without outside context
pub trait WireDecode: Sized {
    /// Read one item from `r`
    ///
    /// # Errors
    ///
    /// Returns error if the input is truncated or malformed
    fn decode(r: &mut ByteReader<'_>) -> Result<Self, ProtocolError>;
}

/// Growable output buffer
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: BytesMut,
}

impl ByteWriter {
    /// Create an empty writer
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Create with pre-allocated capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Append one byte
    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Append a little-endian `u16`
    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    /// Append a little-endian `u32`
    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    /// Append a little-endian `i32`
    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    /// Append a little-endian `f32`
    pub fn put_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    /// Append a little-endian `f64`
    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    /// Append raw bytes
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Write a length or count as `u32`
    ///
    /// # Errors
    ///
    /// Returns error if `len` exceeds `u32::MAX`
    pub fn put_len(&mut self, len: usize) -> Result<(), ProtocolError> {
        let len32 = u32::try_from(len).map_err(|_| ProtocolError::LengthOverflow { len })?;
        self.put_u32(len32);
        Ok(())
    }

    /// Bytes written so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop everything written so far
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Written bytes
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consume and return the written bytes
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Bounds-checked cursor over an input buffer
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Create a reader at offset 0
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current byte offset from the start of the input
    #[must_use]
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Whether the input is exhausted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < needed {
            return Err(ProtocolError::Truncated {
                offset: self.pos,
                needed,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    /// Read one byte
    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?.get_u8())
    }

    /// Read a little-endian `u16`
    pub fn get_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(self.take(2)?.get_u16_le())
    }

    /// Read a little-endian `u32`
    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(self.take(4)?.get_u32_le())
    }

    /// Read a little-endian `i32`
    pub fn get_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.take(4)?.get_i32_le())
    }

    /// Read a little-endian `f32`
    pub fn get_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(self.take(4)?.get_f32_le())
    }

    /// Read a little-endian `f64`
    pub fn get_f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(self.take(8)?.get_f64_le())
    }

    /// Borrow the next `len` bytes
    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        self.take(len)
    }

    /// Read a `u32` length prefix
    pub fn get_len(&mut self) -> Result<usize, ProtocolError> {
        Ok(self.get_u32()? as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_layout() {
        let mut w = ByteWriter::new();
        w.put_u16(0x0102);
        w.put_u32(0x0304_0506);
        assert_eq!(w.as_slice(), &[0x02, 0x01, 0x06, 0x05, 0x04, 0x03]);
    }

    #[test]
    fn test_read_back_scalars() {
        let mut w = ByteWriter::with_capacity(32);
        w.put_u8(7);
        w.put_i32(-5);
        w.put_f32(1.5);
        w.put_f64(-0.25);
        w.put_bytes(b"abc");
        let bytes = w.into_vec();

        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), 7);
        assert_eq!(r.get_i32().unwrap(), -5);
        assert_eq!(r.get_f32().unwrap(), 1.5);
        assert_eq!(r.get_f64().unwrap(), -0.25);
        assert_eq!(r.get_bytes(3).unwrap(), b"abc");
        assert!(r.is_empty());
    }

    #[test]
    fn test_truncated_read_reports_offset() {
        let bytes = [1u8, 2, 3];
        let mut r = ByteReader::new(&bytes);
        r.get_u8().unwrap();
        assert_eq!(
            r.get_u32(),
            Err(ProtocolError::Truncated {
                offset: 1,
                needed: 4,
                available: 2
            })
        );
        // A failed read does not advance
        assert_eq!(r.offset(), 1);
    }

    #[test]
    fn test_writer_clear() {
        let mut w = ByteWriter::new();
        w.put_u32(1);
        assert_eq!(w.len(), 4);
        w.clear();
        assert!(w.is_empty());
    }
}

// src/nat/stun/codec.rs
//! Big-endian cursor reader and growable writer for STUN wire data

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::nat::error::DecodeError;

/// Read cursor over an immutable byte buffer.
///
/// Every read checks the remaining length first and fails with
/// [`DecodeError::InsufficientData`] instead of panicking.
#[derive(Debug, Clone)]
pub struct DataStream<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DataStream<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current cursor position
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn require(&self, needed: usize) -> Result<(), DecodeError> {
        let available = self.remaining();
        if available < needed {
            return Err(DecodeError::InsufficientData { needed, available });
        }
        Ok(())
    }

    fn cursor(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.require(1)?;
        let value = self.cursor().get_u8();
        self.pos += 1;
        Ok(value)
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        self.require(2)?;
        let value = self.cursor().get_u16();
        self.pos += 2;
        Ok(value)
    }

    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        self.require(2)?;
        let value = self.cursor().get_i16();
        self.pos += 2;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.require(4)?;
        let value = self.cursor().get_u32();
        self.pos += 4;
        Ok(value)
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        self.require(4)?;
        let value = self.cursor().get_i32();
        self.pos += 4;
        Ok(value)
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        self.require(8)?;
        let value = self.cursor().get_u64();
        self.pos += 8;
        Ok(value)
    }

    /// Borrow the next `n` bytes
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.require(n)?;
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.require(n)?;
        self.pos += n;
        Ok(())
    }

    /// Borrow everything left and move the cursor to the end
    pub fn remaining_bytes(&mut self) -> &'a [u8] {
        let slice = self.cursor();
        self.pos = self.buf.len();
        slice
    }

    /// Owned copy of everything left; moves the cursor to the end
    pub fn copy_remaining_bytes(&mut self) -> Vec<u8> {
        self.remaining_bytes().to_vec()
    }
}

/// Growable big-endian output buffer. Writes never fail.
#[derive(Debug, Default, Clone)]
pub struct DataWriter {
    buf: BytesMut,
}

impl DataWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.put_i16(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    /// Append `n` zero bytes
    pub fn write_zeros(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_are_big_endian() {
        let data = [0x01, 0x02, 0xFF, 0xFE, 0x00, 0x00, 0x01, 0x00, 0x01];
        let mut stream = DataStream::new(&data);

        assert_eq!(stream.read_u16().unwrap(), 0x0102);
        assert_eq!(stream.read_i16().unwrap(), -2);
        assert_eq!(stream.read_i32().unwrap(), 256);
        assert!(stream.read_bool().unwrap());
        assert!(stream.is_empty());
    }

    #[test]
    fn test_insufficient_data() {
        let data = [0x01, 0x02, 0x03];
        let mut stream = DataStream::new(&data);

        assert_eq!(
            stream.read_u32(),
            Err(DecodeError::InsufficientData { needed: 4, available: 3 })
        );
        // A failed read leaves the cursor untouched
        assert_eq!(stream.position(), 0);
        assert_eq!(stream.read_bytes(2).unwrap(), &[0x01, 0x02]);
        assert!(stream.read_bytes(2).is_err());
    }

    #[test]
    fn test_remaining_bytes_advances_cursor() {
        let data = [0xAA, 0xBB, 0xCC];
        let mut stream = DataStream::new(&data);
        stream.skip(1).unwrap();

        assert_eq!(stream.remaining_bytes(), &[0xBB, 0xCC]);
        assert_eq!(stream.remaining(), 0);
        assert!(stream.copy_remaining_bytes().is_empty());
    }

    #[test]
    fn test_writer() {
        let mut writer = DataWriter::new();
        writer.write_u16(0x0001);
        writer.write_i32(-1);
        writer.write_zeros(2);
        writer.write_bytes(b"ok");

        assert_eq!(
            writer.into_bytes().as_ref(),
            &[0x00, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, b'o', b'k']
        );
    }
}

//! Minimal NDR 2.0 marshalling helpers
//!
//! Only what the endpoint mapper codecs need: little-endian primitives,
//! natural alignment relative to the start of the stub, UUIDs, unique
//! pointer referents and conformant byte arrays.

use crate::error::NdrError;
use crate::pdu::Uuid;
use bytes::{BufMut, Bytes, BytesMut};

pub type Result<T> = std::result::Result<T, NdrError>;

/// Padding needed to move `position` to the next multiple of `alignment`.
pub fn align_padding(position: usize, alignment: usize) -> usize {
    match position % alignment {
        0 => 0,
        rem => alignment - rem,
    }
}

/// Stub writer tracking its own position for alignment
#[derive(Debug, Default)]
pub struct NdrWriter {
    buf: BytesMut,
    next_referent: u32,
}

impl NdrWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(128),
            next_referent: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn align(&mut self, alignment: usize) {
        let pad = align_padding(self.buf.len(), alignment);
        self.buf.put_bytes(0, pad);
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.align(2);
        self.buf.put_u16_le(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.align(4);
        self.buf.put_u32_le(value);
    }

    pub fn put_uuid(&mut self, uuid: &Uuid) {
        self.align(4);
        self.buf.put_slice(&uuid.to_bytes_le());
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Writes a non-null unique pointer referent ID.
    pub fn put_referent(&mut self) {
        self.next_referent += 1;
        self.put_u32(self.next_referent);
    }

    pub fn put_null_pointer(&mut self) {
        self.put_u32(0);
    }

    /// Writes a conformant byte array prefixed by its own length field, the
    /// layout used by `twr_t` (`max_count`, `length`, octets).
    pub fn put_counted_octets(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.put_u32(data.len() as u32);
        self.put_bytes(data);
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Stub reader with bounds checks on every access
#[derive(Debug)]
pub struct NdrReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> NdrReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(NdrError::BufferUnderflow {
                needed: len,
                have: self.remaining(),
            });
        }
        let slice = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let pad = align_padding(self.position, alignment);
        self.take(pad).map(|_| ())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_uuid(&mut self) -> Result<Uuid> {
        self.align(4)?;
        let b = self.take(16)?;
        Uuid::from_bytes_le(b).ok_or_else(|| NdrError::InvalidData("short UUID".into()))
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Reads the `max_count`/`length` pair written by
    /// [`NdrWriter::put_counted_octets`] and returns the octets.
    pub fn get_counted_octets(&mut self) -> Result<&'a [u8]> {
        let max_count = self.get_u32()? as usize;
        let length = self.get_u32()? as usize;
        if length > max_count {
            return Err(NdrError::InvalidData(format!(
                "octet length {} exceeds conformance {}",
                length, max_count
            )));
        }
        self.take(length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_is_relative_to_stub_start() {
        let mut writer = NdrWriter::new();
        writer.put_u8(1);
        writer.put_u32(0xdeadbeef);
        writer.put_u8(2);
        writer.put_u16(7);
        let data = writer.finish();
        assert_eq!(data.len(), 12);

        let mut reader = NdrReader::new(&data);
        assert_eq!(reader.get_u8().unwrap(), 1);
        assert_eq!(reader.get_u32().unwrap(), 0xdeadbeef);
        assert_eq!(reader.get_u8().unwrap(), 2);
        assert_eq!(reader.get_u16().unwrap(), 7);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_underflow_reports_sizes() {
        let mut reader = NdrReader::new(&[1, 2]);
        assert_eq!(
            reader.get_u32(),
            Err(NdrError::BufferUnderflow { needed: 4, have: 2 })
        );
    }

    #[test]
    fn test_counted_octets_reject_inconsistent_length() {
        let mut writer = NdrWriter::new();
        writer.put_u32(2);
        writer.put_u32(3);
        writer.put_bytes(&[0, 0, 0]);
        let data = writer.finish();
        assert!(matches!(
            NdrReader::new(&data).get_counted_octets(),
            Err(NdrError::InvalidData(_))
        ));
    }
}

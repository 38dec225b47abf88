//! Big-endian binary reader and writer for packet bodies

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PacketError, Result};
use crate::types::{Hash256, Timestamp};

/// Body encoding contract shared by every packet variant.
///
/// The header (type tag, version and, for communication packets, the packet
/// id) is written by the enclosing packet; implementors only handle the
/// fields that follow it.
pub trait WireBody: Sized {
    /// One-byte type tag
    const TAG: u8;

    /// Write the body fields
    fn encode_body(&self, writer: &mut PacketWriter) -> Result<()>;

    /// Read the body fields
    fn decode_body(reader: &mut PacketReader<'_>) -> Result<Self>;
}

/// Append-only packet builder
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    /// Empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer with preallocated capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Write one byte
    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    /// Write a big-endian u16
    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    /// Write a big-endian u32
    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    /// Write a big-endian u64
    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    /// Write a 32-byte hash
    pub fn put_hash(&mut self, hash: &Hash256) {
        self.buf.put_slice(hash.as_bytes());
    }

    /// Write a timestamp as u64 milliseconds; negative values clamp to zero
    pub fn put_timestamp(&mut self, timestamp: Timestamp) {
        self.buf.put_u64(timestamp.as_millis().max(0) as u64);
    }

    /// Write raw bytes without a length prefix
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Write bytes prefixed by a u16 length
    pub fn put_bytes16(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u16::try_from(bytes.len()).map_err(|_| PacketError::TooLarge {
            size: bytes.len(),
            max: u16::MAX as usize,
        })?;
        self.buf.put_u16(len);
        self.buf.put_slice(bytes);
        Ok(())
    }

    /// Write a UTF-8 string prefixed by a u16 length
    pub fn put_string16(&mut self, value: &str) -> Result<()> {
        self.put_bytes16(value.as_bytes())
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing was written
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and return the encoded bytes
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over an encoded packet. Every read checks the remaining length
/// first and reports truncation instead of panicking.
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    /// Start reading `buf`
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.buf.len() < needed {
            return Err(PacketError::Truncated {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    /// Read one byte
    pub fn get_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    /// Read a big-endian u16
    pub fn get_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    /// Read a big-endian u32
    pub fn get_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    /// Read a big-endian u64
    pub fn get_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    /// Read a fixed-size array
    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Read a 32-byte hash
    pub fn get_hash(&mut self) -> Result<Hash256> {
        Ok(Hash256::new(self.get_array::<32>()?))
    }

    /// Read a u64 millisecond timestamp
    pub fn get_timestamp(&mut self) -> Result<Timestamp> {
        let millis = self.get_u64()?;
        Ok(Timestamp::from_millis(i64::try_from(millis).unwrap_or(i64::MAX)))
    }

    /// Read `len` raw bytes
    pub fn get_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        self.ensure(len)?;
        let buf: &'a [u8] = self.buf;
        let (head, tail) = buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Read bytes prefixed by a u16 length
    pub fn get_bytes16(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u16()? as usize;
        self.get_slice(len)
    }

    /// Read a UTF-8 string prefixed by a u16 length
    pub fn get_string16(&mut self) -> Result<String> {
        let bytes = self.get_bytes16()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| PacketError::Malformed(format!("invalid UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_read_back_in_order() {
        let key = Hash256::random();
        let mut writer = PacketWriter::new();
        writer.put_u8(7);
        writer.put_u16(513);
        writer.put_u64(1 << 40);
        writer.put_hash(&key);
        writer.put_string16("hello").unwrap();
        let bytes = writer.into_bytes();

        let mut reader = PacketReader::new(&bytes);
        assert_eq!(reader.get_u8().unwrap(), 7);
        assert_eq!(reader.get_u16().unwrap(), 513);
        assert_eq!(reader.get_u64().unwrap(), 1 << 40);
        assert_eq!(reader.get_hash().unwrap(), key);
        assert_eq!(reader.get_string16().unwrap(), "hello");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_big_endian_layout() {
        let mut writer = PacketWriter::new();
        writer.put_u16(0x0102);
        assert_eq!(&writer.into_bytes()[..], &[0x01, 0x02]);
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let mut reader = PacketReader::new(&[0x00, 0x05, b'a']);
        assert!(matches!(
            reader.get_bytes16(),
            Err(PacketError::Truncated { needed: 5, remaining: 1 })
        ));
    }

    #[test]
    fn test_oversized_field_rejected() {
        let mut writer = PacketWriter::new();
        let big = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(writer.put_bytes16(&big), Err(PacketError::TooLarge { .. })));
    }
}

//! Packet buffer implementation
//!
//! Provides the byte cursor used by every packet handler:
//! - `PacketReader`: sequential little-endian reads over a received payload.
//!   Every read is fallible and reports [`ProtocolError`] instead of garbage.
//! - `PacketWriter`: builds an outbound packet, starting with its opcode.
//!
//! Strings come in two encodings: `string` (u16 length + UTF-8 bytes) and
//! `unicode_string` (u16 length in code units + UTF-16LE).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Maximum packet size (64KB)
pub const MAX_PACKET_SIZE: usize = 65535;

type ReadResult<T> = std::result::Result<T, ProtocolError>;

/// Sequential little-endian reader over an immutable payload
#[derive(Debug, Clone)]
pub struct PacketReader {
    data: Bytes,
    /// Length of the original payload, for position reporting
    len: usize,
}

impl PacketReader {
    /// Wrap a payload
    pub fn new(data: Bytes) -> Self {
        let len = data.len();
        Self { data, len }
    }

    /// Create a reader over a copy of a byte slice
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(bytes))
    }

    /// Current read position
    #[inline]
    pub fn position(&self) -> usize {
        self.len - self.data.len()
    }

    /// Number of bytes remaining to read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Check if there are bytes remaining to read
    #[inline]
    pub fn has_remaining(&self) -> bool {
        !self.data.is_empty()
    }

    #[inline]
    fn ensure(&self, needed: usize) -> ReadResult<()> {
        if self.data.len() < needed {
            return Err(ProtocolError::UnexpectedEof {
                needed,
                remaining: self.data.len(),
            });
        }
        Ok(())
    }

    /// Skip `count` bytes
    pub fn skip(&mut self, count: usize) -> ReadResult<()> {
        self.ensure(count)?;
        self.data.advance(count);
        Ok(())
    }

    pub fn read_u8(&mut self) -> ReadResult<u8> {
        self.ensure(1)?;
        Ok(self.data.get_u8())
    }

    pub fn read_i8(&mut self) -> ReadResult<i8> {
        self.ensure(1)?;
        Ok(self.data.get_i8())
    }

    /// Read a boolean (any non-zero byte is true)
    pub fn read_bool(&mut self) -> ReadResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> ReadResult<u16> {
        self.ensure(2)?;
        Ok(self.data.get_u16_le())
    }

    pub fn read_i16(&mut self) -> ReadResult<i16> {
        self.ensure(2)?;
        Ok(self.data.get_i16_le())
    }

    pub fn read_u32(&mut self) -> ReadResult<u32> {
        self.ensure(4)?;
        Ok(self.data.get_u32_le())
    }

    pub fn read_i32(&mut self) -> ReadResult<i32> {
        self.ensure(4)?;
        Ok(self.data.get_i32_le())
    }

    pub fn read_u64(&mut self) -> ReadResult<u64> {
        self.ensure(8)?;
        Ok(self.data.get_u64_le())
    }

    pub fn read_i64(&mut self) -> ReadResult<i64> {
        self.ensure(8)?;
        Ok(self.data.get_i64_le())
    }

    pub fn read_f32(&mut self) -> ReadResult<f32> {
        self.ensure(4)?;
        Ok(self.data.get_f32_le())
    }

    /// Read exactly `length` bytes without copying
    pub fn read_bytes(&mut self, length: usize) -> ReadResult<Bytes> {
        self.ensure(length)?;
        Ok(self.data.split_to(length))
    }

    /// Read a u16-length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> ReadResult<String> {
        let length = self.read_u16()? as usize;
        let raw = self.read_bytes(length)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidStringEncoding)
    }

    /// Read a u16-length-prefixed UTF-16LE string (length counts code units)
    pub fn read_unicode_string(&mut self) -> ReadResult<String> {
        let units = self.read_u16()? as usize;
        self.ensure(units * 2)?;
        let mut buf = Vec::with_capacity(units);
        for _ in 0..units {
            buf.push(self.data.get_u16_le());
        }
        String::from_utf16(&buf).map_err(|_| ProtocolError::InvalidStringEncoding)
    }

    /// Consume the rest of the payload
    pub fn read_remaining(&mut self) -> Bytes {
        let len = self.data.len();
        self.data.split_to(len)
    }
}

/// Outbound packet builder
#[derive(Debug, Clone)]
pub struct PacketWriter {
    data: BytesMut,
}

impl PacketWriter {
    /// Start a packet with the given opcode
    pub fn new(opcode: u16) -> Self {
        let mut data = BytesMut::with_capacity(64);
        data.put_u16_le(opcode);
        Self { data }
    }

    /// Current length including the opcode
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.data.put_u8(value);
        self
    }

    pub fn write_i8(&mut self, value: i8) -> &mut Self {
        self.data.put_i8(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.data.put_u8(value as u8);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.data.put_u16_le(value);
        self
    }

    pub fn write_i16(&mut self, value: i16) -> &mut Self {
        self.data.put_i16_le(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.data.put_u32_le(value);
        self
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.data.put_i32_le(value);
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.data.put_u64_le(value);
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.data.put_i64_le(value);
        self
    }

    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        self.data.put_f32_le(value);
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.put_slice(bytes);
        self
    }

    /// Write a u16-length-prefixed UTF-8 string (truncated to u16::MAX bytes)
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        let bytes = value.as_bytes();
        let len = bytes.len().min(u16::MAX as usize);
        self.data.put_u16_le(len as u16);
        self.data.put_slice(&bytes[..len]);
        self
    }

    /// Write a u16-length-prefixed UTF-16LE string
    pub fn write_unicode_string(&mut self, value: &str) -> &mut Self {
        let units: Vec<u16> = value.encode_utf16().take(u16::MAX as usize).collect();
        self.data.put_u16_le(units.len() as u16);
        for unit in units {
            self.data.put_u16_le(unit);
        }
        self
    }

    /// Finish the packet
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }
}

//! Byte-level reader and writer for replication protocol frames
//!
//! All integers are in network byte order. Reads are bounds-checked and
//! surface truncated input as protocol errors instead of panicking.

use crate::error::{CdcError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Cursor over one protocol frame
pub struct WireReader {
    data: Bytes,
}

impl WireReader {
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Zero-copy reader over an owned frame
    pub fn from_bytes(data: Bytes) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    fn ensure_bytes(&self, count: usize) -> Result<()> {
        if self.data.remaining() < count {
            return Err(CdcError::protocol(format!(
                "Not enough bytes remaining. Need {}, have {}",
                count,
                self.data.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure_bytes(1)?;
        Ok(self.data.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure_bytes(2)?;
        Ok(self.data.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure_bytes(4)?;
        Ok(self.data.get_u32())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure_bytes(4)?;
        Ok(self.data.get_i32())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure_bytes(8)?;
        Ok(self.data.get_u64())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure_bytes(8)?;
        Ok(self.data.get_i64())
    }

    /// Read a null-terminated UTF-8 string
    pub fn read_cstring(&mut self) -> Result<String> {
        let end = self
            .data
            .chunk()
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| CdcError::protocol("Unterminated string in buffer"))?;
        let raw = self.data.copy_to_bytes(end);
        self.data.advance(1);
        String::from_utf8(raw.to_vec())
            .map_err(|e| CdcError::protocol(format!("Invalid UTF-8 in string: {}", e)))
    }

    pub fn read_bytes(&mut self, length: usize) -> Result<Bytes> {
        self.ensure_bytes(length)?;
        Ok(self.data.copy_to_bytes(length))
    }

    pub fn peek_u8(&self) -> Result<u8> {
        self.ensure_bytes(1)?;
        Ok(self.data.chunk()[0])
    }
}

/// Frame builder, used for standby status updates and test fixtures
#[derive(Default)]
pub struct WireWriter {
    data: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.data.put_u8(value);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.data.put_u16(value);
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.data.put_u32(value);
        self
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.data.put_i32(value);
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.data.put_u64(value);
        self
    }

    pub fn i64(&mut self, value: i64) -> &mut Self {
        self.data.put_i64(value);
        self
    }

    pub fn cstring(&mut self, s: &str) -> &mut Self {
        self.data.put_slice(s.as_bytes());
        self.data.put_u8(0);
        self
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.put_slice(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn finish(&mut self) -> Bytes {
        self.data.split().freeze()
    }
}

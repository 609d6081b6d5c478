//! Checked big-endian readers and writers for the session wire format.
//!
//! `bytes::Buf` accessors panic on short input, so every read here checks the
//! remaining length first and reports a truncated frame as a decode error.

use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

/// Cursor over a received frame.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    fn ensure(&self, len: usize) -> Result<()> {
        if self.buf.len() < len {
            return Err(ProtocolError::DecodeError(format!(
                "{} (needed {} bytes, had {})",
                constants::ERR_TRUNCATED_FRAME,
                len,
                self.buf.len()
            )));
        }
        Ok(())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.ensure(4)?;
        Ok(self.buf.get_f32())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.ensure(8)?;
        Ok(self.buf.get_f64())
    }

    pub fn read_uuid(&mut self) -> Result<Uuid> {
        self.ensure(16)?;
        let mut raw = [0u8; 16];
        self.buf.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    /// Borrow exactly `len` bytes.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// A `u32` length prefix followed by that many bytes.
    pub fn read_length_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_slice(len)
    }

    /// Everything not yet consumed.
    pub fn rest(self) -> &'a [u8] {
        self.buf
    }
}

/// Builder for outgoing frames.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn put_f32(&mut self, value: f32) -> &mut Self {
        self.buf.put_f32(value);
        self
    }

    pub fn put_f64(&mut self, value: f64) -> &mut Self {
        self.buf.put_f64(value);
        self
    }

    pub fn put_uuid(&mut self, value: &Uuid) -> &mut Self {
        self.buf.put_slice(value.as_bytes());
        self
    }

    pub fn put_slice(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_slice(value);
        self
    }

    pub fn put_length_prefixed(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_reads_fail_cleanly() {
        let mut reader = WireReader::new(&[0, 0, 1]);
        assert!(matches!(
            reader.read_u32(),
            Err(ProtocolError::DecodeError(_))
        ));

        let mut reader = WireReader::new(&[0, 0, 0, 9, 1, 2]);
        assert!(reader.read_length_prefixed().is_err());
    }

    #[test]
    fn test_mixed_fields() {
        let id = Uuid::new_v4();
        let mut writer = WireWriter::new();
        writer
            .put_u32(7)
            .put_uuid(&id)
            .put_f64(1.5)
            .put_length_prefixed(b"abc")
            .put_slice(b"tail");
        let bytes = writer.finish();

        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.read_u32().unwrap(), 7);
        assert_eq!(reader.read_uuid().unwrap(), id);
        assert_eq!(reader.read_f64().unwrap(), 1.5);
        assert_eq!(reader.read_length_prefixed().unwrap(), b"abc");
        assert_eq!(reader.rest(), b"tail");
    }
}

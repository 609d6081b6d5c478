//! Fragmentation of oversized messages and their per-connection reassembly.
//!
//! Frame layout: `[CHUNK(4)] [index(4)] [total(4)] [slice...]`.
//!
//! The transport is reliable and in-order, so fragments of one logical
//! message arrive consecutively. Anything else means corruption or an
//! adversarial peer and is reported as a protocol violation.

use crate::core::wire::WireWriter;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::CHUNK;
use tracing::debug;

/// Upper bound on fragments per logical message.
pub const MAX_CHUNK_COUNT: u32 = 1024;

/// Bytes of chunk framing before the slice.
pub const CHUNK_HEADER_LEN: usize = 12;

/// Split `message` into chunk frames of at most `max_chunk_payload` slice bytes.
///
/// Returns the message unchanged (one frame) when it already fits.
pub fn split_message(message: &[u8], max_chunk_payload: usize) -> Result<Vec<Vec<u8>>> {
    let max_chunk_payload = max_chunk_payload.max(1);
    if message.len() <= max_chunk_payload {
        return Ok(vec![message.to_vec()]);
    }

    let total = message.len().div_ceil(max_chunk_payload);
    if total > MAX_CHUNK_COUNT as usize {
        return Err(ProtocolError::Custom(format!(
            "{}: {} bytes would need {} chunks",
            constants::ERR_CHUNK_TOO_MANY,
            message.len(),
            total
        )));
    }

    let frames = message
        .chunks(max_chunk_payload)
        .enumerate()
        .map(|(index, slice)| {
            let mut writer = WireWriter::with_capacity(CHUNK_HEADER_LEN + slice.len());
            writer
                .put_u32(CHUNK)
                .put_u32(index as u32)
                .put_u32(total as u32)
                .put_slice(slice);
            writer.finish()
        })
        .collect();
    Ok(frames)
}

/// Check the framing rules that hold for every fragment on its own.
pub fn validate_chunk_header(index: u32, total: u32) -> Result<()> {
    if total <= 1 {
        return Err(ProtocolError::ProtocolViolation(format!(
            "{} (total {})",
            constants::ERR_CHUNK_TOTAL_TOO_SMALL,
            total
        )));
    }
    if total > MAX_CHUNK_COUNT {
        return Err(ProtocolError::ProtocolViolation(format!(
            "{} (total {})",
            constants::ERR_CHUNK_TOTAL_TOO_LARGE,
            total
        )));
    }
    if index >= total {
        return Err(ProtocolError::ProtocolViolation(format!(
            "{} (index {} of {})",
            constants::ERR_CHUNK_INDEX_OUT_OF_RANGE,
            index,
            total
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct Assembly {
    total: u32,
    next_index: u32,
    data: Vec<u8>,
}

/// Accumulates the fragments of at most one logical message.
#[derive(Debug)]
pub struct ChunkReassembler {
    current: Option<Assembly>,
    max_message_len: usize,
}

impl Default for ChunkReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkReassembler {
    /// A reassembler with no bound on the rebuilt message size.
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// A reassembler that refuses to rebuild more than `max_message_len` bytes.
    pub fn with_limit(max_message_len: usize) -> Self {
        Self {
            current: None,
            max_message_len,
        }
    }

    /// Limit for a peer whose fragments carry at most `max_chunk_payload` bytes.
    pub fn for_payload(max_chunk_payload: usize) -> Self {
        Self::with_limit(max_chunk_payload.saturating_mul(MAX_CHUNK_COUNT as usize))
    }

    /// Whether a message is partially assembled.
    pub fn in_progress(&self) -> bool {
        self.current.is_some()
    }

    pub fn clear(&mut self) {
        self.current = None;
    }

    /// Feed one fragment. Returns the whole message once the last one arrives.
    ///
    /// Any error leaves the buffer cleared.
    pub fn push(&mut self, index: u32, total: u32, slice: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Err(e) = validate_chunk_header(index, total) {
            self.current = None;
            return Err(e);
        }

        if index == 0 {
            if let Some(stale) = self.current.take() {
                debug!(
                    received = stale.next_index,
                    total = stale.total,
                    "Discarding unfinished chunk assembly"
                );
            }
            self.current = Some(Assembly {
                total,
                next_index: 0,
                data: Vec::with_capacity(
                    slice
                        .len()
                        .saturating_mul(total as usize)
                        .min(self.max_message_len)
                        .min(1 << 24),
                ),
            });
        }

        let assembly = match self.current.as_mut() {
            Some(assembly) if assembly.total == total && assembly.next_index == index => assembly,
            _ => {
                self.current = None;
                return Err(ProtocolError::ProtocolViolation(format!(
                    "{} (index {} of {})",
                    constants::ERR_CHUNK_OUT_OF_ORDER,
                    index,
                    total
                )));
            }
        };

        if assembly.data.len().saturating_add(slice.len()) > self.max_message_len {
            let buffered = assembly.data.len();
            self.current = None;
            return Err(ProtocolError::ProtocolViolation(format!(
                "{} ({} bytes buffered, limit {})",
                constants::ERR_CHUNK_ASSEMBLY_TOO_LARGE,
                buffered + slice.len(),
                self.max_message_len
            )));
        }

        assembly.data.extend_from_slice(slice);
        assembly.next_index += 1;

        if index + 1 == total {
            let finished = self.current.take().map(|assembly| assembly.data);
            return Ok(finished);
        }
        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::wire::WireReader;

    fn feed(reassembler: &mut ChunkReassembler, frame: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut reader = WireReader::new(frame);
        assert_eq!(reader.read_u32().unwrap(), CHUNK);
        let index = reader.read_u32().unwrap();
        let total = reader.read_u32().unwrap();
        reassembler.push(index, total, reader.rest())
    }

    #[test]
    fn test_small_message_is_not_split() {
        let frames = split_message(b"hello", 16).unwrap();
        assert_eq!(frames, vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_split_and_reassemble() {
        let message: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let frames = split_message(&message, 64).unwrap();
        assert_eq!(frames.len(), 16);

        let mut reassembler = ChunkReassembler::new();
        for frame in &frames[..frames.len() - 1] {
            assert_eq!(feed(&mut reassembler, frame).unwrap(), None);
        }
        let done = feed(&mut reassembler, frames.last().unwrap()).unwrap();
        assert_eq!(done.unwrap(), message);
        assert!(!reassembler.in_progress());
    }

    #[test]
    fn test_too_many_chunks_refused_on_send() {
        let message = vec![0u8; 1025];
        assert!(split_message(&message, 1).is_err());
        assert_eq!(split_message(&vec![0u8; 1024], 1).unwrap().len(), 1024);
    }

    #[test]
    fn test_header_rules() {
        let mut reassembler = ChunkReassembler::new();
        for (index, total) in [(0, 0), (0, 1), (0, 1025), (2, 2), (5, 3)] {
            let err = reassembler.push(index, total, b"x").unwrap_err();
            assert!(err.is_connection_fatal(), "{index}/{total} should be fatal");
        }
    }

    #[test]
    fn test_index_zero_discards_unfinished_assembly() {
        let mut reassembler = ChunkReassembler::new();
        reassembler.push(0, 3, b"old").unwrap();
        reassembler.push(1, 3, b"old").unwrap();

        reassembler.push(0, 2, b"new-").unwrap();
        let done = reassembler.push(1, 2, b"msg").unwrap();
        assert_eq!(done.unwrap(), b"new-msg");
    }

    #[test]
    fn test_assembly_beyond_limit_is_a_violation() {
        let mut reassembler = ChunkReassembler::with_limit(10);
        reassembler.push(0, 3, b"abcd").unwrap();
        reassembler.push(1, 3, b"efgh").unwrap();
        let err = reassembler.push(2, 3, b"ijk").unwrap_err();
        assert!(err.is_connection_fatal());
        assert!(err.to_string().contains("too large"));
        assert!(!reassembler.in_progress());

        let mut exact = ChunkReassembler::with_limit(10);
        exact.push(0, 2, b"abcde").unwrap();
        assert_eq!(exact.push(1, 2, b"fghij").unwrap().unwrap(), b"abcdefghij");
    }

    #[test]
    fn test_gaps_and_orphans_are_violations() {
        let mut reassembler = ChunkReassembler::new();
        assert!(reassembler.push(1, 3, b"orphan").is_err());

        reassembler.push(0, 3, b"a").unwrap();
        assert!(reassembler.push(2, 3, b"c").is_err());
        assert!(!reassembler.in_progress());

        reassembler.push(0, 3, b"a").unwrap();
        assert!(reassembler.push(1, 4, b"b").is_err());
    }
}

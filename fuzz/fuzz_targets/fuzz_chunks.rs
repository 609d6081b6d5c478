#![no_main]

use libfuzzer_sys::fuzz_target;
use session_net::protocol::chunking::ChunkReassembler;
use session_net::protocol::dispatcher::{decode_envelope, Envelope};

fuzz_target!(|data: &[u8]| {
    // Treat the input as a sequence of 2-byte-length-prefixed frames fed to one reassembler
    let mut reassembler = ChunkReassembler::new();
    let mut rest = data;
    while rest.len() >= 2 {
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[2..];
        let take = len.min(rest.len());
        let (frame, tail) = rest.split_at(take);
        rest = tail;
        if let Ok(Envelope::Chunk { index, total, data }) = decode_envelope(frame) {
            let _ = reassembler.push(index, total, data);
        }
    }
});

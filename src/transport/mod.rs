//! # Transport Layer
//!
//! Byte pipes between peers. A transport only moves whole frames; it knows
//! nothing about discriminators, handshakes or chunking.
//!
//! ## Implementations
//! - **Memory**: paired in-process channels for tests and listen servers
//! - **Stream**: length-delimited frames over any `AsyncRead + AsyncWrite`,
//!   read on a tokio worker task
//!
//! Frames arriving on a worker are buffered in a channel and handed to the
//! session layer only when `NetworkSystem::tick` calls `poll_incoming`.

use crate::error::Result;

pub mod memory;
pub mod stream;

/// A frame pipe to one remote peer.
pub trait Transport: Send {
    /// Hand every frame received since the last call to `sink`, in order.
    fn poll_incoming(&mut self, sink: &mut dyn FnMut(Vec<u8>));

    /// Queue one frame for delivery.
    fn send_raw(&mut self, frame: &[u8]) -> Result<()>;

    /// Per-tick housekeeping, called before `poll_incoming`.
    fn tick(&mut self) {}

    /// Stop sending and receiving. Idempotent.
    fn close(&mut self, reason: &str);

    fn is_open(&self) -> bool;
}

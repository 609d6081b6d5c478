//! In-process transport pair.

use crate::error::{ProtocolError, Result};
use crate::transport::Transport;
use tokio::sync::mpsc;
use tracing::debug;

/// One end of an in-memory frame pipe.
///
/// Closing either end makes the other report `is_open() == false`.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: bool,
}

impl MemoryTransport {
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: a_tx,
                rx: a_rx,
                closed: false,
            },
            Self {
                tx: b_tx,
                rx: b_rx,
                closed: false,
            },
        )
    }
}

impl Transport for MemoryTransport {
    fn poll_incoming(&mut self, sink: &mut dyn FnMut(Vec<u8>)) {
        while let Ok(frame) = self.rx.try_recv() {
            sink(frame);
        }
    }

    fn send_raw(&mut self, frame: &[u8]) -> Result<()> {
        if self.closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.tx
            .send(frame.to_vec())
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn close(&mut self, reason: &str) {
        if !self.closed {
            debug!(%reason, "Closing memory transport");
            self.closed = true;
            self.rx.close();
        }
    }

    fn is_open(&self) -> bool {
        !self.closed && !self.tx.is_closed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_cross_in_order() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.send_raw(b"one").unwrap();
        a.send_raw(b"two").unwrap();

        let mut received = Vec::new();
        b.poll_incoming(&mut |frame| received.push(frame));
        assert_eq!(received, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_close_is_seen_by_peer() {
        let (mut a, mut b) = MemoryTransport::pair();
        assert!(b.is_open());
        a.close("done");
        assert!(!a.is_open());
        assert!(!b.is_open());
        assert!(b.send_raw(b"late").is_err());
        assert!(a.send_raw(b"late").is_err());
    }
}

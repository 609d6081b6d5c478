//! Per-peer connection state.
//!
//! A `Connection` is created when a transport is accepted or joined and lives
//! in the `NetworkSystem` roster until it is kicked or disconnected. Only the
//! handshake handlers, the heartbeat monitor and client ticks mutate it.

use crate::error::{ProtocolError, Result};
use crate::protocol::chunking::ChunkReassembler;
use crate::transport::Transport;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque 128-bit connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The empty id; as a routing target it means "whoever receives this".
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Scopes one handshake attempt. A restart issues a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandshakeId(Uuid);

impl HandshakeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandshakeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandshakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handshake progress of a connection. Ordered; only ever advances one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    Unconnected,
    LoadingServerInformation,
    Welcome,
    MountVpks,
    Snapshot,
    Connected,
}

impl ChannelState {
    /// The only state this one may advance to.
    pub fn next(self) -> Option<Self> {
        match self {
            ChannelState::Unconnected => Some(ChannelState::LoadingServerInformation),
            ChannelState::LoadingServerInformation => Some(ChannelState::Welcome),
            ChannelState::Welcome => Some(ChannelState::MountVpks),
            ChannelState::MountVpks => Some(ChannelState::Snapshot),
            ChannelState::Snapshot => Some(ChannelState::Connected),
            ChannelState::Connected => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChannelState::Unconnected => "Unconnected",
            ChannelState::LoadingServerInformation => "LoadingServerInformation",
            ChannelState::Welcome => "Welcome",
            ChannelState::MountVpks => "MountVpks",
            ChannelState::Snapshot => "Snapshot",
            ChannelState::Connected => "Connected",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Round-trip and traffic aggregates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStats {
    /// Seconds, most recent accepted sample
    pub rtt_last: f64,
    /// Seconds, exponential moving average
    pub rtt_average: f64,
    pub rtt_min: f64,
    pub rtt_max: f64,
    pub rtt_samples: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl ConnectionStats {
    const RTT_SMOOTHING: f64 = 0.1;

    /// Fold an already clamped RTT sample into the aggregates.
    pub fn record_rtt(&mut self, rtt: f64) {
        if self.rtt_samples == 0 {
            self.rtt_average = rtt;
            self.rtt_min = rtt;
            self.rtt_max = rtt;
        } else {
            self.rtt_average += (rtt - self.rtt_average) * Self::RTT_SMOOTHING;
            self.rtt_min = self.rtt_min.min(rtt);
            self.rtt_max = self.rtt_max.max(rtt);
        }
        self.rtt_last = rtt;
        self.rtt_samples += 1;
    }
}

/// Asynchronous handshake work a connection is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Host gathering its mounted content list for a joining client
    ServeMountedContent,
    /// Client mounting the host's content
    MountContent,
    /// Client applying the initial snapshot
    ApplySnapshot,
}

/// Result of a finished asynchronous handshake step.
#[derive(Debug)]
pub enum StepOutput {
    MountedContent(Vec<String>),
    Mounted,
    SnapshotApplied,
}

/// A suspended handshake step. Dropping it abandons the work.
pub struct PendingStep {
    pub kind: StepKind,
    pub handshake_id: HandshakeId,
    pub future: BoxFuture<'static, Result<StepOutput>>,
}

impl fmt::Debug for PendingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingStep")
            .field("kind", &self.kind)
            .field("handshake_id", &self.handshake_id)
            .finish_non_exhaustive()
    }
}

/// One peer in the session roster.
pub struct Connection {
    id: ConnectionId,
    is_host: bool,
    state: ChannelState,
    handshake_id: Option<HandshakeId>,
    pub display_name: String,
    pub stats: ConnectionStats,
    pub visibility_origins: Vec<[f32; 3]>,
    pub(crate) chunks: ChunkReassembler,
    pub(crate) pending: Option<PendingStep>,
    transport: Box<dyn Transport>,
}

impl Connection {
    /// Wrap a transport. `is_host` flags the remote peer as the session host.
    pub fn new(id: ConnectionId, is_host: bool, transport: Box<dyn Transport>) -> Self {
        Self {
            id,
            is_host,
            state: ChannelState::Unconnected,
            handshake_id: None,
            display_name: String::new(),
            stats: ConnectionStats::default(),
            visibility_origins: Vec::new(),
            chunks: ChunkReassembler::new(),
            pending: None,
            transport,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Re-key under the id the host uses for itself.
    pub(crate) fn set_id(&mut self, id: ConnectionId) {
        self.id = id;
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn handshake_id(&self) -> Option<HandshakeId> {
        self.handshake_id
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    pub fn has_pending_step(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether `id` is the handshake attempt currently in progress.
    pub fn handshake_matches(&self, id: HandshakeId) -> bool {
        self.handshake_id == Some(id)
    }

    /// Move exactly one step forward.
    pub fn advance_to(&mut self, next: ChannelState) -> Result<()> {
        if self.state.next() != Some(next) {
            return Err(ProtocolError::ProtocolViolation(format!(
                "Invalid Handshake State {} (cannot move to {})",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Start (or restart) a handshake attempt from `Unconnected`.
    pub(crate) fn begin_handshake(&mut self, id: HandshakeId) -> Result<()> {
        self.advance_to(ChannelState::LoadingServerInformation)?;
        self.handshake_id = Some(id);
        Ok(())
    }

    /// Rewind to `Unconnected` for a restart; identity and stats survive.
    pub(crate) fn reset_handshake(&mut self) {
        self.state = ChannelState::Unconnected;
        self.handshake_id = None;
        self.pending = None;
        self.chunks.clear();
    }

    pub fn send_raw(&mut self, frame: &[u8]) -> Result<()> {
        self.transport.send_raw(frame)?;
        self.stats.messages_out += 1;
        self.stats.bytes_out += frame.len() as u64;
        Ok(())
    }

    pub(crate) fn poll_incoming(&mut self, sink: &mut dyn FnMut(Vec<u8>)) {
        self.transport.tick();
        self.transport.poll_incoming(sink);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub(crate) fn close(&mut self, reason: &str) {
        self.pending = None;
        self.chunks.clear();
        self.transport.close(reason);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("is_host", &self.is_host)
            .field("state", &self.state)
            .field("handshake_id", &self.handshake_id)
            .field("display_name", &self.display_name)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;

    fn connection() -> Connection {
        let (a, _b) = MemoryTransport::pair();
        Connection::new(ConnectionId::new(), false, Box::new(a))
    }

    #[test]
    fn test_states_advance_in_order_only() {
        let mut conn = connection();
        assert!(conn.advance_to(ChannelState::Welcome).is_err());
        assert_eq!(conn.state(), ChannelState::Unconnected);

        conn.begin_handshake(HandshakeId::new()).unwrap();
        conn.advance_to(ChannelState::Welcome).unwrap();
        assert!(conn.advance_to(ChannelState::LoadingServerInformation).is_err());
        assert!(conn.advance_to(ChannelState::Snapshot).is_err());
        conn.advance_to(ChannelState::MountVpks).unwrap();
        conn.advance_to(ChannelState::Snapshot).unwrap();
        conn.advance_to(ChannelState::Connected).unwrap();
        assert!(conn.advance_to(ChannelState::Connected).is_err());
        assert!(conn.is_connected());
    }

    #[test]
    fn test_reset_keeps_identity() {
        let mut conn = connection();
        let id = conn.id();
        let first = HandshakeId::new();
        conn.begin_handshake(first).unwrap();
        conn.stats.record_rtt(0.05);
        conn.reset_handshake();

        assert_eq!(conn.id(), id);
        assert_eq!(conn.state(), ChannelState::Unconnected);
        assert!(!conn.handshake_matches(first));
        assert_eq!(conn.stats.rtt_samples, 1);
    }

    #[test]
    fn test_rtt_aggregates() {
        let mut stats = ConnectionStats::default();
        stats.record_rtt(0.1);
        stats.record_rtt(0.3);
        assert_eq!(stats.rtt_last, 0.3);
        assert_eq!(stats.rtt_min, 0.1);
        assert_eq!(stats.rtt_max, 0.3);
        assert!((stats.rtt_average - 0.12).abs() < 1e-9);
        assert_eq!(stats.rtt_samples, 2);
    }
}

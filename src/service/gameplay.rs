//! The gameplay collaborator the session layer reports to.
//!
//! Snapshot contents, content mounting and delta compression belong to the
//! game; this layer only moves their bytes and calls these hooks at the right
//! points of the connection lifecycle. Hooks run on the thread that calls
//! `NetworkSystem::tick`.

use crate::error::{ProtocolError, Result};
use crate::protocol::connection::{Connection, ConnectionId};
use crate::protocol::dispatcher::MessageContext;
use crate::protocol::message::DeltaKind;
use futures::future::{self, BoxFuture, FutureExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::Poll;

pub trait GameplaySystem: Send {
    /// Host: decide whether a peer may join. `Err` carries the kick reason.
    fn accept_connection(&mut self, _conn: &Connection) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Host: the peer was welcomed; replicate the object table to it.
    fn on_connected(&mut self, _conn: &Connection) {}

    /// Either side: the handshake finished for this connection.
    fn on_joined(&mut self, _conn: &Connection) {}

    fn on_disconnected(&mut self, _conn: &Connection, _reason: &str) {}

    /// Host: full serialized state for a joining peer.
    fn get_snapshot(&mut self, conn: &Connection) -> Result<Vec<u8>>;

    /// Client: load the initial snapshot. An error is fatal to the session.
    fn apply_snapshot(&mut self, snapshot: Vec<u8>) -> BoxFuture<'static, Result<()>>;

    fn on_delta_snapshot(&mut self, _source: &MessageContext, _kind: DeltaKind, _data: &[u8]) {}

    fn on_cull_state_change(&mut self, _source: &MessageContext, _data: &[u8]) {}

    /// Host: trailing command blob of a client tick. Origins are already on `conn`.
    fn on_client_tick(&mut self, _conn: &Connection, _commands: &[u8]) {}

    /// Client: host heartbeat, for clock reconciliation.
    fn on_heartbeat(&mut self, _real_time: f64, _sim_time: f64) {}

    /// Host: names of the content packages mounted in this session.
    fn get_mounted_content(&mut self) -> BoxFuture<'static, Result<Vec<String>>>;

    /// Client: mount the host's content before the snapshot arrives.
    fn mount_content(&mut self, content: Vec<String>) -> BoxFuture<'static, Result<()>>;

    /// Simulation clock sent along with pings.
    fn simulation_time(&self) -> f64 {
        0.0
    }
}

/// Everything `MemoryGameplay` has been told, plus its canned answers.
#[derive(Debug, Default, Clone)]
pub struct MemoryGameplayState {
    pub snapshot: Vec<u8>,
    pub mounted_content: Vec<String>,
    pub refuse_with: Option<String>,
    pub fail_snapshot: bool,
    pub sim_time: f64,

    pub connected: Vec<ConnectionId>,
    pub joined: Vec<ConnectionId>,
    pub disconnected: Vec<(ConnectionId, String)>,
    pub applied_snapshots: Vec<Vec<u8>>,
    pub mounted: Vec<String>,
    pub deltas: Vec<(ConnectionId, DeltaKind, Vec<u8>)>,
    pub cull_states: Vec<(ConnectionId, Vec<u8>)>,
    pub client_ticks: Vec<(ConnectionId, Vec<u8>)>,
    pub heartbeats: Vec<(f64, f64)>,
}

/// In-memory `GameplaySystem` for tools, demos and tests.
///
/// Clones share state. While `hold_async` is set, asynchronous steps stay
/// pending until `release_async` is called.
#[derive(Debug, Clone, Default)]
pub struct MemoryGameplay {
    state: Arc<Mutex<MemoryGameplayState>>,
    gate: Arc<AtomicBool>,
    hold: bool,
}

impl MemoryGameplay {
    pub fn new(snapshot: Vec<u8>, mounted_content: Vec<String>) -> Self {
        let gameplay = Self::default();
        {
            let mut state = gameplay.state();
            state.snapshot = snapshot;
            state.mounted_content = mounted_content;
        }
        gameplay
    }

    /// Keep async steps pending until released.
    pub fn hold_async(mut self) -> Self {
        self.hold = true;
        self
    }

    pub fn release_async(&self) {
        self.gate.store(true, Ordering::Release);
    }

    pub fn state(&self) -> MutexGuard<'_, MemoryGameplayState> {
        // poisoning only happens if a test panicked while holding the lock
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn gated<T: Send + 'static>(&self, value: Result<T>) -> BoxFuture<'static, Result<T>> {
        if !self.hold {
            return future::ready(value).boxed();
        }
        let gate = self.gate.clone();
        let mut value = Some(value);
        future::poll_fn(move |_| {
            if gate.load(Ordering::Acquire) {
                match value.take() {
                    Some(value) => Poll::Ready(value),
                    None => Poll::Pending,
                }
            } else {
                Poll::Pending
            }
        })
        .boxed()
    }
}

impl GameplaySystem for MemoryGameplay {
    fn accept_connection(&mut self, _conn: &Connection) -> std::result::Result<(), String> {
        match self.state().refuse_with.clone() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    fn on_connected(&mut self, conn: &Connection) {
        self.state().connected.push(conn.id());
    }

    fn on_joined(&mut self, conn: &Connection) {
        self.state().joined.push(conn.id());
    }

    fn on_disconnected(&mut self, conn: &Connection, reason: &str) {
        self.state().disconnected.push((conn.id(), reason.to_string()));
    }

    fn get_snapshot(&mut self, _conn: &Connection) -> Result<Vec<u8>> {
        Ok(self.state().snapshot.clone())
    }

    fn apply_snapshot(&mut self, snapshot: Vec<u8>) -> BoxFuture<'static, Result<()>> {
        let result = {
            let mut state = self.state();
            if state.fail_snapshot {
                Err(ProtocolError::SnapshotApply(
                    "snapshot references unknown object types".into(),
                ))
            } else {
                state.applied_snapshots.push(snapshot);
                Ok(())
            }
        };
        self.gated(result)
    }

    fn on_delta_snapshot(&mut self, source: &MessageContext, kind: DeltaKind, data: &[u8]) {
        self.state().deltas.push((source.source, kind, data.to_vec()));
    }

    fn on_cull_state_change(&mut self, source: &MessageContext, data: &[u8]) {
        self.state().cull_states.push((source.source, data.to_vec()));
    }

    fn on_client_tick(&mut self, conn: &Connection, commands: &[u8]) {
        self.state().client_ticks.push((conn.id(), commands.to_vec()));
    }

    fn on_heartbeat(&mut self, real_time: f64, sim_time: f64) {
        self.state().heartbeats.push((real_time, sim_time));
    }

    fn get_mounted_content(&mut self) -> BoxFuture<'static, Result<Vec<String>>> {
        let content = self.state().mounted_content.clone();
        self.gated(Ok(content))
    }

    fn mount_content(&mut self, content: Vec<String>) -> BoxFuture<'static, Result<()>> {
        self.state().mounted.extend(content);
        self.gated(Ok(()))
    }

    fn simulation_time(&self) -> f64 {
        self.state().sim_time
    }
}

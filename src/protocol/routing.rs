//! Relaying targeted messages to connections the sender cannot reach directly.

use crate::error::constants;
use crate::protocol::connection::ConnectionId;
use tracing::debug;

/// Where a targeted message goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// The forwarding connection lied about the sender.
    Kick(String),
    /// Unwrap and dispatch here as if received from `source`. `relayed` is set
    /// when the payload was written by someone other than the forwarding peer.
    DeliverLocal {
        source: ConnectionId,
        source_is_host: bool,
        relayed: bool,
    },
    /// Send the frame on, unchanged, to `target`.
    Forward { target: ConnectionId },
    /// Target unknown here; best-effort delivery gives up.
    Drop,
}

/// Trust and routing rules shared by both targeted message variants.
#[derive(Debug, Clone, Copy)]
pub struct TargetedRouter {
    local_id: ConnectionId,
}

impl TargetedRouter {
    pub fn new(local_id: ConnectionId) -> Self {
        Self { local_id }
    }

    pub fn local_id(&self) -> ConnectionId {
        self.local_id
    }

    /// Decide the fate of a targeted message.
    ///
    /// `lookup` reports whether a connection id is in the local roster and,
    /// if so, whether it is the host.
    pub fn route<L>(
        &self,
        origin: ConnectionId,
        origin_is_host: bool,
        sender_id: ConnectionId,
        target_id: ConnectionId,
        lookup: L,
    ) -> RouteDecision
    where
        L: Fn(ConnectionId) -> Option<bool>,
    {
        // Only the host may relay on someone else's behalf.
        if sender_id != origin && !origin_is_host {
            return RouteDecision::Kick(format!(
                "{} (claimed {}, arrived from {})",
                constants::ERR_SENDER_SPOOFED,
                sender_id,
                origin
            ));
        }

        if target_id.is_nil() || target_id == self.local_id {
            let (source, source_is_host) = match lookup(sender_id) {
                Some(is_host) => (sender_id, is_host),
                // Unknown sender: attribute to the physical origin, but a
                // relayed payload never inherits the relay's host flag.
                None => (origin, origin_is_host && sender_id == origin),
            };
            return RouteDecision::DeliverLocal {
                source,
                source_is_host,
                relayed: sender_id != origin,
            };
        }

        match lookup(target_id) {
            Some(_) => RouteDecision::Forward { target: target_id },
            None => {
                debug!(target = %target_id, sender = %sender_id, "Dropping targeted message for unknown connection");
                RouteDecision::Drop
            }
        }
    }
}

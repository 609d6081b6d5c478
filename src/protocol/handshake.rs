//! Ordered join handshake between a host and a client.
//!
//! ```text
//! host                                  client
//!  | ServerInfo(id)                  ->  | Unconnected -> LoadingServerInformation
//!  | <- UserInfo(id)                     |
//!  | LoadingServerInformation -> Welcome |
//!  | Welcome(id)                     ->  | -> Welcome
//!  | <- RequestMountedVpks(id)           |
//!  | (async) -> MountVpks                |
//!  | MountedVpksResponse(id)         ->  | (async mount) -> MountVpks
//!  | <- RequestInitialSnapshot(id)       |
//!  | -> Snapshot                         |
//!  | InitialSnapshotResponse(id)     ->  | (async apply) -> Snapshot
//!  | <- ClientReady(id)                  |
//!  | -> Connected                        |
//!  | Activate(id)                    ->  | -> Connected
//! ```
//!
//! **Per-connection state.** Each handler looks only at the `Connection` it is
//! given. Handlers never send anything themselves; they return a
//! [`HandshakeAction`] which the `NetworkSystem` carries out, keeping every
//! decision testable without a transport.
//!
//! Messages whose handshake id does not match the connection's current
//! attempt are stale and ignored. A message arriving in the wrong state is a
//! protocol violation and ends the connection.

use crate::error::{ProtocolError, Result};
use crate::protocol::authority::{self, MessageKind, Verdict};
use crate::protocol::connection::{
    ChannelState, Connection, ConnectionId, HandshakeId, PendingStep, StepKind, StepOutput,
};
use crate::protocol::message::{
    Activate, ClientReady, ControlKind, ControlMessage, InitialSnapshotResponse,
    MountedVpksResponse, RequestInitialSnapshot, RequestMountedVpks, RestartHandshake, ServerInfo,
    UserInfo, Welcome,
};
use crate::service::gameplay::GameplaySystem;
use futures::FutureExt;
use tracing::{debug, info, instrument};

/// What the caller must do after a handshake handler ran.
#[derive(Debug)]
pub enum HandshakeAction {
    /// Stale, duplicate or wrong-direction message; nothing happens.
    Ignore,
    /// Send these messages to the connection, in order.
    Send(Vec<ControlMessage>),
    /// Install this step on the connection and resume when it completes.
    Suspend(PendingStep),
    /// The gameplay layer refused the peer; kick with this reason.
    Refuse(String),
    /// The handshake finished on this side.
    Joined(Vec<ControlMessage>),
}

/// The message whose handler suspends on `step`.
fn started_by(step: StepKind) -> ControlKind {
    match step {
        StepKind::ServeMountedContent => ControlKind::RequestMountedVpks,
        StepKind::MountContent => ControlKind::MountedVpksResponse,
        StepKind::ApplySnapshot => ControlKind::InitialSnapshotResponse,
    }
}

/// Handshake settings and the per-step handlers.
#[derive(Debug, Clone)]
pub struct HandshakeProtocol {
    local_id: ConnectionId,
    local_is_host: bool,
    server_name: String,
    max_players: u32,
    display_name: String,
}

impl HandshakeProtocol {
    pub fn new(
        local_id: ConnectionId,
        local_is_host: bool,
        server_name: impl Into<String>,
        max_players: u32,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            local_id,
            local_is_host,
            server_name: server_name.into(),
            max_players,
            display_name: display_name.into(),
        }
    }

    pub fn is_host(&self) -> bool {
        self.local_is_host
    }

    pub fn local_id(&self) -> ConnectionId {
        self.local_id
    }

    /// A client learns its session-wide id from ServerInfo.
    pub(crate) fn set_local_id(&mut self, id: ConnectionId) {
        self.local_id = id;
    }

    /// Common entry checks. `Ok(false)` means ignore the message.
    fn guard(
        &self,
        conn: &Connection,
        kind: ControlKind,
        handshake_id: HandshakeId,
        expected: ChannelState,
    ) -> Result<bool> {
        match authority::check(MessageKind::Control(kind), self.local_is_host, conn.is_host()) {
            Verdict::Allowed => {}
            Verdict::Ignore => {
                debug!(connection = %conn.id(), ?kind, "Ignoring handshake message from wrong side");
                return Ok(false);
            }
            Verdict::Kick(reason) => return Err(ProtocolError::AuthorityViolation(reason)),
        }

        if !conn.handshake_matches(handshake_id) {
            debug!(
                connection = %conn.id(),
                ?kind,
                received = %handshake_id,
                "Ignoring message from a superseded handshake"
            );
            return Ok(false);
        }

        // A resend of the message that started the pending step is a duplicate.
        // Anything else still has to pass the state check below.
        if let Some(pending) = &conn.pending {
            if started_by(pending.kind) == kind {
                debug!(connection = %conn.id(), ?kind, step = ?pending.kind, "Ignoring duplicate while a handshake step is pending");
                return Ok(false);
            }
        }

        if conn.state() != expected {
            return Err(ProtocolError::ProtocolViolation(format!(
                "Invalid Handshake State {} (expected {} for {:?})",
                conn.state(),
                expected,
                kind
            )));
        }
        Ok(true)
    }

    /// Host side: open a handshake on a freshly accepted connection.
    #[instrument(skip(self, conn), fields(connection = %conn.id()))]
    pub fn begin(&self, conn: &mut Connection) -> Result<ControlMessage> {
        if !self.local_is_host {
            return Err(ProtocolError::Custom(
                crate::error::constants::ERR_NOT_HOST.into(),
            ));
        }
        let handshake_id = HandshakeId::new();
        conn.begin_handshake(handshake_id)?;
        debug!(handshake = %handshake_id, "Sending server information");
        Ok(ControlMessage::ServerInfo(ServerInfo {
            handshake_id,
            assigned_id: conn.id(),
            host_id: self.local_id,
            server_name: self.server_name.clone(),
            max_players: self.max_players,
        }))
    }

    /// Client: the host opened (or reopened) a handshake.
    #[instrument(skip(self, conn, msg), fields(connection = %conn.id()))]
    pub fn on_server_info(&self, conn: &mut Connection, msg: ServerInfo) -> Result<HandshakeAction> {
        match authority::check(
            MessageKind::Control(ControlKind::ServerInfo),
            self.local_is_host,
            conn.is_host(),
        ) {
            Verdict::Allowed => {}
            _ => return Ok(HandshakeAction::Ignore),
        }
        if conn.state() != ChannelState::Unconnected {
            return Err(ProtocolError::ProtocolViolation(format!(
                "Invalid Handshake State {} (expected {} for ServerInfo)",
                conn.state(),
                ChannelState::Unconnected
            )));
        }

        conn.begin_handshake(msg.handshake_id)?;
        info!(server = %msg.server_name, max_players = msg.max_players, "Loading server information");
        Ok(HandshakeAction::Send(vec![ControlMessage::UserInfo(UserInfo {
            handshake_id: msg.handshake_id,
            display_name: self.display_name.clone(),
        })]))
    }

    /// Host: the client introduced itself.
    #[instrument(skip(self, conn, msg, gameplay), fields(connection = %conn.id()))]
    pub fn on_user_info(
        &self,
        conn: &mut Connection,
        msg: UserInfo,
        gameplay: &mut dyn GameplaySystem,
    ) -> Result<HandshakeAction> {
        if !self.guard(
            conn,
            ControlKind::UserInfo,
            msg.handshake_id,
            ChannelState::LoadingServerInformation,
        )? {
            return Ok(HandshakeAction::Ignore);
        }

        conn.display_name = msg.display_name;
        if let Err(reason) = gameplay.accept_connection(conn) {
            info!(name = %conn.display_name, %reason, "Connection refused by gameplay");
            return Ok(HandshakeAction::Refuse(reason));
        }

        conn.advance_to(ChannelState::Welcome)?;
        gameplay.on_connected(conn);
        info!(name = %conn.display_name, "Welcoming connection");
        Ok(HandshakeAction::Send(vec![ControlMessage::Welcome(Welcome {
            handshake_id: msg.handshake_id,
        })]))
    }

    /// Client: the host accepted us.
    pub fn on_welcome(&self, conn: &mut Connection, msg: Welcome) -> Result<HandshakeAction> {
        if !self.guard(
            conn,
            ControlKind::Welcome,
            msg.handshake_id,
            ChannelState::LoadingServerInformation,
        )? {
            return Ok(HandshakeAction::Ignore);
        }
        conn.advance_to(ChannelState::Welcome)?;
        Ok(HandshakeAction::Send(vec![
            ControlMessage::RequestMountedVpks(RequestMountedVpks {
                handshake_id: msg.handshake_id,
            }),
        ]))
    }

    /// Host: the client wants the list of mounted content. Answered asynchronously.
    pub fn on_request_mounted_vpks(
        &self,
        conn: &mut Connection,
        msg: RequestMountedVpks,
        gameplay: &mut dyn GameplaySystem,
    ) -> Result<HandshakeAction> {
        if !self.guard(
            conn,
            ControlKind::RequestMountedVpks,
            msg.handshake_id,
            ChannelState::Welcome,
        )? {
            return Ok(HandshakeAction::Ignore);
        }
        let future = gameplay
            .get_mounted_content()
            .map(|result| result.map(StepOutput::MountedContent))
            .boxed();
        Ok(HandshakeAction::Suspend(PendingStep {
            kind: StepKind::ServeMountedContent,
            handshake_id: msg.handshake_id,
            future,
        }))
    }

    /// Client: mount what the host has mounted, then ask for the snapshot.
    pub fn on_mounted_vpks_response(
        &self,
        conn: &mut Connection,
        msg: MountedVpksResponse,
        gameplay: &mut dyn GameplaySystem,
    ) -> Result<HandshakeAction> {
        if !self.guard(
            conn,
            ControlKind::MountedVpksResponse,
            msg.handshake_id,
            ChannelState::Welcome,
        )? {
            return Ok(HandshakeAction::Ignore);
        }
        debug!(connection = %conn.id(), count = msg.content.len(), "Mounting host content");
        let future = gameplay
            .mount_content(msg.content)
            .map(|result| result.map(|()| StepOutput::Mounted))
            .boxed();
        Ok(HandshakeAction::Suspend(PendingStep {
            kind: StepKind::MountContent,
            handshake_id: msg.handshake_id,
            future,
        }))
    }

    /// Host: send the full snapshot.
    pub fn on_request_initial_snapshot(
        &self,
        conn: &mut Connection,
        msg: RequestInitialSnapshot,
        gameplay: &mut dyn GameplaySystem,
    ) -> Result<HandshakeAction> {
        if !self.guard(
            conn,
            ControlKind::RequestInitialSnapshot,
            msg.handshake_id,
            ChannelState::MountVpks,
        )? {
            return Ok(HandshakeAction::Ignore);
        }
        let snapshot = gameplay.get_snapshot(conn)?;
        conn.advance_to(ChannelState::Snapshot)?;
        debug!(connection = %conn.id(), bytes = snapshot.len(), "Sending initial snapshot");
        Ok(HandshakeAction::Send(vec![
            ControlMessage::InitialSnapshotResponse(InitialSnapshotResponse {
                handshake_id: msg.handshake_id,
                snapshot,
            }),
        ]))
    }

    /// Client: apply the snapshot. Failure is fatal and never retried.
    pub fn on_initial_snapshot_response(
        &self,
        conn: &mut Connection,
        msg: InitialSnapshotResponse,
        gameplay: &mut dyn GameplaySystem,
    ) -> Result<HandshakeAction> {
        if !self.guard(
            conn,
            ControlKind::InitialSnapshotResponse,
            msg.handshake_id,
            ChannelState::MountVpks,
        )? {
            return Ok(HandshakeAction::Ignore);
        }
        let future = gameplay
            .apply_snapshot(msg.snapshot)
            .map(|result| result.map(|()| StepOutput::SnapshotApplied))
            .boxed();
        Ok(HandshakeAction::Suspend(PendingStep {
            kind: StepKind::ApplySnapshot,
            handshake_id: msg.handshake_id,
            future,
        }))
    }

    /// Host: the client is ready; it is now fully joined.
    pub fn on_client_ready(
        &self,
        conn: &mut Connection,
        msg: ClientReady,
        gameplay: &mut dyn GameplaySystem,
    ) -> Result<HandshakeAction> {
        if !self.guard(
            conn,
            ControlKind::ClientReady,
            msg.handshake_id,
            ChannelState::Snapshot,
        )? {
            return Ok(HandshakeAction::Ignore);
        }
        conn.advance_to(ChannelState::Connected)?;
        gameplay.on_joined(conn);
        info!(connection = %conn.id(), name = %conn.display_name, "Connection joined");
        Ok(HandshakeAction::Joined(vec![ControlMessage::Activate(Activate {
            handshake_id: msg.handshake_id,
        })]))
    }

    /// Client: the host activated us.
    pub fn on_activate(
        &self,
        conn: &mut Connection,
        msg: Activate,
        gameplay: &mut dyn GameplaySystem,
    ) -> Result<HandshakeAction> {
        if !self.guard(
            conn,
            ControlKind::Activate,
            msg.handshake_id,
            ChannelState::Snapshot,
        )? {
            return Ok(HandshakeAction::Ignore);
        }
        conn.advance_to(ChannelState::Connected)?;
        gameplay.on_joined(conn);
        info!(connection = %conn.id(), "Joined session");
        Ok(HandshakeAction::Joined(Vec::new()))
    }

    /// Resume after an asynchronous step finished.
    ///
    /// Completions for a superseded handshake are dropped.
    pub fn complete_step(
        &self,
        conn: &mut Connection,
        kind: StepKind,
        handshake_id: HandshakeId,
        output: Result<StepOutput>,
    ) -> Result<HandshakeAction> {
        if !conn.handshake_matches(handshake_id) {
            debug!(connection = %conn.id(), ?kind, "Dropping completion of a superseded handshake step");
            return Ok(HandshakeAction::Ignore);
        }

        match (kind, output) {
            (StepKind::ServeMountedContent, Ok(StepOutput::MountedContent(content))) => {
                conn.advance_to(ChannelState::MountVpks)?;
                Ok(HandshakeAction::Send(vec![
                    ControlMessage::MountedVpksResponse(MountedVpksResponse {
                        handshake_id,
                        content,
                    }),
                ]))
            }
            (StepKind::MountContent, Ok(StepOutput::Mounted)) => {
                conn.advance_to(ChannelState::MountVpks)?;
                Ok(HandshakeAction::Send(vec![
                    ControlMessage::RequestInitialSnapshot(RequestInitialSnapshot {
                        handshake_id,
                    }),
                ]))
            }
            (StepKind::ApplySnapshot, Ok(StepOutput::SnapshotApplied)) => {
                conn.advance_to(ChannelState::Snapshot)?;
                Ok(HandshakeAction::Send(vec![ControlMessage::ClientReady(
                    ClientReady { handshake_id },
                )]))
            }
            (StepKind::ApplySnapshot, Err(e)) => Err(match e {
                ProtocolError::SnapshotApply(_) => e,
                other => ProtocolError::SnapshotApply(other.to_string()),
            }),
            (StepKind::MountContent, Err(e)) | (StepKind::ServeMountedContent, Err(e)) => {
                Err(match e {
                    ProtocolError::ContentMount(_) => e,
                    other => ProtocolError::ContentMount(other.to_string()),
                })
            }
            (kind, Ok(output)) => Err(ProtocolError::Custom(format!(
                "Step {kind:?} finished with unexpected output {output:?}"
            ))),
        }
    }

    /// The peer asked to replay the handshake.
    ///
    /// A host re-keys and resends ServerInfo; a client rewinds and waits for it.
    pub fn on_restart(&self, conn: &mut Connection) -> Result<HandshakeAction> {
        if !self.local_is_host && !conn.is_host() {
            // only the host drives the handshake
            return Ok(HandshakeAction::Ignore);
        }
        info!(connection = %conn.id(), from_state = %conn.state(), "Peer requested handshake restart");
        conn.reset_handshake();
        if self.local_is_host {
            let server_info = self.begin(conn)?;
            Ok(HandshakeAction::Send(vec![server_info]))
        } else {
            Ok(HandshakeAction::Ignore)
        }
    }

    /// Replay the handshake from this side.
    pub fn request_restart(&self, conn: &mut Connection) -> Result<Vec<ControlMessage>> {
        info!(connection = %conn.id(), from_state = %conn.state(), "Restarting handshake");
        conn.reset_handshake();
        let mut messages = vec![ControlMessage::RestartHandshake(RestartHandshake {})];
        if self.local_is_host {
            messages.push(self.begin(conn)?);
        }
        Ok(messages)
    }
}

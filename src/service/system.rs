//! The per-peer session orchestrator.
//!
//! `NetworkSystem` owns the roster and every protocol component. All decoding
//! and handling happens inside [`NetworkSystem::tick`], on the caller's
//! thread; transports running on worker tasks only buffer raw frames.
//!
//! The protocol components make decisions (`HandshakeAction`,
//! `RouteDecision`, authority `Verdict`); this module carries them out:
//! sending frames, installing pending steps, kicking peers and emitting
//! [`NetworkEvent`]s.

use crate::config::NetworkConfig;
use crate::error::{constants, ErrorCategory, ProtocolError, Result};
use crate::protocol::authority::{self, MessageKind, Verdict};
use crate::protocol::chunking::{split_message, ChunkReassembler};
use crate::protocol::connection::{Connection, ConnectionId};
use crate::protocol::dispatcher::{decode_envelope, Envelope, MessageContext, StaticTable};
use crate::protocol::handshake::{HandshakeAction, HandshakeProtocol};
use crate::protocol::heartbeat::HeartbeatMonitor;
use crate::protocol::message::{
    encode_client_tick, encode_cull_state, encode_delta, encode_ping, encode_pong,
    encode_request, encode_response, encode_static, ControlMessage, DeltaKind, Kick,
    TargetedInternalMessage, TargetedMessage, CHUNK,
};
use crate::protocol::registry::{PackedMessage, TypeRegistry};
use crate::protocol::request::{PendingRequests, PendingResponse};
use crate::protocol::routing::{RouteDecision, TargetedRouter};
use crate::service::gameplay::GameplaySystem;
use crate::transport::Transport;
use crate::utils::metrics::{Metrics, Timer};
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, trace, warn};

/// Something the embedding application should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// The handshake with this connection completed.
    Joined(ConnectionId),
    /// We removed the connection for misbehaving or on request.
    Kicked {
        connection: ConnectionId,
        reason: String,
    },
    /// The connection is gone: closed, disconnected locally or kicked by the host.
    Disconnected {
        connection: ConnectionId,
        reason: String,
    },
    /// The local session cannot continue (e.g. the initial snapshot failed to load).
    Fatal { reason: String },
}

struct Intake {
    transport: Box<dyn Transport>,
    remote_is_host: bool,
}

/// Hands transports accepted on other threads to a `NetworkSystem`.
///
/// They join the roster on the system's next tick.
#[derive(Clone)]
pub struct ConnectionAcceptor {
    tx: mpsc::UnboundedSender<Intake>,
}

impl ConnectionAcceptor {
    /// A client connected to this host.
    pub fn accept(&self, transport: Box<dyn Transport>) -> Result<()> {
        self.push(transport, false)
    }

    /// This client reached its host.
    pub fn join(&self, transport: Box<dyn Transport>) -> Result<()> {
        self.push(transport, true)
    }

    fn push(&self, transport: Box<dyn Transport>, remote_is_host: bool) -> Result<()> {
        self.tx
            .send(Intake {
                transport,
                remote_is_host,
            })
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

impl fmt::Debug for ConnectionAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionAcceptor")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// One peer of a session: either the host or a client.
pub struct NetworkSystem {
    config: NetworkConfig,
    handshake: HandshakeProtocol,
    heartbeat: HeartbeatMonitor,
    router: TargetedRouter,
    registry: TypeRegistry,
    statics: StaticTable,
    requests: PendingRequests,
    connections: HashMap<ConnectionId, Connection>,
    gameplay: Box<dyn GameplaySystem>,
    intake_tx: mpsc::UnboundedSender<Intake>,
    intake_rx: mpsc::UnboundedReceiver<Intake>,
    events: Vec<NetworkEvent>,
    metrics: Metrics,
    clock: Instant,
    last_rekey: Option<(ConnectionId, ConnectionId)>,
}

impl NetworkSystem {
    pub fn new(config: NetworkConfig, is_host: bool, gameplay: Box<dyn GameplaySystem>) -> Self {
        let local_id = ConnectionId::new();
        let session = &config.session;
        let handshake = HandshakeProtocol::new(
            local_id,
            is_host,
            session.server_name.clone(),
            u32::try_from(session.max_connections).unwrap_or(u32::MAX),
            session.display_name.clone(),
        );
        let heartbeat = HeartbeatMonitor::new(session.heartbeat_interval, session.rtt_ceiling);
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();

        info!(
            local_id = %local_id,
            is_host,
            display_name = %session.display_name,
            "Session peer created"
        );

        Self {
            config,
            handshake,
            heartbeat,
            router: TargetedRouter::new(local_id),
            registry: TypeRegistry::new(),
            statics: StaticTable::new(),
            requests: PendingRequests::new(),
            connections: HashMap::new(),
            gameplay,
            intake_tx,
            intake_rx,
            events: Vec::new(),
            metrics: Metrics::new(),
            clock: Instant::now(),
            last_rekey: None,
        }
    }

    pub fn host(config: NetworkConfig, gameplay: Box<dyn GameplaySystem>) -> Self {
        Self::new(config, true, gameplay)
    }

    pub fn client(config: NetworkConfig, gameplay: Box<dyn GameplaySystem>) -> Self {
        Self::new(config, false, gameplay)
    }

    pub fn is_host(&self) -> bool {
        self.handshake.is_host()
    }

    /// This peer's id. A client adopts the id its host assigned during the handshake.
    pub fn local_id(&self) -> ConnectionId {
        self.router.local_id()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Packed types must be registered before the first tick.
    pub fn registry_mut(&mut self) -> &mut TypeRegistry {
        &mut self.registry
    }

    pub fn statics(&self) -> &StaticTable {
        &self.statics
    }

    pub fn acceptor(&self) -> ConnectionAcceptor {
        ConnectionAcceptor {
            tx: self.intake_tx.clone(),
        }
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// The host's connection, on a client. Its id changes once ServerInfo arrives.
    pub fn host_connection(&self) -> Option<ConnectionId> {
        self.connections
            .values()
            .find(|conn| conn.is_host())
            .map(Connection::id)
    }

    pub fn drain_events(&mut self) -> Vec<NetworkEvent> {
        std::mem::take(&mut self.events)
    }

    /// Host: add a client connection and open its handshake.
    pub fn add_connection(&mut self, transport: Box<dyn Transport>) -> Result<ConnectionId> {
        self.add_transport(transport, false)
    }

    /// Client: add the connection to the host and wait for ServerInfo.
    pub fn connect_to_host(&mut self, transport: Box<dyn Transport>) -> Result<ConnectionId> {
        self.add_transport(transport, true)
    }

    #[instrument(skip(self, transport))]
    fn add_transport(
        &mut self,
        mut transport: Box<dyn Transport>,
        remote_is_host: bool,
    ) -> Result<ConnectionId> {
        if remote_is_host == self.is_host() {
            transport.close("Role mismatch");
            return Err(ProtocolError::Custom(if self.is_host() {
                "A host cannot join another host".into()
            } else {
                constants::ERR_NOT_HOST.into()
            }));
        }
        if remote_is_host && self.host_connection().is_some() {
            transport.close("Already connected");
            return Err(ProtocolError::Custom("Already connected to a host".into()));
        }
        if self.connections.len() >= self.config.session.max_connections {
            transport.close("Session full");
            return Err(ProtocolError::Custom(format!(
                "Session full ({} connections)",
                self.connections.len()
            )));
        }

        let id = ConnectionId::new();
        let mut conn = Connection::new(id, remote_is_host, transport);
        conn.chunks = ChunkReassembler::for_payload(self.config.session.max_message_size);
        let opening = if self.is_host() {
            self.metrics.handshake_started();
            Some(self.handshake.begin(&mut conn)?)
        } else {
            None
        };
        self.connections.insert(id, conn);
        self.metrics.connection_added();
        info!(connection = %id, remote_is_host, "Connection added");

        if let Some(server_info) = opening {
            self.send_control(id, &server_info)?;
        }
        Ok(id)
    }

    /// Run one tick using the system's own clock.
    pub fn tick(&mut self) {
        let now = self.clock.elapsed().as_secs_f64();
        self.tick_at(now);
    }

    /// Run one tick at `now` (seconds on a monotonic clock).
    ///
    /// Accepts handed-off transports, dispatches every buffered frame,
    /// resumes finished handshake steps and paces heartbeats.
    pub fn tick_at(&mut self, now: f64) {
        while let Ok(intake) = self.intake_rx.try_recv() {
            if let Err(e) = self.add_transport(intake.transport, intake.remote_is_host) {
                warn!(error = %e, "Rejected handed-off connection");
            }
        }

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.poll_connection(id, now);
        }

        self.drive_pending_steps();

        if self.is_host() && self.heartbeat.poll_ping(now) {
            self.broadcast_ping(now);
        }
    }

    fn poll_connection(&mut self, id: ConnectionId, now: f64) {
        let mut frames = Vec::new();
        let open = match self.connections.get_mut(&id) {
            Some(conn) => {
                conn.poll_incoming(&mut |frame| frames.push(frame));
                conn.is_open()
            }
            None => return,
        };

        if frames.len() > self.config.session.intake_capacity_warning {
            warn!(
                connection = %id,
                backlog = frames.len(),
                "Large intake backlog for one tick"
            );
        }

        let mut current = id;
        for frame in frames {
            // handlers may remove the connection part way through the batch
            if !self.connections.contains_key(&current) {
                return;
            }
            self.process_frame(current, &frame, now);
            current = self.resolve(current);
        }

        if !open && self.connections.contains_key(&current) {
            self.remove_connection(current, "Transport closed", false);
        }
    }

    fn resolve(&self, id: ConnectionId) -> ConnectionId {
        match self.last_rekey {
            Some((old, new)) if old == id => new,
            _ => id,
        }
    }

    fn process_frame(&mut self, id: ConnectionId, frame: &[u8], now: f64) {
        self.metrics.message_received(frame.len() as u64);
        let ctx = match self.connections.get_mut(&id) {
            Some(conn) => {
                conn.stats.messages_in += 1;
                conn.stats.bytes_in += frame.len() as u64;
                MessageContext::direct(id, conn.is_host())
            }
            None => return,
        };

        let _timer = Timer::start("dispatch");
        let result = match self.dispatch(ctx, frame, now) {
            Ok(Some(reply)) => {
                let target = self.resolve(id);
                self.send_frame(target, &reply)
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let id = self.resolve(id);
            self.handle_error(id, e);
        }
    }

    /// Decode and handle one frame. Returns a reply for the frame's source.
    fn dispatch(
        &mut self,
        ctx: MessageContext,
        frame: &[u8],
        now: f64,
    ) -> Result<Option<Vec<u8>>> {
        match decode_envelope(frame)? {
            Envelope::HeartbeatPing {
                real_time,
                sim_time,
            } => {
                if !self.allowed(MessageKind::HeartbeatPing, &ctx)? || ctx.is_relayed() {
                    return Ok(None);
                }
                self.gameplay.on_heartbeat(real_time, sim_time);
                Ok(Some(encode_pong(real_time)))
            }
            Envelope::HeartbeatPong { real_time } => {
                if !self.allowed(MessageKind::HeartbeatPong, &ctx)? || ctx.is_relayed() {
                    return Ok(None);
                }
                if let Some(conn) = self.connections.get_mut(&ctx.origin) {
                    if self.heartbeat.record_pong(conn, real_time, now).is_some() {
                        self.metrics.rtt_sample();
                    }
                }
                Ok(None)
            }
            Envelope::Delta { kind, data } => {
                if !self.allowed(MessageKind::Delta(kind), &ctx)? || !self.joined(ctx.origin) {
                    return Ok(None);
                }
                self.gameplay.on_delta_snapshot(&ctx, kind, data);
                Ok(None)
            }
            Envelope::ClientTick { origins, commands } => {
                if !self.allowed(MessageKind::ClientTick, &ctx)? || ctx.is_relayed() {
                    return Ok(None);
                }
                match self.connections.get_mut(&ctx.origin) {
                    Some(conn) if conn.is_connected() => {
                        conn.visibility_origins = origins;
                        self.gameplay.on_client_tick(conn, commands);
                    }
                    _ => debug!(connection = %ctx.origin, "Dropping client tick before join"),
                }
                Ok(None)
            }
            Envelope::CullState { data } => {
                if !self.allowed(MessageKind::CullState, &ctx)? || !self.joined(ctx.origin) {
                    return Ok(None);
                }
                self.gameplay.on_cull_state_change(&ctx, data);
                Ok(None)
            }
            Envelope::Chunk { index, total, data } => {
                // Senders chunk whole frames; fragments inside a wrapper would
                // share the connection's buffer with its own chunked traffic.
                if ctx.depth > 0 {
                    return Err(ProtocolError::ProtocolViolation(
                        constants::ERR_CHUNK_NOT_TOP_LEVEL.into(),
                    ));
                }
                let nested = ctx.nested()?;
                let conn = self
                    .connections
                    .get_mut(&ctx.origin)
                    .ok_or_else(|| unknown_connection(ctx.origin))?;
                let Some(message) = conn.chunks.push(index, total, data)? else {
                    return Ok(None);
                };
                if message.get(..4) == Some(&CHUNK.to_be_bytes()[..]) {
                    return Err(ProtocolError::ProtocolViolation(
                        constants::ERR_CHUNK_NESTED.into(),
                    ));
                }
                self.metrics.chunk_reassembled();
                trace!(connection = %ctx.origin, bytes = message.len(), "Reassembled chunked message");
                self.dispatch(nested, &message, now)
            }
            Envelope::Request { id, inner } => {
                let mut nested = ctx.nested()?;
                nested.request_id = Some(id);
                // The requester always gets an answer, empty if the handler had none.
                let reply = self.dispatch(nested, inner, now)?;
                Ok(Some(encode_response(&id, &reply.unwrap_or_default())))
            }
            Envelope::Response { id, inner } => {
                if self.requests.complete(id, ctx.source, inner) {
                    self.metrics.request_completed();
                }
                Ok(None)
            }
            Envelope::Packed { type_id, body } => self.registry.dispatch(type_id, &ctx, body),
            Envelope::Control { kind, body } => {
                let message = ControlMessage::decode(kind, body)?;
                self.on_control(ctx, message, now)
            }
            Envelope::Static {
                discriminator,
                body,
            } => self.statics.dispatch(discriminator, &ctx, body),
        }
    }

    /// Authority check; `Ok(false)` means drop the message quietly.
    fn allowed(&self, kind: MessageKind, ctx: &MessageContext) -> Result<bool> {
        match authority::check(kind, self.is_host(), ctx.source_is_host) {
            Verdict::Allowed => Ok(true),
            Verdict::Ignore => {
                debug!(source = %ctx.source, ?kind, "Ignoring message from the wrong side");
                Ok(false)
            }
            Verdict::Kick(reason) => Err(ProtocolError::AuthorityViolation(reason)),
        }
    }

    fn joined(&self, id: ConnectionId) -> bool {
        let joined = self
            .connections
            .get(&id)
            .map(Connection::is_connected)
            .unwrap_or(false);
        if !joined {
            debug!(connection = %id, "Dropping gameplay message before join");
        }
        joined
    }

    fn on_control(
        &mut self,
        ctx: MessageContext,
        message: ControlMessage,
        now: f64,
    ) -> Result<Option<Vec<u8>>> {
        if !self.allowed(MessageKind::Control(message.kind()), &ctx)? {
            return Ok(None);
        }
        match message {
            ControlMessage::Kick(Kick { reason }) => {
                warn!(connection = %ctx.origin, %reason, "Kicked by host");
                self.remove_connection(ctx.origin, &format!("Kicked by host: {reason}"), false);
                Ok(None)
            }
            message @ (ControlMessage::TargetedMessage(_)
            | ControlMessage::TargetedInternalMessage(_)) => self.on_targeted(ctx, message, now),
            message => {
                if ctx.is_relayed() {
                    debug!(source = %ctx.source, kind = ?message.kind(), "Ignoring relayed handshake message");
                    return Ok(None);
                }
                self.on_handshake(ctx.origin, message)?;
                Ok(None)
            }
        }
    }

    fn on_targeted(
        &mut self,
        ctx: MessageContext,
        message: ControlMessage,
        now: f64,
    ) -> Result<Option<Vec<u8>>> {
        let (sender_id, target_id) = match &message {
            ControlMessage::TargetedMessage(m) => (m.sender_id, m.target_id),
            ControlMessage::TargetedInternalMessage(m) => (m.sender_id, m.target_id),
            _ => return Ok(None),
        };

        let connections = &self.connections;
        let decision = self.router.route(
            ctx.source,
            ctx.source_is_host,
            sender_id,
            target_id,
            |id| connections.get(&id).map(Connection::is_host),
        );

        match decision {
            RouteDecision::Kick(reason) => Err(ProtocolError::AuthorityViolation(reason)),
            RouteDecision::Drop => Ok(None),
            RouteDecision::Forward { target } => {
                trace!(from = %ctx.source, to = %target, "Forwarding targeted message");
                let frame = message.encode()?;
                self.send_frame(target, &frame)?;
                Ok(None)
            }
            RouteDecision::DeliverLocal {
                source,
                source_is_host,
                relayed,
            } => {
                // Once relayed, always relayed: a wrapper inside a relayed payload
                // cannot claim to come straight from the host.
                let relayed = relayed || ctx.is_relayed();
                let mut inner = ctx.nested()?;
                inner.source = source;
                inner.source_is_host = source_is_host && !relayed;
                inner.relayed = relayed;
                inner.request_id = None;

                let delivered = match message {
                    ControlMessage::TargetedMessage(m) => match decode_envelope(&m.packed) {
                        Ok(Envelope::Packed { type_id, body }) => {
                            self.registry.dispatch(type_id, &inner, body)
                        }
                        Ok(_) => Err(ProtocolError::DecodeError(
                            "Targeted message does not carry a packed frame".into(),
                        )),
                        Err(e) => Err(e),
                    },
                    ControlMessage::TargetedInternalMessage(m) => {
                        trace!(source = %source, flags = m.flags, "Delivering targeted internal message");
                        self.dispatch(inner, &m.data, now)
                    }
                    _ => Ok(None),
                };

                if !relayed {
                    return delivered;
                }
                // The relay only forwarded these bytes; their author is out of reach.
                match delivered {
                    Ok(Some(reply)) => {
                        self.send_relayed(ctx.origin, sender_id, reply)?;
                        Ok(None)
                    }
                    Ok(None) => Ok(None),
                    Err(e) => {
                        self.drop_relayed(sender_id, ctx.origin, e);
                        Ok(None)
                    }
                }
            }
        }
    }

    fn drop_relayed(&mut self, sender: ConnectionId, relay: ConnectionId, err: ProtocolError) {
        match err.category() {
            ErrorCategory::ProtocolViolation | ErrorCategory::AuthorityViolation => {
                self.metrics.protocol_violation();
            }
            ErrorCategory::Decode => self.metrics.decode_failure(),
            ErrorCategory::Local => {}
        }
        warn!(sender = %sender, relay = %relay, error = %err, "Dropping relayed message");
    }

    fn on_handshake(&mut self, id: ConnectionId, message: ControlMessage) -> Result<()> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| unknown_connection(id))?;
        let handshake = &self.handshake;
        let gameplay = self.gameplay.as_mut();

        let mut adopted = None;
        let mut restarted = false;
        let action = match message {
            ControlMessage::ServerInfo(m) => {
                let ids = (m.assigned_id, m.host_id);
                let action = handshake.on_server_info(conn, m)?;
                if matches!(action, HandshakeAction::Send(_)) {
                    adopted = Some(ids);
                }
                action
            }
            ControlMessage::UserInfo(m) => handshake.on_user_info(conn, m, gameplay)?,
            ControlMessage::Welcome(m) => handshake.on_welcome(conn, m)?,
            ControlMessage::RequestMountedVpks(m) => {
                handshake.on_request_mounted_vpks(conn, m, gameplay)?
            }
            ControlMessage::MountedVpksResponse(m) => {
                handshake.on_mounted_vpks_response(conn, m, gameplay)?
            }
            ControlMessage::RequestInitialSnapshot(m) => {
                handshake.on_request_initial_snapshot(conn, m, gameplay)?
            }
            ControlMessage::InitialSnapshotResponse(m) => {
                handshake.on_initial_snapshot_response(conn, m, gameplay)?
            }
            ControlMessage::ClientReady(m) => handshake.on_client_ready(conn, m, gameplay)?,
            ControlMessage::Activate(m) => handshake.on_activate(conn, m, gameplay)?,
            ControlMessage::RestartHandshake(_) => {
                let action = handshake.on_restart(conn)?;
                restarted = matches!(action, HandshakeAction::Send(_));
                action
            }
            ControlMessage::Kick(_)
            | ControlMessage::TargetedMessage(_)
            | ControlMessage::TargetedInternalMessage(_) => HandshakeAction::Ignore,
        };

        if restarted {
            self.metrics.handshake_started();
        }
        let id = match adopted {
            Some((assigned, host_id)) => {
                self.metrics.handshake_started();
                self.adopt_identity(id, assigned, host_id)
            }
            None => id,
        };
        self.apply_handshake_action(id, action)
    }

    /// Client: take on the id the host assigned and re-key the host connection
    /// under the host's own id, so targeted messages agree on who is who.
    fn adopt_identity(
        &mut self,
        host_conn: ConnectionId,
        assigned: ConnectionId,
        host_id: ConnectionId,
    ) -> ConnectionId {
        if self.router.local_id() != assigned {
            info!(local_id = %assigned, "Adopting host-assigned connection id");
            self.handshake.set_local_id(assigned);
            self.router = TargetedRouter::new(assigned);
        }

        if host_conn == host_id || host_id.is_nil() || self.connections.contains_key(&host_id) {
            return host_conn;
        }
        let Some(mut conn) = self.connections.remove(&host_conn) else {
            return host_conn;
        };
        conn.set_id(host_id);
        self.connections.insert(host_id, conn);
        self.requests.reassign(host_conn, host_id);
        self.last_rekey = Some((host_conn, host_id));
        debug!(from = %host_conn, to = %host_id, "Re-keyed host connection");
        host_id
    }

    fn apply_handshake_action(&mut self, id: ConnectionId, action: HandshakeAction) -> Result<()> {
        match action {
            HandshakeAction::Ignore => Ok(()),
            HandshakeAction::Send(messages) => self.send_controls(id, &messages),
            HandshakeAction::Suspend(step) => {
                debug!(connection = %id, step = ?step.kind, "Handshake step pending");
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.pending = Some(step);
                }
                Ok(())
            }
            HandshakeAction::Refuse(reason) => {
                self.kick(id, &reason);
                Ok(())
            }
            HandshakeAction::Joined(messages) => {
                self.send_controls(id, &messages)?;
                self.metrics.handshake_completed();
                self.events.push(NetworkEvent::Joined(id));
                Ok(())
            }
        }
    }

    /// Poll every pending handshake step once and resume the finished ones.
    fn drive_pending_steps(&mut self) {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let ids: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|conn| conn.has_pending_step())
            .map(Connection::id)
            .collect();

        for id in ids {
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            let output = match conn.pending.as_mut() {
                Some(step) => match step.future.poll_unpin(&mut cx) {
                    Poll::Ready(output) => output,
                    Poll::Pending => continue,
                },
                None => continue,
            };
            let Some(step) = conn.pending.take() else {
                continue;
            };

            let result = self
                .handshake
                .complete_step(conn, step.kind, step.handshake_id, output);
            let result = match result {
                Ok(action) => self.apply_handshake_action(id, action),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.handle_error(id, e);
            }
        }
    }

    fn handle_error(&mut self, id: ConnectionId, err: ProtocolError) {
        match err.category() {
            ErrorCategory::ProtocolViolation | ErrorCategory::AuthorityViolation => {
                self.metrics.protocol_violation();
                warn!(connection = %id, error = %err, "Protocol violation");
                self.kick(id, &err.kick_reason());
            }
            ErrorCategory::Decode => {
                self.metrics.decode_failure();
                warn!(connection = %id, error = %err, "Dropping message");
            }
            ErrorCategory::Local => match err {
                ProtocolError::SnapshotApply(_) | ProtocolError::ContentMount(_) => {
                    let reason = err.to_string();
                    if self.is_host() {
                        self.kick(id, &reason);
                    } else {
                        error!(connection = %id, %reason, "Cannot continue session");
                        self.remove_connection(id, &reason, false);
                        self.events.push(NetworkEvent::Fatal { reason });
                    }
                }
                other => warn!(connection = %id, error = %other, "Failed to handle message"),
            },
        }
    }

    fn broadcast_ping(&mut self, now: f64) {
        let frame = encode_ping(now, self.gameplay.simulation_time());
        let targets: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|conn| HeartbeatMonitor::wants_ping(conn.state()))
            .map(Connection::id)
            .collect();
        for id in targets {
            if let Err(e) = self.send_frame(id, &frame) {
                debug!(connection = %id, error = %e, "Failed to send ping");
            }
        }
    }

    /// Send a complete frame, splitting it into chunks when it is too large.
    pub fn send_frame(&mut self, id: ConnectionId, frame: &[u8]) -> Result<()> {
        let max = self.config.session.max_message_size;
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| unknown_connection(id))?;

        if frame.len() > max {
            let chunks = split_message(frame, max)?;
            trace!(connection = %id, bytes = frame.len(), chunks = chunks.len(), "Sending chunked message");
            for chunk in chunks {
                conn.send_raw(&chunk)?;
                self.metrics.message_sent(chunk.len() as u64);
            }
        } else {
            conn.send_raw(frame)?;
            self.metrics.message_sent(frame.len() as u64);
        }
        Ok(())
    }

    fn send_control(&mut self, id: ConnectionId, message: &ControlMessage) -> Result<()> {
        trace!(connection = %id, kind = ?message.kind(), "Sending control message");
        let frame = message.encode()?;
        self.send_frame(id, &frame)
    }

    fn send_controls(&mut self, id: ConnectionId, messages: &[ControlMessage]) -> Result<()> {
        for message in messages {
            self.send_control(id, message)?;
        }
        Ok(())
    }

    pub fn send_packed<T: PackedMessage>(&mut self, id: ConnectionId, value: &T) -> Result<()> {
        let frame = TypeRegistry::encode(value)?;
        self.send_frame(id, &frame)
    }

    pub fn send_static(&mut self, id: ConnectionId, discriminator: u32, body: &[u8]) -> Result<()> {
        self.send_frame(id, &encode_static(discriminator, body))
    }

    /// Send `frame` wrapped in a Request; the returned handle resolves with the
    /// reply frame, or fails if the connection goes away.
    pub fn send_request(&mut self, id: ConnectionId, frame: &[u8]) -> Result<PendingResponse> {
        let pending = self.requests.register(id);
        let request = encode_request(&pending.id(), frame);
        if let Err(e) = self.send_frame(id, &request) {
            self.requests.cancel(pending.id());
            return Err(e);
        }
        Ok(pending)
    }

    pub fn send_delta(&mut self, id: ConnectionId, kind: DeltaKind, data: &[u8]) -> Result<()> {
        self.send_frame(id, &encode_delta(kind, data))
    }

    pub fn send_cull_state(&mut self, id: ConnectionId, data: &[u8]) -> Result<()> {
        self.send_frame(id, &encode_cull_state(data))
    }

    /// Client: report visibility origins and input commands to the host.
    pub fn send_client_tick(&mut self, origins: &[[f32; 3]], commands: &[u8]) -> Result<()> {
        let host = self
            .host_connection()
            .ok_or_else(|| ProtocolError::Custom("Not connected to a host".into()))?;
        self.send_frame(host, &encode_client_tick(origins, commands))
    }

    /// Send a packed object to `target`, relayed by the host if it is not a
    /// direct connection. `ConnectionId::nil()` addresses the next hop itself.
    pub fn send_targeted<T: PackedMessage>(&mut self, target: ConnectionId, value: &T) -> Result<()> {
        let message = ControlMessage::TargetedMessage(TargetedMessage {
            sender_id: self.local_id(),
            target_id: target,
            packed: TypeRegistry::encode(value)?,
        });
        let via = self.next_hop(target)?;
        self.send_control(via, &message)
    }

    /// Send a raw frame to `target`, relayed by the host if needed.
    pub fn send_targeted_raw(
        &mut self,
        target: ConnectionId,
        frame: &[u8],
        flags: u8,
    ) -> Result<()> {
        let message = ControlMessage::TargetedInternalMessage(TargetedInternalMessage {
            sender_id: self.local_id(),
            target_id: target,
            flags,
            data: frame.to_vec(),
        });
        let via = self.next_hop(target)?;
        self.send_control(via, &message)
    }

    fn send_relayed(&mut self, via: ConnectionId, target: ConnectionId, frame: Vec<u8>) -> Result<()> {
        let message = ControlMessage::TargetedInternalMessage(TargetedInternalMessage {
            sender_id: self.local_id(),
            target_id: target,
            flags: 0,
            data: frame,
        });
        self.send_control(via, &message)
    }

    fn next_hop(&self, target: ConnectionId) -> Result<ConnectionId> {
        if self.connections.contains_key(&target) {
            return Ok(target);
        }
        self.host_connection()
            .filter(|_| !self.is_host())
            .ok_or_else(|| unknown_connection(target))
    }

    /// Send `frame` to every joined connection; returns how many it reached.
    pub fn broadcast(&mut self, frame: &[u8]) -> usize {
        let targets: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|conn| conn.is_connected())
            .map(Connection::id)
            .collect();
        let mut sent = 0;
        for id in targets {
            match self.send_frame(id, frame) {
                Ok(()) => sent += 1,
                Err(e) => debug!(connection = %id, error = %e, "Broadcast send failed"),
            }
        }
        sent
    }

    /// Replay the handshake with `id` from the beginning.
    pub fn request_restart(&mut self, id: ConnectionId) -> Result<()> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| unknown_connection(id))?;
        let messages = self.handshake.request_restart(conn)?;
        if self.is_host() {
            self.metrics.handshake_started();
        }
        self.send_controls(id, &messages)
    }

    /// Remove `id`, telling it why if we are the host.
    pub fn kick(&mut self, id: ConnectionId, reason: &str) {
        let is_host = self.is_host();
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if is_host {
            let notice = ControlMessage::Kick(Kick {
                reason: reason.to_string(),
            });
            // best effort; the connection is going away either way
            if let Ok(frame) = notice.encode() {
                let _ = conn.send_raw(&frame);
            }
        }
        self.metrics.kick();
        warn!(connection = %id, %reason, "Kicking connection");
        self.remove_connection(id, reason, true);
    }

    /// Close `id` without notifying the peer.
    pub fn disconnect(&mut self, id: ConnectionId, reason: &str) {
        self.remove_connection(id, reason, false);
    }

    /// Close every connection.
    pub fn shutdown(&mut self, reason: &str) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.remove_connection(id, reason, false);
        }
        self.metrics.log_metrics();
    }

    fn remove_connection(&mut self, id: ConnectionId, reason: &str, kicked: bool) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        conn.close(reason);
        let cancelled = self.requests.cancel_connection(id);
        self.gameplay.on_disconnected(&conn, reason);
        self.metrics.connection_removed();
        info!(
            connection = %id,
            name = %conn.display_name,
            state = %conn.state(),
            cancelled_requests = cancelled,
            %reason,
            "Connection removed"
        );

        let reason = reason.to_string();
        self.events.push(if kicked {
            NetworkEvent::Kicked {
                connection: id,
                reason,
            }
        } else {
            NetworkEvent::Disconnected {
                connection: id,
                reason,
            }
        });
    }
}

impl fmt::Debug for NetworkSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkSystem")
            .field("local_id", &self.local_id())
            .field("is_host", &self.is_host())
            .field("connections", &self.connections.len())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn unknown_connection(id: ConnectionId) -> ProtocolError {
    ProtocolError::Custom(format!("{}: {id}", constants::ERR_UNKNOWN_CONNECTION))
}

//! Wire discriminators and the static control messages of the session protocol.
//!
//! Every frame begins with a big-endian `u32` discriminator. Framing wrappers
//! (chunk, request, response) and the hot-path gameplay messages have hand
//! written layouts; control messages carry a bincode body.

use crate::core::wire::WireWriter;
use crate::error::Result;
use crate::protocol::connection::{ConnectionId, HandshakeId};
use serde::{Deserialize, Serialize};

pub const HEARTBEAT_PING: u32 = 1;
pub const HEARTBEAT_PONG: u32 = 2;
pub const DELTA_SNAPSHOT: u32 = 10;
pub const DELTA_SNAPSHOT_ACK: u32 = 11;
pub const DELTA_SNAPSHOT_CLUSTER: u32 = 12;
pub const CLIENT_TICK: u32 = 20;
pub const CULL_STATE_CHANGE: u32 = 21;
pub const CHUNK: u32 = 30;
pub const REQUEST: u32 = 40;
pub const RESPONSE: u32 = 41;
pub const PACKED: u32 = 50;

/// First discriminator available to application-registered static messages.
pub const FIRST_APPLICATION_DISCRIMINATOR: u32 = 1000;

/// The three opaque snapshot-delta variants forwarded to gameplay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Snapshot,
    Ack,
    Cluster,
}

impl DeltaKind {
    pub fn discriminator(self) -> u32 {
        match self {
            DeltaKind::Snapshot => DELTA_SNAPSHOT,
            DeltaKind::Ack => DELTA_SNAPSHOT_ACK,
            DeltaKind::Cluster => DELTA_SNAPSHOT_CLUSTER,
        }
    }

    pub fn from_discriminator(value: u32) -> Option<Self> {
        match value {
            DELTA_SNAPSHOT => Some(DeltaKind::Snapshot),
            DELTA_SNAPSHOT_ACK => Some(DeltaKind::Ack),
            DELTA_SNAPSHOT_CLUSTER => Some(DeltaKind::Cluster),
            _ => None,
        }
    }
}

/// Discriminators of the built-in static control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ControlKind {
    ServerInfo = 100,
    UserInfo = 101,
    Welcome = 102,
    RequestMountedVpks = 103,
    MountedVpksResponse = 104,
    RequestInitialSnapshot = 105,
    InitialSnapshotResponse = 106,
    ClientReady = 107,
    Activate = 108,
    Kick = 109,
    RestartHandshake = 110,
    TargetedMessage = 111,
    TargetedInternalMessage = 112,
}

impl ControlKind {
    pub fn discriminator(self) -> u32 {
        self as u32
    }

    pub fn from_discriminator(value: u32) -> Option<Self> {
        let kind = match value {
            100 => ControlKind::ServerInfo,
            101 => ControlKind::UserInfo,
            102 => ControlKind::Welcome,
            103 => ControlKind::RequestMountedVpks,
            104 => ControlKind::MountedVpksResponse,
            105 => ControlKind::RequestInitialSnapshot,
            106 => ControlKind::InitialSnapshotResponse,
            107 => ControlKind::ClientReady,
            108 => ControlKind::Activate,
            109 => ControlKind::Kick,
            110 => ControlKind::RestartHandshake,
            111 => ControlKind::TargetedMessage,
            112 => ControlKind::TargetedInternalMessage,
            _ => return None,
        };
        Some(kind)
    }
}

/// Sent by the host when a connection is accepted; opens a handshake attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub handshake_id: HandshakeId,
    /// The host's id for the receiving connection; the client adopts it as its own.
    pub assigned_id: ConnectionId,
    pub host_id: ConnectionId,
    pub server_name: String,
    pub max_players: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub handshake_id: HandshakeId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub handshake_id: HandshakeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMountedVpks {
    pub handshake_id: HandshakeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountedVpksResponse {
    pub handshake_id: HandshakeId,
    pub content: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInitialSnapshot {
    pub handshake_id: HandshakeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialSnapshotResponse {
    pub handshake_id: HandshakeId,
    pub snapshot: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientReady {
    pub handshake_id: HandshakeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activate {
    pub handshake_id: HandshakeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kick {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartHandshake {}

/// Relay of an already encoded packed object to a third connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetedMessage {
    pub sender_id: ConnectionId,
    /// `ConnectionId::nil()` addresses whoever receives it.
    pub target_id: ConnectionId,
    /// A complete `PACKED` frame.
    pub packed: Vec<u8>,
}

/// Relay of raw message bytes to a third connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetedInternalMessage {
    pub sender_id: ConnectionId,
    pub target_id: ConnectionId,
    pub flags: u8,
    /// A complete frame, dispatched as if received from `sender_id`.
    pub data: Vec<u8>,
}

/// Decoded static control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    ServerInfo(ServerInfo),
    UserInfo(UserInfo),
    Welcome(Welcome),
    RequestMountedVpks(RequestMountedVpks),
    MountedVpksResponse(MountedVpksResponse),
    RequestInitialSnapshot(RequestInitialSnapshot),
    InitialSnapshotResponse(InitialSnapshotResponse),
    ClientReady(ClientReady),
    Activate(Activate),
    Kick(Kick),
    RestartHandshake(RestartHandshake),
    TargetedMessage(TargetedMessage),
    TargetedInternalMessage(TargetedInternalMessage),
}

impl ControlMessage {
    pub fn kind(&self) -> ControlKind {
        match self {
            ControlMessage::ServerInfo(_) => ControlKind::ServerInfo,
            ControlMessage::UserInfo(_) => ControlKind::UserInfo,
            ControlMessage::Welcome(_) => ControlKind::Welcome,
            ControlMessage::RequestMountedVpks(_) => ControlKind::RequestMountedVpks,
            ControlMessage::MountedVpksResponse(_) => ControlKind::MountedVpksResponse,
            ControlMessage::RequestInitialSnapshot(_) => ControlKind::RequestInitialSnapshot,
            ControlMessage::InitialSnapshotResponse(_) => ControlKind::InitialSnapshotResponse,
            ControlMessage::ClientReady(_) => ControlKind::ClientReady,
            ControlMessage::Activate(_) => ControlKind::Activate,
            ControlMessage::Kick(_) => ControlKind::Kick,
            ControlMessage::RestartHandshake(_) => ControlKind::RestartHandshake,
            ControlMessage::TargetedMessage(_) => ControlKind::TargetedMessage,
            ControlMessage::TargetedInternalMessage(_) => ControlKind::TargetedInternalMessage,
        }
    }

    /// Handshake id carried by the message, if it belongs to the handshake sequence.
    pub fn handshake_id(&self) -> Option<HandshakeId> {
        match self {
            ControlMessage::ServerInfo(m) => Some(m.handshake_id),
            ControlMessage::UserInfo(m) => Some(m.handshake_id),
            ControlMessage::Welcome(m) => Some(m.handshake_id),
            ControlMessage::RequestMountedVpks(m) => Some(m.handshake_id),
            ControlMessage::MountedVpksResponse(m) => Some(m.handshake_id),
            ControlMessage::RequestInitialSnapshot(m) => Some(m.handshake_id),
            ControlMessage::InitialSnapshotResponse(m) => Some(m.handshake_id),
            ControlMessage::ClientReady(m) => Some(m.handshake_id),
            ControlMessage::Activate(m) => Some(m.handshake_id),
            _ => None,
        }
    }

    /// Decode the bincode body of a control frame.
    pub fn decode(kind: ControlKind, body: &[u8]) -> Result<Self> {
        let msg = match kind {
            ControlKind::ServerInfo => ControlMessage::ServerInfo(bincode::deserialize(body)?),
            ControlKind::UserInfo => ControlMessage::UserInfo(bincode::deserialize(body)?),
            ControlKind::Welcome => ControlMessage::Welcome(bincode::deserialize(body)?),
            ControlKind::RequestMountedVpks => {
                ControlMessage::RequestMountedVpks(bincode::deserialize(body)?)
            }
            ControlKind::MountedVpksResponse => {
                ControlMessage::MountedVpksResponse(bincode::deserialize(body)?)
            }
            ControlKind::RequestInitialSnapshot => {
                ControlMessage::RequestInitialSnapshot(bincode::deserialize(body)?)
            }
            ControlKind::InitialSnapshotResponse => {
                ControlMessage::InitialSnapshotResponse(bincode::deserialize(body)?)
            }
            ControlKind::ClientReady => ControlMessage::ClientReady(bincode::deserialize(body)?),
            ControlKind::Activate => ControlMessage::Activate(bincode::deserialize(body)?),
            ControlKind::Kick => ControlMessage::Kick(bincode::deserialize(body)?),
            ControlKind::RestartHandshake => {
                ControlMessage::RestartHandshake(bincode::deserialize(body)?)
            }
            ControlKind::TargetedMessage => {
                ControlMessage::TargetedMessage(bincode::deserialize(body)?)
            }
            ControlKind::TargetedInternalMessage => {
                ControlMessage::TargetedInternalMessage(bincode::deserialize(body)?)
            }
        };
        Ok(msg)
    }

    /// Encode as a complete frame: discriminator followed by the bincode body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match self {
            ControlMessage::ServerInfo(m) => bincode::serialize(m)?,
            ControlMessage::UserInfo(m) => bincode::serialize(m)?,
            ControlMessage::Welcome(m) => bincode::serialize(m)?,
            ControlMessage::RequestMountedVpks(m) => bincode::serialize(m)?,
            ControlMessage::MountedVpksResponse(m) => bincode::serialize(m)?,
            ControlMessage::RequestInitialSnapshot(m) => bincode::serialize(m)?,
            ControlMessage::InitialSnapshotResponse(m) => bincode::serialize(m)?,
            ControlMessage::ClientReady(m) => bincode::serialize(m)?,
            ControlMessage::Activate(m) => bincode::serialize(m)?,
            ControlMessage::Kick(m) => bincode::serialize(m)?,
            ControlMessage::RestartHandshake(m) => bincode::serialize(m)?,
            ControlMessage::TargetedMessage(m) => bincode::serialize(m)?,
            ControlMessage::TargetedInternalMessage(m) => bincode::serialize(m)?,
        };
        let mut writer = WireWriter::with_capacity(4 + body.len());
        writer.put_u32(self.kind().discriminator()).put_slice(&body);
        Ok(writer.finish())
    }
}

/// Heartbeat ping frame.
pub fn encode_ping(real_time: f64, sim_time: f64) -> Vec<u8> {
    let mut writer = WireWriter::with_capacity(20);
    writer
        .put_u32(HEARTBEAT_PING)
        .put_f64(real_time)
        .put_f64(sim_time);
    writer.finish()
}

/// Heartbeat pong frame echoing the ping's real time.
pub fn encode_pong(real_time: f64) -> Vec<u8> {
    let mut writer = WireWriter::with_capacity(12);
    writer.put_u32(HEARTBEAT_PONG).put_f64(real_time);
    writer.finish()
}

pub fn encode_delta(kind: DeltaKind, data: &[u8]) -> Vec<u8> {
    let mut writer = WireWriter::with_capacity(8 + data.len());
    writer
        .put_u32(kind.discriminator())
        .put_length_prefixed(data);
    writer.finish()
}

pub fn encode_cull_state(data: &[u8]) -> Vec<u8> {
    let mut writer = WireWriter::with_capacity(8 + data.len());
    writer.put_u32(CULL_STATE_CHANGE).put_length_prefixed(data);
    writer.finish()
}

/// Client tick: origin count, `count * 3` floats, then the command blob.
pub fn encode_client_tick(origins: &[[f32; 3]], commands: &[u8]) -> Vec<u8> {
    let mut writer = WireWriter::with_capacity(8 + origins.len() * 12 + commands.len());
    writer.put_u32(CLIENT_TICK).put_u32(origins.len() as u32);
    for origin in origins {
        writer.put_f32(origin[0]).put_f32(origin[1]).put_f32(origin[2]);
    }
    writer.put_slice(commands);
    writer.finish()
}

pub fn encode_request(id: &uuid::Uuid, inner: &[u8]) -> Vec<u8> {
    let mut writer = WireWriter::with_capacity(20 + inner.len());
    writer.put_u32(REQUEST).put_uuid(id).put_slice(inner);
    writer.finish()
}

pub fn encode_response(id: &uuid::Uuid, inner: &[u8]) -> Vec<u8> {
    let mut writer = WireWriter::with_capacity(20 + inner.len());
    writer.put_u32(RESPONSE).put_uuid(id).put_slice(inner);
    writer.finish()
}

/// Frame for an application-registered static message.
pub fn encode_static(discriminator: u32, body: &[u8]) -> Vec<u8> {
    let mut writer = WireWriter::with_capacity(4 + body.len());
    writer.put_u32(discriminator).put_slice(body);
    writer.finish()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_control_discriminators_are_stable() {
        for value in 100..=112 {
            let kind = ControlKind::from_discriminator(value).unwrap();
            assert_eq!(kind.discriminator(), value);
        }
        assert!(ControlKind::from_discriminator(113).is_none());
        assert!(ControlKind::from_discriminator(PACKED).is_none());
    }

    #[test]
    fn test_control_message_frame_layout() {
        let msg = ControlMessage::Kick(Kick {
            reason: "bye".into(),
        });
        let frame = msg.encode().unwrap();
        assert_eq!(&frame[..4], &109u32.to_be_bytes());
        let decoded = ControlMessage::decode(ControlKind::Kick, &frame[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_truncated_body_is_decode_error() {
        let msg = ControlMessage::UserInfo(UserInfo {
            handshake_id: HandshakeId::new(),
            display_name: "player".into(),
        });
        let frame = msg.encode().unwrap();
        let result = ControlMessage::decode(ControlKind::UserInfo, &frame[4..frame.len() - 3]);
        assert!(result.is_err());
    }
}

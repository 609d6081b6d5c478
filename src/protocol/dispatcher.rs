use crate::core::wire::WireReader;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::connection::ConnectionId;
use crate::protocol::message::{
    ControlKind, DeltaKind, CHUNK, CLIENT_TICK, CULL_STATE_CHANGE, DELTA_SNAPSHOT,
    DELTA_SNAPSHOT_ACK, DELTA_SNAPSHOT_CLUSTER, FIRST_APPLICATION_DISCRIMINATOR, HEARTBEAT_PING,
    HEARTBEAT_PONG, PACKED, REQUEST, RESPONSE,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Deepest allowed nesting of chunk/request/targeted wrappers.
pub const MAX_NESTING_DEPTH: u8 = 8;

/// Who a message is attributed to while it is being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContext {
    /// Logical sender; falls back to `origin` when a relayed sender is unknown
    pub source: ConnectionId,
    pub source_is_host: bool,
    /// Connection the bytes physically arrived on
    pub origin: ConnectionId,
    /// Written by a peer other than `origin` and forwarded by it
    pub relayed: bool,
    /// Set while handling the inner message of a Request
    pub request_id: Option<Uuid>,
    pub depth: u8,
}

impl MessageContext {
    pub fn direct(origin: ConnectionId, origin_is_host: bool) -> Self {
        Self {
            source: origin,
            source_is_host: origin_is_host,
            origin,
            relayed: false,
            request_id: None,
            depth: 0,
        }
    }

    /// Context for a message unwrapped from another one.
    pub fn nested(&self) -> Result<Self> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(ProtocolError::ProtocolViolation(
                constants::ERR_NESTING_TOO_DEEP.into(),
            ));
        }
        Ok(Self {
            depth: self.depth + 1,
            ..*self
        })
    }

    pub fn is_relayed(&self) -> bool {
        self.relayed
    }
}

/// A frame with its outer discriminator decoded; payloads borrow the frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope<'a> {
    HeartbeatPing { real_time: f64, sim_time: f64 },
    HeartbeatPong { real_time: f64 },
    Delta { kind: DeltaKind, data: &'a [u8] },
    ClientTick { origins: Vec<[f32; 3]>, commands: &'a [u8] },
    CullState { data: &'a [u8] },
    Chunk { index: u32, total: u32, data: &'a [u8] },
    Request { id: Uuid, inner: &'a [u8] },
    Response { id: Uuid, inner: &'a [u8] },
    Packed { type_id: u32, body: &'a [u8] },
    Control { kind: ControlKind, body: &'a [u8] },
    Static { discriminator: u32, body: &'a [u8] },
}

/// Decode the leading discriminator and the fixed fields behind it.
///
/// Checks run in dispatch priority order. Bodies of control, packed and
/// application messages are left for their handlers to decode.
pub fn decode_envelope(frame: &[u8]) -> Result<Envelope<'_>> {
    if frame.is_empty() {
        return Err(ProtocolError::DecodeError(constants::ERR_EMPTY_FRAME.into()));
    }
    let mut reader = WireReader::new(frame);
    let discriminator = reader.read_u32()?;

    let envelope = match discriminator {
        HEARTBEAT_PING => Envelope::HeartbeatPing {
            real_time: reader.read_f64()?,
            sim_time: reader.read_f64()?,
        },
        HEARTBEAT_PONG => Envelope::HeartbeatPong {
            real_time: reader.read_f64()?,
        },
        DELTA_SNAPSHOT => Envelope::Delta {
            kind: DeltaKind::Snapshot,
            data: reader.read_length_prefixed()?,
        },
        DELTA_SNAPSHOT_ACK => Envelope::Delta {
            kind: DeltaKind::Ack,
            data: reader.read_length_prefixed()?,
        },
        DELTA_SNAPSHOT_CLUSTER => Envelope::Delta {
            kind: DeltaKind::Cluster,
            data: reader.read_length_prefixed()?,
        },
        CLIENT_TICK => {
            let count = reader.read_u32()? as usize;
            // 12 bytes per origin; refuse counts the frame cannot hold before allocating
            if count.saturating_mul(12) > reader.remaining() {
                return Err(ProtocolError::DecodeError(format!(
                    "Client tick claims {count} origins but only {} bytes remain",
                    reader.remaining()
                )));
            }
            let mut origins = Vec::with_capacity(count);
            for _ in 0..count {
                origins.push([reader.read_f32()?, reader.read_f32()?, reader.read_f32()?]);
            }
            Envelope::ClientTick {
                origins,
                commands: reader.rest(),
            }
        }
        CULL_STATE_CHANGE => Envelope::CullState {
            data: reader.read_length_prefixed()?,
        },
        CHUNK => Envelope::Chunk {
            index: reader.read_u32()?,
            total: reader.read_u32()?,
            data: reader.rest(),
        },
        REQUEST => Envelope::Request {
            id: reader.read_uuid()?,
            inner: reader.rest(),
        },
        RESPONSE => Envelope::Response {
            id: reader.read_uuid()?,
            inner: reader.rest(),
        },
        PACKED => Envelope::Packed {
            type_id: reader.read_u32()?,
            body: reader.rest(),
        },
        d => match ControlKind::from_discriminator(d) {
            Some(kind) => Envelope::Control {
                kind,
                body: reader.rest(),
            },
            None => Envelope::Static {
                discriminator: d,
                body: reader.rest(),
            },
        },
    };
    Ok(envelope)
}

/// Application static message handler. A returned frame is sent back to the
/// source (as a Response when the message arrived inside a Request).
pub type StaticHandlerFn =
    dyn Fn(&MessageContext, &[u8]) -> Result<Option<Vec<u8>>> + Send + Sync + 'static;

/// Discriminator-keyed fallback table for application control messages.
#[derive(Clone)]
pub struct StaticTable {
    handlers: Arc<RwLock<HashMap<u32, Box<StaticHandlerFn>>>>,
}

impl Default for StaticTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticTable {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a handler for an application discriminator (>= 1000).
    pub fn register<F>(&self, discriminator: u32, handler: F) -> Result<()>
    where
        F: Fn(&MessageContext, &[u8]) -> Result<Option<Vec<u8>>> + Send + Sync + 'static,
    {
        if discriminator < FIRST_APPLICATION_DISCRIMINATOR {
            return Err(ProtocolError::Custom(format!(
                "Discriminator {discriminator} is reserved for built-in messages"
            )));
        }

        let mut handlers = self.handlers.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })?;

        handlers.insert(discriminator, Box::new(handler));
        Ok(())
    }

    pub fn contains(&self, discriminator: u32) -> bool {
        self.handlers
            .read()
            .map(|handlers| handlers.contains_key(&discriminator))
            .unwrap_or(false)
    }

    pub fn dispatch(
        &self,
        discriminator: u32,
        ctx: &MessageContext,
        body: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let handlers = self.handlers.read().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string())
        })?;

        handlers
            .get(&discriminator)
            .ok_or(ProtocolError::UnknownDiscriminator(discriminator))
            .and_then(|handler| handler(ctx, body))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::protocol::message::{
        encode_client_tick, encode_delta, encode_ping, encode_request, encode_static,
    };

    #[test]
    fn test_decode_fixed_layouts() {
        match decode_envelope(&encode_ping(1.25, 9.5)).unwrap() {
            Envelope::HeartbeatPing {
                real_time,
                sim_time,
            } => {
                assert_eq!(real_time, 1.25);
                assert_eq!(sim_time, 9.5);
            }
            other => panic!("unexpected {other:?}"),
        }

        let frame = encode_delta(DeltaKind::Cluster, b"delta");
        assert_eq!(
            decode_envelope(&frame).unwrap(),
            Envelope::Delta {
                kind: DeltaKind::Cluster,
                data: b"delta"
            }
        );
    }

    #[test]
    fn test_client_tick_with_and_without_commands() {
        let frame = encode_client_tick(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]], b"cmds");
        match decode_envelope(&frame).unwrap() {
            Envelope::ClientTick { origins, commands } => {
                assert_eq!(origins, vec![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
                assert_eq!(commands, b"cmds");
            }
            other => panic!("unexpected {other:?}"),
        }

        let frame = encode_client_tick(&[], &[]);
        match decode_envelope(&frame).unwrap() {
            Envelope::ClientTick { origins, commands } => {
                assert!(origins.is_empty());
                assert!(commands.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_client_tick_with_lying_count_is_rejected() {
        let mut frame = CLIENT_TICK.to_be_bytes().to_vec();
        frame.extend_from_slice(&u32::MAX.to_be_bytes());
        frame.extend_from_slice(&[0u8; 24]);
        assert!(matches!(
            decode_envelope(&frame),
            Err(ProtocolError::DecodeError(_))
        ));
    }

    #[test]
    fn test_request_wraps_inner_frame() {
        let id = Uuid::new_v4();
        let inner = encode_static(1001, b"body");
        let frame = encode_request(&id, &inner);
        match decode_envelope(&frame).unwrap() {
            Envelope::Request { id: got, inner: got_inner } => {
                assert_eq!(got, id);
                assert_eq!(got_inner, inner.as_slice());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_discriminator_falls_to_static() {
        let frame = encode_static(4242, b"?");
        assert_eq!(
            decode_envelope(&frame).unwrap(),
            Envelope::Static {
                discriminator: 4242,
                body: b"?"
            }
        );
        assert!(decode_envelope(&[]).is_err());
        assert!(decode_envelope(&[0, 0]).is_err());
    }

    #[test]
    fn test_static_table() {
        let table = StaticTable::new();
        assert!(table.register(5, |_, _| Ok(None)).is_err());
        table
            .register(2000, |_, body| Ok(Some(body.to_vec())))
            .unwrap();

        let ctx = MessageContext::direct(ConnectionId::new(), false);
        assert_eq!(
            table.dispatch(2000, &ctx, b"echo").unwrap(),
            Some(b"echo".to_vec())
        );
        assert!(matches!(
            table.dispatch(2001, &ctx, b""),
            Err(ProtocolError::UnknownDiscriminator(2001))
        ));
    }

    #[test]
    fn test_nesting_is_bounded() {
        let mut ctx = MessageContext::direct(ConnectionId::new(), false);
        for _ in 0..MAX_NESTING_DEPTH {
            ctx = ctx.nested().unwrap();
        }
        assert!(matches!(
            ctx.nested(),
            Err(ProtocolError::ProtocolViolation(_))
        ));
    }
}

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests for framing, nesting limits and roster rules
//! Malformed input must never panic; only protocol violations cost a peer its connection

use serde::{Deserialize, Serialize};
use session_net::config::NetworkConfig;
use session_net::error::ProtocolError;
use session_net::protocol::chunking::split_message;
use session_net::protocol::dispatcher::{decode_envelope, Envelope, MessageContext, StaticTable};
use session_net::protocol::message::{
    encode_client_tick, encode_request, encode_static, ControlKind, ControlMessage, CHUNK,
};
use session_net::protocol::registry::{PackedMessage, TypeRegistry};
use session_net::service::{MemoryGameplay, NetworkEvent, NetworkSystem};
use session_net::transport::memory::MemoryTransport;
use session_net::transport::Transport;
use session_net::ConnectionId;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct Score {
    points: u32,
}

impl PackedMessage for Score {
    const TYPE_ID: u32 = 3;
}

fn host_with_raw_client(config: NetworkConfig) -> (NetworkSystem, ConnectionId, MemoryTransport) {
    let mut host = NetworkSystem::host(config, Box::new(MemoryGameplay::default()));
    let (host_end, raw) = MemoryTransport::pair();
    let id = host.add_connection(Box::new(host_end)).unwrap();
    (host, id, raw)
}

fn drain(raw: &mut MemoryTransport) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    raw.poll_incoming(&mut |frame| frames.push(frame));
    frames
}

// ============================================================================
// FRAME DECODING
// ============================================================================

#[test]
fn test_empty_frame_is_a_decode_error() {
    assert!(matches!(
        decode_envelope(&[]),
        Err(ProtocolError::DecodeError(_))
    ));
}

#[test]
fn test_short_discriminator_is_a_decode_error() {
    for len in 1..4 {
        let frame = vec![0u8; len];
        assert!(decode_envelope(&frame).is_err(), "len {len} should fail");
    }
}

#[test]
fn test_client_tick_claiming_too_many_origins() {
    let mut frame = encode_client_tick(&[[1.0, 2.0, 3.0]], b"");
    // overwrite the origin count with something the frame cannot hold
    frame[4..8].copy_from_slice(&u32::MAX.to_be_bytes());
    assert!(matches!(
        decode_envelope(&frame),
        Err(ProtocolError::DecodeError(_))
    ));
}

#[test]
fn test_control_discriminators_decode_as_control() {
    let frame = encode_static(104, b"");
    match decode_envelope(&frame).unwrap() {
        Envelope::Control { kind, body } => {
            assert_eq!(kind, ControlKind::MountedVpksResponse);
            assert!(body.is_empty());
            // an empty bincode body is not a valid control message
            assert!(ControlMessage::decode(kind, body).is_err());
        }
        other => panic!("expected control envelope, got {other:?}"),
    }
}

#[test]
fn test_unassigned_discriminator_falls_through_to_static() {
    match decode_envelope(&encode_static(999, b"x")).unwrap() {
        Envelope::Static {
            discriminator,
            body,
        } => {
            assert_eq!(discriminator, 999);
            assert_eq!(body, b"x");
        }
        other => panic!("expected static envelope, got {other:?}"),
    }
}

// ============================================================================
// HANDLER TABLES
// ============================================================================

#[test]
fn test_unknown_ids_are_errors() {
    let ctx = MessageContext::direct(ConnectionId::new(), false);

    let registry = TypeRegistry::new();
    assert!(matches!(
        registry.dispatch(42, &ctx, b""),
        Err(ProtocolError::UnknownPackedType(42))
    ));

    let statics = StaticTable::new();
    assert!(matches!(
        statics.dispatch(1234, &ctx, b""),
        Err(ProtocolError::UnknownDiscriminator(1234))
    ));
}

#[test]
fn test_duplicate_and_reserved_registrations_fail() {
    let mut registry = TypeRegistry::new();
    registry.register::<Score, _>(|_, _| Ok(None)).unwrap();
    assert!(registry.register::<Score, _>(|_, _| Ok(None)).is_err());
    assert_eq!(registry.len(), 1);

    let statics = StaticTable::new();
    assert!(statics.register(41, |_, _| Ok(None)).is_err());
    assert!(statics.register(1000, |_, _| Ok(None)).is_ok());
}

#[test]
fn test_garbage_packed_body_is_dropped_without_kick() {
    let (mut host, id, mut raw) = host_with_raw_client(NetworkConfig::default());
    host.registry_mut()
        .register::<Score, _>(|_, _| Ok(None))
        .unwrap();

    let mut frame = TypeRegistry::encode(&Score { points: 10 }).unwrap();
    frame.truncate(frame.len() - 2);
    raw.send_raw(&frame).unwrap();
    host.tick_at(0.0);

    assert!(host.connection(id).is_some());
    assert_eq!(host.metrics().snapshot().decode_failures, 1);
}

#[test]
fn test_handler_error_is_dropped_without_kick() {
    let (mut host, id, mut raw) = host_with_raw_client(NetworkConfig::default());
    host.registry_mut()
        .register::<Score, _>(|_, score| {
            Err(ProtocolError::HandlerError(format!("rejecting {}", score.points)))
        })
        .unwrap();

    raw.send_raw(&TypeRegistry::encode(&Score { points: 7 }).unwrap())
        .unwrap();
    host.tick_at(0.0);

    assert!(host.connection(id).is_some());
    assert_eq!(host.metrics().snapshot().decode_failures, 1);
}

// ============================================================================
// NESTING AND CHUNKS
// ============================================================================

#[test]
fn test_excessive_request_nesting_kicks_sender() {
    let (mut host, id, mut raw) = host_with_raw_client(NetworkConfig::default());
    host.statics().register(1000, |_, _| Ok(Some(b"hi".to_vec()))).unwrap();
    drain(&mut raw);

    let mut frame = encode_static(1000, b"deep");
    for _ in 0..9 {
        frame = encode_request(&Uuid::new_v4(), &frame);
    }
    raw.send_raw(&frame).unwrap();
    host.tick_at(0.0);

    assert!(host.connection(id).is_none());
    assert_eq!(host.metrics().snapshot().protocol_violations, 1);
    let notices: Vec<_> = drain(&mut raw)
        .iter()
        .filter_map(|frame| match decode_envelope(frame) {
            Ok(Envelope::Control { kind, body }) => ControlMessage::decode(kind, body).ok(),
            _ => None,
        })
        .collect();
    assert!(matches!(notices.as_slice(), [ControlMessage::Kick(_)]));
}

#[test]
fn test_nesting_within_the_limit_is_answered() {
    let (mut host, _id, mut raw) = host_with_raw_client(NetworkConfig::default());
    host.statics().register(1000, |_, _| Ok(Some(b"hi".to_vec()))).unwrap();
    drain(&mut raw);

    let mut frame = encode_static(1000, b"shallow");
    for _ in 0..3 {
        frame = encode_request(&Uuid::new_v4(), &frame);
    }
    raw.send_raw(&frame).unwrap();
    host.tick_at(0.0);

    let replies = drain(&mut raw);
    assert_eq!(replies.len(), 1);
    assert!(matches!(
        decode_envelope(&replies[0]).unwrap(),
        Envelope::Response { .. }
    ));
}

#[test]
fn test_out_of_order_chunk_kicks_sender() {
    let (mut host, id, mut raw) = host_with_raw_client(NetworkConfig::default());
    let message = encode_static(1000, &[9u8; 1000]);
    let chunks = split_message(&message, 256).unwrap();

    raw.send_raw(&chunks[1]).unwrap();
    host.tick_at(0.0);

    assert!(host.connection(id).is_none());
    assert!(host.drain_events().iter().any(|event| matches!(
        event,
        NetworkEvent::Kicked { reason, .. } if reason.contains("out of order")
    )));
    assert_eq!(host.metrics().snapshot().protocol_violations, 1);
}

#[test]
fn test_single_chunk_total_kicks_sender() {
    let (mut host, id, mut raw) = host_with_raw_client(NetworkConfig::default());
    let mut frame = CHUNK.to_be_bytes().to_vec();
    frame.extend_from_slice(&0u32.to_be_bytes());
    frame.extend_from_slice(&1u32.to_be_bytes());
    frame.extend_from_slice(b"lonely");

    raw.send_raw(&frame).unwrap();
    host.tick_at(0.0);
    assert!(host.connection(id).is_none());
}

#[test]
fn test_chunk_inside_chunk_kicks_sender() {
    let (mut host, id, mut raw) = host_with_raw_client(NetworkConfig::default());

    let mut inner = CHUNK.to_be_bytes().to_vec();
    inner.extend_from_slice(&0u32.to_be_bytes());
    inner.extend_from_slice(&2u32.to_be_bytes());
    inner.extend_from_slice(&[0u8; 600]);

    for frame in split_message(&inner, 256).unwrap() {
        raw.send_raw(&frame).unwrap();
    }
    host.tick_at(0.0);

    assert!(host.connection(id).is_none());
    assert!(host.drain_events().iter().any(|event| matches!(
        event,
        NetworkEvent::Kicked { reason, .. } if reason.contains("itself a chunk")
    )));
}

#[test]
fn test_chunk_inside_request_kicks_sender() {
    let (mut host, id, mut raw) = host_with_raw_client(NetworkConfig::default());
    let fragments = split_message(&encode_static(1000, &[5u8; 600]), 256).unwrap();

    raw.send_raw(&encode_request(&Uuid::new_v4(), &fragments[0]))
        .unwrap();
    host.tick_at(0.0);

    assert!(host.connection(id).is_none());
    assert!(host.drain_events().iter().any(|event| matches!(
        event,
        NetworkEvent::Kicked { reason, .. } if reason.contains("must not be wrapped")
    )));
}

#[test]
fn test_oversized_assembly_kicks_sender() {
    let config = NetworkConfig::default_with_overrides(|config| {
        config.session.max_message_size = 256;
    });
    let (mut host, id, mut raw) = host_with_raw_client(config);

    // 256 bytes per fragment times 1024 fragments is the most a peer may rebuild
    for index in 0..65u32 {
        let mut frame = CHUNK.to_be_bytes().to_vec();
        frame.extend_from_slice(&index.to_be_bytes());
        frame.extend_from_slice(&1024u32.to_be_bytes());
        frame.extend_from_slice(&[0u8; 4096]);
        raw.send_raw(&frame).unwrap();
    }
    host.tick_at(0.0);

    assert!(host.connection(id).is_none());
    assert!(host.drain_events().iter().any(|event| matches!(
        event,
        NetworkEvent::Kicked { reason, .. } if reason.contains("too large")
    )));
    assert_eq!(host.metrics().snapshot().protocol_violations, 1);
}

#[test]
fn test_restarted_chunk_sequence_discards_partial_message() {
    let (mut host, id, mut raw) = host_with_raw_client(NetworkConfig::default());
    let received = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = received.clone();
    host.statics()
        .register(1000, move |_, body| {
            sink.lock().unwrap().push(body.len());
            Ok(None)
        })
        .unwrap();

    let first = split_message(&encode_static(1000, &[1u8; 700]), 256).unwrap();
    let second = split_message(&encode_static(1000, &[2u8; 900]), 256).unwrap();
    raw.send_raw(&first[0]).unwrap();
    for frame in &second {
        raw.send_raw(frame).unwrap();
    }
    host.tick_at(0.0);

    assert!(host.connection(id).is_some());
    assert_eq!(received.lock().unwrap().as_slice(), &[900]);
}

// ============================================================================
// ROSTER RULES
// ============================================================================

#[test]
fn test_session_full_rejects_new_connections() {
    let config = NetworkConfig::default_with_overrides(|config| {
        config.session.max_connections = 1;
    });
    let mut host = NetworkSystem::host(config, Box::new(MemoryGameplay::default()));
    let (first, _keep_first) = MemoryTransport::pair();
    let (second, _keep_second) = MemoryTransport::pair();

    host.add_connection(Box::new(first)).unwrap();
    let err = host.add_connection(Box::new(second)).expect_err("session is full");
    assert!(err.to_string().contains("Session full"));
    assert_eq!(host.connection_count(), 1);
}

#[test]
fn test_roles_are_enforced_when_adding_connections() {
    let mut host = NetworkSystem::host(NetworkConfig::default(), Box::new(MemoryGameplay::default()));
    let (end, _peer) = MemoryTransport::pair();
    assert!(host.connect_to_host(Box::new(end)).is_err());

    let mut client =
        NetworkSystem::client(NetworkConfig::default(), Box::new(MemoryGameplay::default()));
    let (end, _peer) = MemoryTransport::pair();
    assert!(client.add_connection(Box::new(end)).is_err());

    let (first, _keep) = MemoryTransport::pair();
    client.connect_to_host(Box::new(first)).unwrap();
    let (second, _keep_second) = MemoryTransport::pair();
    assert!(client.connect_to_host(Box::new(second)).is_err());
    assert_eq!(client.connection_count(), 1);
}

#[test]
fn test_closed_transport_is_removed_on_tick() {
    let (mut host, id, raw) = host_with_raw_client(NetworkConfig::default());
    drop(raw);
    host.tick_at(0.0);

    assert!(host.connection(id).is_none());
    assert!(host.drain_events().iter().any(|event| matches!(
        event,
        NetworkEvent::Disconnected { connection, .. } if *connection == id
    )));
}

#[test]
fn test_acceptor_hands_connections_over_from_other_threads() {
    let mut host = NetworkSystem::host(NetworkConfig::default(), Box::new(MemoryGameplay::default()));
    let acceptor = host.acceptor();

    let peers: Vec<MemoryTransport> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let acceptor = acceptor.clone();
                scope.spawn(move || {
                    let (host_end, peer) = MemoryTransport::pair();
                    acceptor.accept(Box::new(host_end)).unwrap();
                    peer
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert_eq!(host.connection_count(), 0);
    host.tick_at(0.0);
    assert_eq!(host.connection_count(), 4);
    drop(peers);
}

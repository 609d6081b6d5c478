//! Integration tests for the length-delimited stream transport

#![allow(clippy::unwrap_used, clippy::expect_used)]

use session_net::config::NetworkConfig;
use session_net::service::{MemoryGameplay, NetworkEvent, NetworkSystem};
use session_net::transport::stream::{connect_tcp, serve_tcp, StreamTransport};
use session_net::transport::Transport;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const MAX_FRAME: usize = 1024 * 1024;

async fn collect_frames(transport: &mut StreamTransport, want: usize) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    for _ in 0..200 {
        transport.poll_incoming(&mut |frame| frames.push(frame));
        if frames.len() >= want {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    frames
}

async fn run_until_joined(host: &mut NetworkSystem, client: &mut NetworkSystem) -> bool {
    for _ in 0..400 {
        host.tick();
        client.tick();
        if client
            .drain_events()
            .iter()
            .any(|event| matches!(event, NetworkEvent::Joined(_)))
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn test_frames_cross_a_duplex_stream_in_order() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let mut left = StreamTransport::spawn(a, MAX_FRAME);
    let mut right = StreamTransport::spawn(b, MAX_FRAME);

    left.send_raw(b"first").unwrap();
    left.send_raw(&[]).unwrap();
    left.send_raw(&vec![7u8; 40_000]).unwrap();

    let frames = collect_frames(&mut right, 3).await;
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0], b"first".to_vec());
    assert!(frames[1].is_empty());
    assert_eq!(frames[2].len(), 40_000);
}

#[tokio::test]
async fn test_close_is_noticed_by_the_other_end() {
    let (a, b) = tokio::io::duplex(1024);
    let mut left = StreamTransport::spawn(a, MAX_FRAME);
    let right = StreamTransport::spawn(b, MAX_FRAME);

    left.close("done");
    assert!(!left.is_open());
    assert!(left.send_raw(b"late").is_err());

    let mut closed = false;
    for _ in 0..200 {
        if !right.is_open() {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(closed);
}

#[tokio::test]
async fn test_oversized_frame_closes_the_reader() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let mut left = StreamTransport::spawn(a, MAX_FRAME);
    let mut right = StreamTransport::spawn(b, 1024);

    left.send_raw(&vec![1u8; 4096]).unwrap();

    let frames = collect_frames(&mut right, 1).await;
    assert!(frames.is_empty());
    assert!(!right.is_open());
}

#[tokio::test]
async fn test_handshake_over_duplex_stream() {
    let game = MemoryGameplay::new(b"streamed world".to_vec(), vec!["base".into()]);
    let mut host = NetworkSystem::host(NetworkConfig::default(), Box::new(game.clone()));
    let client_game = MemoryGameplay::default();
    let mut client = NetworkSystem::client(NetworkConfig::default(), Box::new(client_game.clone()));

    let (a, b) = tokio::io::duplex(64 * 1024);
    host.add_connection(Box::new(StreamTransport::spawn(a, MAX_FRAME)))
        .unwrap();
    client
        .connect_to_host(Box::new(StreamTransport::spawn(b, MAX_FRAME)))
        .unwrap();

    assert!(run_until_joined(&mut host, &mut client).await);
    assert_eq!(
        client_game.state().applied_snapshots,
        vec![b"streamed world".to_vec()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let game = MemoryGameplay::new(b"tcp world".to_vec(), Vec::new());
    let mut host = NetworkSystem::host(NetworkConfig::default(), Box::new(game));
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let server = tokio::spawn(serve_tcp(listener, host.acceptor(), MAX_FRAME, shutdown_rx));

    let client_game = MemoryGameplay::default();
    let mut client = NetworkSystem::client(NetworkConfig::default(), Box::new(client_game.clone()));
    let transport = connect_tcp(addr, MAX_FRAME).await.unwrap();
    client.connect_to_host(Box::new(transport)).unwrap();

    assert!(run_until_joined(&mut host, &mut client).await);
    assert_eq!(host.connection_count(), 1);
    assert_eq!(client_game.state().applied_snapshots, vec![b"tcp world".to_vec()]);

    shutdown_tx.send(()).await.unwrap();
    server.await.unwrap().unwrap();
}

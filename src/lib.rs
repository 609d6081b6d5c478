//! # session-net
//!
//! Handshake state machine and message framing for peer-to-host multiplayer
//! sessions.
//!
//! One peer is the host and holds authority over world state; every other
//! peer is a client connected to it. Each connection walks a fixed join
//! handshake before gameplay traffic flows, and every received frame is
//! routed by its leading discriminator to a specialized path or a handler
//! table.
//!
//! ## Layers
//! - [`transport`]: byte pipes (in-memory pairs, length-delimited streams)
//! - [`protocol`]: framing, dispatch, chunking, handshake, authority, routing
//! - [`service`]: the `NetworkSystem` that owns the roster and runs `tick`
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics
//!
//! ## Example
//! ```rust
//! use session_net::config::NetworkConfig;
//! use session_net::service::{MemoryGameplay, NetworkEvent, NetworkSystem};
//! use session_net::transport::memory::MemoryTransport;
//!
//! let gameplay = MemoryGameplay::new(b"world".to_vec(), vec!["base".into()]);
//! let mut host = NetworkSystem::host(NetworkConfig::default(), Box::new(gameplay.clone()));
//! let mut client = NetworkSystem::client(NetworkConfig::default(), Box::new(gameplay));
//!
//! let (host_end, client_end) = MemoryTransport::pair();
//! client.connect_to_host(Box::new(client_end)).unwrap();
//! host.add_connection(Box::new(host_end)).unwrap();
//!
//! for step in 0..16 {
//!     host.tick_at(step as f64 * 0.01);
//!     client.tick_at(step as f64 * 0.01);
//! }
//! assert!(client
//!     .drain_events()
//!     .iter()
//!     .any(|event| matches!(event, NetworkEvent::Joined(_))));
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use error::{ProtocolError, Result};
pub use protocol::connection::{ChannelState, Connection, ConnectionId};
pub use service::{GameplaySystem, NetworkEvent, NetworkSystem};

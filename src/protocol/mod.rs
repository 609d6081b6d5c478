//! # Protocol Layer
//!
//! Message framing, dispatch and the join handshake.
//!
//! ## Components
//! - **Message**: discriminators, control message bodies and frame encoders
//! - **Dispatcher**: envelope decoding and the static handler table
//! - **Registry**: explicit type-id table for the `Packed` envelope
//! - **Chunking**: splitting and ordered reassembly of oversized messages
//! - **Connection**: per-peer state, stats and pending handshake steps
//! - **Handshake**: the six-state join sequence
//! - **Authority**: which side may send which message
//! - **Routing**: relaying targeted messages through the host
//! - **Heartbeat**: ping pacing and RTT samples
//! - **Request**: request/response correlation
//!
//! Every component here decides; none of them touches a transport. The
//! `NetworkSystem` in `service` carries the decisions out.

pub mod authority;
pub mod chunking;
pub mod connection;
pub mod dispatcher;
pub mod handshake;
pub mod heartbeat;
pub mod message;
pub mod registry;
pub mod request;
pub mod routing;

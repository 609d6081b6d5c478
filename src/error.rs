//! # Error Types
//!
//! Error handling for the session protocol.
//!
//! Every failure that can occur while decoding or handling a message is an
//! explicit `ProtocolError`. The dispatch loop inspects the error's
//! [`ErrorCategory`] to decide whether the offending connection is kicked or
//! the message is simply dropped.
//!
//! ## Error Categories
//! - **Protocol violations**: malformed chunk framing, wrappers nested too deeply, handshake steps out of order
//! - **Authority violations**: sender spoofing, host-only messages from clients
//! - **Decode errors**: truncated frames, unknown packed types, bad bincode bodies
//! - **Local failures**: snapshot application, transport and configuration errors
//!
//! ## Example Usage
//! ```rust
//! use session_net::error::{ErrorCategory, ProtocolError};
//!
//! let err = ProtocolError::ProtocolViolation("Invalid Handshake State Welcome".into());
//! assert_eq!(err.category(), ErrorCategory::ProtocolViolation);
//! assert!(err.is_connection_fatal());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Wire decoding
    pub const ERR_TRUNCATED_FRAME: &str = "Frame ended before the expected field";
    pub const ERR_EMPTY_FRAME: &str = "Empty frame";
    pub const ERR_NESTING_TOO_DEEP: &str = "Message wrappers nested too deeply";

    /// Chunk framing
    pub const ERR_CHUNK_TOTAL_TOO_SMALL: &str = "Chunk total must be greater than 1";
    pub const ERR_CHUNK_TOTAL_TOO_LARGE: &str = "Chunk total exceeds 1024";
    pub const ERR_CHUNK_INDEX_OUT_OF_RANGE: &str = "Chunk index out of range";
    pub const ERR_CHUNK_OUT_OF_ORDER: &str = "Chunk arrived out of order";
    pub const ERR_CHUNK_NESTED: &str = "Reassembled message is itself a chunk";
    pub const ERR_CHUNK_TOO_MANY: &str = "Message needs more than 1024 chunks";
    pub const ERR_CHUNK_ASSEMBLY_TOO_LARGE: &str = "Reassembled message too large";
    pub const ERR_CHUNK_NOT_TOP_LEVEL: &str = "Chunk frames must not be wrapped in other messages";

    /// Authority
    pub const ERR_SENDER_SPOOFED: &str = "Targeted message sender does not match origin";

    /// Connection
    pub const ERR_UNKNOWN_CONNECTION: &str = "Unknown connection";
    pub const ERR_NOT_HOST: &str = "Operation requires the local peer to be host";

    /// Dispatcher
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on static table";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on static table";
}

/// Coarse classification used by the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Corrupt or out-of-sequence traffic; the peer is kicked.
    ProtocolViolation,
    /// Masquerading authority; the peer is kicked.
    AuthorityViolation,
    /// A single message could not be decoded or handled; it is dropped.
    Decode,
    /// Failure on the local side, not attributable to the peer.
    Local,
}

// ProtocolError is the primary error type for all session operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Unknown packed type id: {0}")]
    UnknownPackedType(u32),

    #[error("Unknown message discriminator: {0}")]
    UnknownDiscriminator(u32),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Authority violation: {0}")]
    AuthorityViolation(String),

    #[error("Handler error: {0}")]
    HandlerError(String),

    #[error("Snapshot could not be applied: {0}")]
    SnapshotApply(String),

    #[error("Content mount failed: {0}")]
    ContentMount(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request cancelled")]
    RequestCancelled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Classify this error for the dispatch loop.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProtocolError::ProtocolViolation(_) => ErrorCategory::ProtocolViolation,
            ProtocolError::AuthorityViolation(_) => ErrorCategory::AuthorityViolation,
            ProtocolError::Serialization(_)
            | ProtocolError::DecodeError(_)
            | ProtocolError::UnknownPackedType(_)
            | ProtocolError::UnknownDiscriminator(_)
            | ProtocolError::HandlerError(_) => ErrorCategory::Decode,
            _ => ErrorCategory::Local,
        }
    }

    /// Whether the connection that produced this error must be kicked.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::ProtocolViolation | ErrorCategory::AuthorityViolation
        )
    }

    /// Reason string sent along with a kick.
    pub fn kick_reason(&self) -> String {
        match self {
            ProtocolError::ProtocolViolation(reason)
            | ProtocolError::AuthorityViolation(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

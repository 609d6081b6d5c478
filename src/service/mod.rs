//! # Session Service
//!
//! The orchestrating layer that ties transports, protocol components and the
//! gameplay collaborator together.
//!
//! ## Components
//! - **System**: `NetworkSystem`, the roster owner and per-tick dispatch loop
//! - **Gameplay**: the `GameplaySystem` hooks the session reports to

pub mod gameplay;
pub mod system;

pub use gameplay::{GameplaySystem, MemoryGameplay};
pub use system::{ConnectionAcceptor, NetworkEvent, NetworkSystem};

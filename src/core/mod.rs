//! # Core Wire Components
//!
//! Low-level, allocation-light helpers shared by every protocol module.
//!
//! ## Components
//! - **Wire**: checked big-endian readers and writers for frame fields
//!
//! ## Wire Format
//! ```text
//! [Discriminator(4)] [Wrapper fields...] [Payload(N)]
//! ```
//!
//! ## Security
//! - Every read is bounds-checked; a short frame is a decode error, never a panic
//! - Length prefixes are validated against the bytes actually present

pub mod wire;

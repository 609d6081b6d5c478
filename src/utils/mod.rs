//! # Utility Modules
//!
//! Supporting utilities shared by the session layer.
//!
//! ## Components
//! - **Logging**: structured subscriber setup driven by `LoggingConfig`
//! - **Metrics**: per-instance atomic session counters

pub mod logging;
pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};

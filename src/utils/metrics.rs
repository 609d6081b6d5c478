//! Session counters
//!
//! Each `NetworkSystem` owns one `Metrics`; nothing here is global, so two
//! peers in the same process (tests, listen servers) keep separate books.
//!
//! Uses atomic counters so a snapshot can be taken from another thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, trace};

/// Counters for one session peer
#[derive(Debug)]
pub struct Metrics {
    /// Connections ever added to the roster
    pub connections_total: AtomicU64,
    /// Connections currently in the roster
    pub connections_active: AtomicU64,
    /// Handshake attempts opened (restarts included)
    pub handshakes_started: AtomicU64,
    /// Handshakes that reached Connected
    pub handshakes_completed: AtomicU64,
    /// Connections removed by a kick
    pub kicks: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Chunked messages fully reassembled
    pub chunks_reassembled: AtomicU64,
    /// Messages dropped because they could not be decoded or handled
    pub decode_failures: AtomicU64,
    /// Protocol and authority violations
    pub protocol_violations: AtomicU64,
    /// Responses matched to an outstanding request
    pub requests_completed: AtomicU64,
    /// RTT samples accepted from pongs
    pub rtt_samples: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_started: AtomicU64::new(0),
            handshakes_completed: AtomicU64::new(0),
            kicks: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            chunks_reassembled: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            rtt_samples: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_added(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_removed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_started(&self) {
        self.handshakes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_completed(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn kick(&self) {
        self.kicks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn chunk_reassembled(&self) {
        self.chunks_reassembled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rtt_sample(&self) {
        self.rtt_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_started: self.handshakes_started.load(Ordering::Relaxed),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            kicks: self.kicks.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            chunks_reassembled: self.chunks_reassembled.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            rtt_samples: self.rtt_samples.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            handshakes_started = snapshot.handshakes_started,
            handshakes_completed = snapshot.handshakes_completed,
            kicks = snapshot.kicks,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            chunks_reassembled = snapshot.chunks_reassembled,
            decode_failures = snapshot.decode_failures,
            protocol_violations = snapshot.protocol_violations,
            requests_completed = snapshot.requests_completed,
            rtt_samples = snapshot.rtt_samples,
            uptime_seconds = snapshot.uptime_seconds,
            "Session metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_started: u64,
    pub handshakes_completed: u64,
    pub kicks: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub chunks_reassembled: u64,
    pub decode_failures: u64,
    pub protocol_violations: u64,
    pub requests_completed: u64,
    pub rtt_samples: u64,
    pub uptime_seconds: u64,
}

/// Wall-clock span of one operation, traced when dropped.
///
/// `NetworkSystem` times the handling of every received frame with one.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        trace!(
            operation = self.operation,
            duration_us = self.elapsed().as_micros() as u64,
            "Operation timed"
        );
    }
}

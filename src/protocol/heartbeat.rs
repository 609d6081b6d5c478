//! Host-driven ping/pong and round-trip time measurement.

use crate::protocol::connection::{ChannelState, Connection};
use std::time::Duration;
use tracing::{trace, warn};

/// Minimum spacing between ping broadcasts.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(330);

/// Stored RTT samples never exceed this.
pub const DEFAULT_RTT_CEILING: Duration = Duration::from_secs(2);

/// Paces ping broadcasts and turns pongs into RTT samples.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: f64,
    rtt_ceiling: f64,
    last_ping: Option<f64>,
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_RTT_CEILING)
    }
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, rtt_ceiling: Duration) -> Self {
        Self {
            interval: interval.as_secs_f64(),
            rtt_ceiling: rtt_ceiling.as_secs_f64(),
            last_ping: None,
        }
    }

    /// Whether a broadcast is due at `now` (seconds). Claims the slot if so.
    pub fn poll_ping(&mut self, now: f64) -> bool {
        match self.last_ping {
            Some(last) if now - last < self.interval => false,
            _ => {
                self.last_ping = Some(now);
                true
            }
        }
    }

    /// Pings go to connections that have at least been welcomed.
    pub fn wants_ping(state: ChannelState) -> bool {
        state >= ChannelState::Welcome
    }

    /// RTT for a pong echoing `echoed`, or `None` if the clock ran backwards.
    pub fn rtt_from_pong(&self, echoed: f64, now: f64) -> Option<f64> {
        let rtt = now - echoed;
        if !rtt.is_finite() || rtt < 0.0 {
            warn!(echoed, now, rtt, "Discarding negative heartbeat round trip");
            return None;
        }
        Some(rtt.min(self.rtt_ceiling))
    }

    /// Fold a pong into the connection's stats; returns the stored sample.
    pub fn record_pong(&self, conn: &mut Connection, echoed: f64, now: f64) -> Option<f64> {
        let rtt = self.rtt_from_pong(echoed, now)?;
        conn.stats.record_rtt(rtt);
        trace!(connection = %conn.id(), rtt, "Heartbeat round trip");
        Some(rtt)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_rate_limit() {
        let mut monitor = HeartbeatMonitor::default();
        assert!(monitor.poll_ping(10.0));
        assert!(!monitor.poll_ping(10.1));
        assert!(!monitor.poll_ping(10.329));
        assert!(monitor.poll_ping(10.33));
        assert!(!monitor.poll_ping(10.5));
    }

    #[test]
    fn test_rtt_bounds() {
        let monitor = HeartbeatMonitor::default();
        assert_eq!(monitor.rtt_from_pong(1.0, 1.25), Some(0.25));
        assert_eq!(monitor.rtt_from_pong(1.0, 9.0), Some(2.0));
        assert_eq!(monitor.rtt_from_pong(5.0, 4.0), None);
        assert_eq!(monitor.rtt_from_pong(f64::NAN, 4.0), None);
    }

    #[test]
    fn test_ping_targets() {
        assert!(!HeartbeatMonitor::wants_ping(ChannelState::Unconnected));
        assert!(!HeartbeatMonitor::wants_ping(
            ChannelState::LoadingServerInformation
        ));
        assert!(HeartbeatMonitor::wants_ping(ChannelState::Welcome));
        assert!(HeartbeatMonitor::wants_ping(ChannelState::Connected));
    }
}

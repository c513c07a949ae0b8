//! Heartbeat-based failure detection
//!
//! The transport does not report every kind of link death (a killed process
//! or a NAT timeout closes nothing), so the hub pings every spoke on a fixed
//! cadence and each workstation watches how long ago the last ping arrived.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::SyncTimings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessSettings {
    /// Hub ping cadence.
    pub ping_interval: Duration,
    /// How often a workstation checks its clock.
    pub check_interval: Duration,
    /// Silence longer than this declares the link dead.
    pub timeout: Duration,
}

impl From<&SyncTimings> for LivenessSettings {
    fn from(timings: &SyncTimings) -> Self {
        Self {
            ping_interval: timings.heartbeat_interval(),
            check_interval: timings.liveness_check(),
            timeout: timings.liveness_timeout(),
        }
    }
}

/// Last-ping clock of one link.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    last_ping: Instant,
    timeout: Duration,
}

impl LivenessMonitor {
    /// A fresh clock. The link counts as alive from `now`.
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            last_ping: now,
            timeout,
        }
    }

    pub fn record_ping(&mut self, now: Instant) {
        self.last_ping = now;
    }

    /// Restart the clock, e.g. when a new link opens.
    pub fn reset(&mut self, now: Instant) {
        self.last_ping = now;
    }

    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_ping)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.silence(now) > self.timeout
    }
}

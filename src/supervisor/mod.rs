//! Reconnection supervisor
//!
//! Classifies every transport failure into a status and a retry delay. The
//! state machine per process:
//!
//! ```text
//! DISCONNECTED --start--> CONNECTING --success--> CONNECTED
//! CONNECTED --heartbeat_timeout | transport_close--> RETRYING / DISCONNECTED
//! CONNECTING --peer_unavailable--> RETRYING --5s--> CONNECTING
//! CONNECTING --address_taken--> RETRYING --3s--> CONNECTING (new handle)
//! ANY --network_error--> DISCONNECTED --5s--> CONNECTING
//! ```
//!
//! The supervisor only tracks state; the session arms the single retry
//! timer through its [`Scheduler`].

pub mod scheduler;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use scheduler::{Scheduler, TimerFired};

use crate::config::SyncTimings;
use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// The address is temporarily unavailable, e.g. the hub is not up yet.
    Retrying,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Retrying => "retrying",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    PeerUnavailable,
    AddressTaken,
    NetworkError,
    TransportClosed,
    HeartbeatTimeout,
}

impl From<&TransportError> for FailureKind {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::PeerUnavailable(_) => FailureKind::PeerUnavailable,
            TransportError::AddressTaken(_) => FailureKind::AddressTaken,
            TransportError::Network(_) => FailureKind::NetworkError,
            TransportError::Disconnected => FailureKind::TransportClosed,
        }
    }
}

/// Retry delay per failure kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub peer_unavailable: Duration,
    pub address_taken: Duration,
    pub network: Duration,
    pub force_reset: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SyncTimings::default())
    }
}

impl From<&SyncTimings> for RetryPolicy {
    fn from(timings: &SyncTimings) -> Self {
        Self {
            peer_unavailable: timings.retry_peer_unavailable(),
            address_taken: timings.retry_address_taken(),
            network: timings.retry_network(),
            force_reset: timings.force_reset_delay(),
        }
    }
}

impl RetryPolicy {
    pub fn plan(&self, kind: FailureKind) -> (ConnectionStatus, Duration) {
        match kind {
            FailureKind::PeerUnavailable => (ConnectionStatus::Retrying, self.peer_unavailable),
            FailureKind::AddressTaken => (ConnectionStatus::Retrying, self.address_taken),
            FailureKind::NetworkError | FailureKind::TransportClosed => {
                (ConnectionStatus::Disconnected, self.network)
            }
            FailureKind::HeartbeatTimeout => (ConnectionStatus::Retrying, self.force_reset),
        }
    }
}

pub struct ReconnectionSupervisor {
    status: ConnectionStatus,
    policy: RetryPolicy,
    in_flight: bool,
    failures: u32,
}

impl ReconnectionSupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            policy,
            in_flight: false,
            failures: 0,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Consecutive failures since the last successful connection.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Enter `Connecting`. Returns `false` while an attempt is already in
    /// flight, collapsing concurrent starts into one.
    pub fn begin_attempt(&mut self) -> bool {
        if self.in_flight {
            return false;
        }
        self.in_flight = true;
        self.status = ConnectionStatus::Connecting;
        true
    }

    pub fn on_connected(&mut self) {
        self.in_flight = false;
        self.failures = 0;
        self.status = ConnectionStatus::Connected;
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn on_failure(&mut self, kind: FailureKind) -> Duration {
        let (status, delay) = self.policy.plan(kind);
        self.in_flight = false;
        self.failures = self.failures.saturating_add(1);
        self.status = status;
        log::debug!(
            "Failure {:?} (#{}), {} and retrying in {:?}",
            kind,
            self.failures,
            status,
            delay
        );
        delay
    }

    /// Unconditional reset. Returns the delay before restarting.
    pub fn force_reset(&mut self) -> Duration {
        self.in_flight = false;
        self.status = ConnectionStatus::Disconnected;
        self.policy.force_reset
    }

    pub fn on_shutdown(&mut self) {
        self.in_flight = false;
        self.status = ConnectionStatus::Disconnected;
    }
}

//! Star topology
//!
//! One hub listens on the dataset's rendezvous address; every workstation
//! keeps exactly one connection to it. The hub re-broadcasts what it merges,
//! which makes the star a full mesh for data purposes.

pub mod manager;
pub mod registry;

pub use manager::{load_last_config, SessionHandle, TopologyManager};
pub use registry::{ConnectionId, ConnectionRegistry, PeerSummary};

use thiserror::Error;

use crate::config::ConfigError;
use crate::replication::{Record, RemoteActivity, ReplicationError};
use crate::supervisor::ConnectionStatus;

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Session closed")]
    SessionClosed,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),
}

/// Notifications published by a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged(ConnectionStatus),
    PeerJoined {
        peer_id: String,
        display_name: String,
    },
    PeerLeft {
        peer_id: String,
    },
    /// A remote merge changed this collection; carries its full contents.
    CollectionUpdated {
        collection: String,
        records: Vec<Record>,
    },
    RemoteActivity(RemoteActivity),
    /// The hub went silent past the liveness timeout.
    LinkLost,
}

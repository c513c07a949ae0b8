//! Hub-side connection registry
//!
//! Tracks every inbound workstation link. Mutated only by the session task,
//! on accept/open/close events and during ping rounds.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::transport::PeerConnection;

pub type ConnectionId = u64;

pub struct PeerEntry {
    pub conn: Arc<dyn PeerConnection>,
    pub remote_peer_id: String,
    pub display_name: String,
    pub connected_at: DateTime<Utc>,
    /// Last frame received on this link.
    pub last_seen: DateTime<Utc>,
    /// Set once the link's open event has been processed.
    pub joined: bool,
    pump: JoinHandle<()>,
}

impl PeerEntry {
    pub fn new(conn: Arc<dyn PeerConnection>, pump: JoinHandle<()>) -> Self {
        let remote = conn.remote().clone();
        let now = Utc::now();
        Self {
            conn,
            remote_peer_id: remote.peer_id,
            display_name: remote.label,
            connected_at: now,
            last_seen: now,
            joined: false,
            pump,
        }
    }

    /// Stop the reader and close the link.
    pub async fn close(self) {
        self.pump.abort();
        self.conn.close().await;
    }
}

/// What the hub reports about one connected workstation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub connection_id: ConnectionId,
    pub peer_id: String,
    pub display_name: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub open: bool,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: BTreeMap<ConnectionId, PeerEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ConnectionId, entry: PeerEntry) {
        self.entries.insert(id, entry);
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<PeerEntry> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&PeerEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut PeerEntry> {
        self.entries.get_mut(&id)
    }

    pub fn touch(&mut self, id: ConnectionId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.last_seen = Utc::now();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Links that still report themselves open.
    pub fn open_connections(&self) -> Vec<Arc<dyn PeerConnection>> {
        self.entries
            .values()
            .filter(|e| e.conn.is_open())
            .map(|e| Arc::clone(&e.conn))
            .collect()
    }

    /// Forwarding targets for a message that arrived on `arrival` and
    /// originated on `origin`: every open link except those two.
    pub fn forward_targets(
        &self,
        arrival: ConnectionId,
        origin: Option<&str>,
    ) -> Vec<Arc<dyn PeerConnection>> {
        self.entries
            .iter()
            .filter(|(id, _)| **id != arrival)
            .filter(|(_, e)| origin != Some(e.remote_peer_id.as_str()))
            .filter(|(_, e)| e.conn.is_open())
            .map(|(_, e)| Arc::clone(&e.conn))
            .collect()
    }

    /// Remove links that no longer report open.
    pub fn prune_closed(&mut self) -> Vec<(ConnectionId, PeerEntry)> {
        let dead: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.conn.is_open())
            .map(|(id, _)| *id)
            .collect();
        dead.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|e| (id, e)))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<(ConnectionId, PeerEntry)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        self.entries
            .iter()
            .map(|(id, e)| PeerSummary {
                connection_id: *id,
                peer_id: e.remote_peer_id.clone(),
                display_name: e.display_name.clone(),
                connected_at: e.connected_at,
                last_seen: e.last_seen,
                open: e.conn.is_open(),
            })
            .collect()
    }
}

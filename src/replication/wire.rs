//! Sync wire protocol
//!
//! Messages are JSON objects tagged by `type`:
//!
//! ```text
//! { "type": "FULL_PUSH" | "DATA_SYNC" | "HEARTBEAT_PING",
//!   "payload"?: { <collection>: Record[] },
//!   "sourcePeerId"?: string, "senderId"?: string, "timestamp"?: number }
//! ```
//!
//! Frames are decoded exactly once, at the transport boundary, into
//! [`SyncMessage`]. Anything that does not fit one of the three shapes is a
//! [`WireError`].

use serde::{Deserialize, Serialize};

use super::record::Dataset;
use super::WireError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    /// Hub to one newly joined peer: everything the hub knows.
    #[serde(rename = "FULL_PUSH", rename_all = "camelCase")]
    FullPush {
        payload: Dataset,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_peer_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// A flushed batch of local changes (or a full snapshot), tagged with
    /// the peer it originated on.
    #[serde(rename = "DATA_SYNC", rename_all = "camelCase")]
    DataSync {
        payload: Dataset,
        source_peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Hub liveness beacon. Fire-and-forget.
    #[serde(rename = "HEARTBEAT_PING", rename_all = "camelCase")]
    HeartbeatPing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
}

impl SyncMessage {
    pub fn full_push(payload: Dataset, source_peer_id: &str, timestamp: i64) -> Self {
        SyncMessage::FullPush {
            payload,
            source_peer_id: Some(source_peer_id.to_string()),
            timestamp: Some(timestamp),
        }
    }

    pub fn data_sync(payload: Dataset, source_peer_id: &str, timestamp: i64) -> Self {
        SyncMessage::DataSync {
            payload,
            source_peer_id: source_peer_id.to_string(),
            timestamp: Some(timestamp),
        }
    }

    pub fn ping(sender_id: &str, timestamp: i64) -> Self {
        SyncMessage::HeartbeatPing {
            sender_id: Some(sender_id.to_string()),
            timestamp: Some(timestamp),
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(frame).map_err(|e| WireError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    /// Peer the data originated on, if the message carries data.
    pub fn origin(&self) -> Option<&str> {
        match self {
            SyncMessage::FullPush { source_peer_id, .. } => source_peer_id.as_deref(),
            SyncMessage::DataSync { source_peer_id, .. } => Some(source_peer_id),
            SyncMessage::HeartbeatPing { .. } => None,
        }
    }

    pub fn payload(&self) -> Option<&Dataset> {
        match self {
            SyncMessage::FullPush { payload, .. } | SyncMessage::DataSync { payload, .. } => {
                Some(payload)
            }
            SyncMessage::HeartbeatPing { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::FullPush { .. } => "FULL_PUSH",
            SyncMessage::DataSync { .. } => "DATA_SYNC",
            SyncMessage::HeartbeatPing { .. } => "HEARTBEAT_PING",
        }
    }
}

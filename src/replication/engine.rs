//! Per-session replication state
//!
//! Owns the local dataset and decides what goes on the wire. Local
//! mutations are stamped and merged immediately but only mark the engine
//! dirty; the session's flush tick later asks for a payload. Incoming
//! payloads are merged with last-writer-wins and open a suppression window
//! during which dirty flushes are held back, so a burst of remote updates
//! does not bounce straight back out.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::time::Instant;

use super::merge::{merge_dataset, merge_records_into};
use super::record::{Dataset, Record};
use super::wire::SyncMessage;
use super::ReplicationError;
use crate::config::FlushMode;

/// Someone else did something worth telling the local user about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteActivity {
    pub author: String,
    pub action: String,
}

/// What merging an incoming payload did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// Names of the collections that changed, in order.
    pub changed: Vec<String>,
    pub activity: Option<RemoteActivity>,
}

/// Result of handing one decoded message to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingest {
    /// The message originated here and came back; nothing was done.
    SelfOrigin,
    Heartbeat,
    /// A data message was merged. Carries the outcome even when nothing
    /// changed so the hub still forwards it.
    Merged(MergeOutcome),
}

pub struct ReplicationEngine {
    peer_id: String,
    dataset: Dataset,
    /// Keys touched by local mutations since the last flush.
    pending: BTreeMap<String, BTreeSet<String>>,
    dirty: bool,
    full_flush_requested: bool,
    suppress_until: Option<Instant>,
    suppression_window: Duration,
    flush_mode: FlushMode,
    allow: Option<Vec<String>>,
    audit_collection: String,
    local_user: Option<String>,
}

impl ReplicationEngine {
    pub fn new(peer_id: impl Into<String>, dataset: Dataset) -> Self {
        Self {
            peer_id: peer_id.into(),
            dataset,
            pending: BTreeMap::new(),
            dirty: false,
            full_flush_requested: false,
            suppress_until: None,
            suppression_window: Duration::from_secs(2),
            flush_mode: FlushMode::default(),
            allow: None,
            audit_collection: "auditLogs".to_string(),
            local_user: None,
        }
    }

    pub fn with_flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    pub fn with_suppression_window(mut self, window: Duration) -> Self {
        self.suppression_window = window;
        self
    }

    /// Only these collections are accepted from peers or local writes.
    pub fn with_allow_list(mut self, collections: Option<Vec<String>>) -> Self {
        self.allow = collections;
        self
    }

    pub fn with_audit(mut self, collection: impl Into<String>, local_user: Option<String>) -> Self {
        self.audit_collection = collection.into();
        self.local_user = local_user;
        self
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Every collection, every record.
    pub fn snapshot(&self) -> Dataset {
        self.dataset.clone()
    }

    /// Only the records touched locally since the last flush.
    pub fn delta(&self) -> Dataset {
        self.dataset.subset(
            self.pending
                .iter()
                .flat_map(|(c, ids)| ids.iter().map(move |id| (c.as_str(), id.as_str()))),
        )
    }

    fn check_allowed(&self, collection: &str) -> Result<(), ReplicationError> {
        match &self.allow {
            Some(allowed) if !allowed.iter().any(|a| a == collection) => {
                Err(ReplicationError::UnknownCollection(collection.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn stamp_for(&self, collection: &str, id: &str, now_ms: i64) -> i64 {
        match self.dataset.get(collection, id) {
            Some(previous) => now_ms.max(previous.updated_at.saturating_add(1)),
            None => now_ms,
        }
    }

    fn commit_local(&mut self, collection: &str, record: Record) {
        let changed = merge_records_into(self.dataset.collection_mut(collection), [&record]);
        if !changed.is_empty() {
            self.pending
                .entry(collection.to_string())
                .or_default()
                .insert(record.id.clone());
            self.dirty = true;
        }
    }

    /// Write a record locally. The stored `updated_at` is
    /// `max(now_ms, previous + 1)`; the stamped record is returned.
    pub fn apply_local(
        &mut self,
        collection: &str,
        mut record: Record,
        now_ms: i64,
    ) -> Result<Record, ReplicationError> {
        self.check_allowed(collection)?;
        if record.id.is_empty() {
            return Err(ReplicationError::InvalidRecord("record id is empty".into()));
        }
        record.updated_at = self.stamp_for(collection, &record.id, now_ms);
        self.commit_local(collection, record.clone());
        Ok(record)
    }

    /// Tombstone a record locally.
    pub fn delete_local(
        &mut self,
        collection: &str,
        id: &str,
        now_ms: i64,
    ) -> Result<Record, ReplicationError> {
        self.check_allowed(collection)?;
        let existing = self
            .dataset
            .get(collection, id)
            .ok_or_else(|| ReplicationError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        let dead = existing.tombstone(self.stamp_for(collection, id, now_ms));
        self.commit_local(collection, dead.clone());
        Ok(dead)
    }

    /// The next flush carries a full snapshot regardless of the flush
    /// mode. Used after (re)connecting so offline edits reach the hub.
    pub fn request_full_flush(&mut self) {
        self.full_flush_requested = true;
    }

    pub fn is_suppressed(&self, now: Instant) -> bool {
        self.suppress_until.map_or(false, |until| now < until)
    }

    /// Whether the flush tick at `now` has something to send. A requested
    /// full flush ignores the suppression window.
    pub fn should_flush(&self, now: Instant) -> bool {
        self.full_flush_requested || (self.dirty && !self.is_suppressed(now))
    }

    /// Build the payload for the flush at `now`, if any. Flags stay set
    /// until [`mark_flushed`](Self::mark_flushed) confirms delivery, except
    /// when there is nothing to send at all.
    pub fn prepare_flush(&mut self, now: Instant) -> Option<Dataset> {
        if !self.should_flush(now) {
            return None;
        }
        let payload = if self.full_flush_requested || self.flush_mode == FlushMode::Full {
            self.snapshot()
        } else {
            self.delta()
        };
        if payload.is_empty() {
            self.mark_flushed();
            return None;
        }
        Some(payload)
    }

    pub fn mark_flushed(&mut self) {
        self.dirty = false;
        self.full_flush_requested = false;
        self.pending.clear();
    }

    /// Merge a decoded message into the local dataset.
    pub fn ingest(&mut self, message: &SyncMessage, now: Instant) -> Ingest {
        if message.origin() == Some(self.peer_id.as_str()) {
            return Ingest::SelfOrigin;
        }
        match message.payload() {
            Some(payload) => Ingest::Merged(self.merge_incoming(payload, now)),
            None => Ingest::Heartbeat,
        }
    }

    /// Merge a remote payload and open the suppression window.
    pub fn merge_incoming(&mut self, payload: &Dataset, now: Instant) -> MergeOutcome {
        let newest_audit = self
            .dataset
            .collection(&self.audit_collection)
            .and_then(|c| c.newest_timestamp());

        let changed = merge_dataset(&mut self.dataset, payload, self.allow.as_deref());
        self.suppress_until = Some(now + self.suppression_window);

        let activity = if changed.iter().any(|c| c == &self.audit_collection) {
            self.remote_activity(payload, newest_audit)
        } else {
            None
        };

        if !changed.is_empty() {
            log::debug!("Merged remote changes into {:?}", changed);
        }
        MergeOutcome { changed, activity }
    }

    /// The newest audit entry from `payload` that was accepted, is newer
    /// than anything known before the merge, and was written by someone
    /// other than the local user.
    fn remote_activity(&self, payload: &Dataset, known: Option<i64>) -> Option<RemoteActivity> {
        let incoming = payload.collection(&self.audit_collection)?;
        incoming
            .iter()
            .filter(|r| known.map_or(true, |k| r.updated_at > k))
            .filter(|r| self.dataset.get(&self.audit_collection, &r.id) == Some(*r))
            .filter_map(|r| {
                let author = r.field_str("user")?;
                if self.local_user.as_deref() == Some(author) {
                    return None;
                }
                Some((r.updated_at, author, r.field_str("action").unwrap_or("")))
            })
            .max_by_key(|(ts, _, _)| *ts)
            .map(|(_, author, action)| RemoteActivity {
                author: author.to_string(),
                action: action.to_string(),
            })
    }
}

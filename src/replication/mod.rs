//! Dataset replication
//!
//! The data model, the last-writer-wins merge, the wire protocol and the
//! per-session [`ReplicationEngine`] that ties them together.

pub mod engine;
pub mod merge;
pub mod record;
pub mod wire;

use thiserror::Error;

pub use engine::{Ingest, MergeOutcome, RemoteActivity, ReplicationEngine};
pub use merge::{merge_collection, merge_dataset, merge_records_into};
pub use record::{Collection, Dataset, Record};
pub use wire::SyncMessage;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Malformed sync message: {0}")]
    Malformed(String),

    #[error("Failed to encode sync message: {0}")]
    Encode(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("Collection not replicated: {0}")]
    UnknownCollection(String),

    #[error("Record {id} not found in {collection}")]
    NotFound { collection: String, id: String },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

//! Durable local store
//!
//! A small key-value boundary the session persists through: the dataset
//! after every change, the last known configuration, and optional mirrored
//! backups. Store failures never stop replication; readers fall back to a
//! default and writers log.

pub mod backup;
pub mod file;
pub mod memory;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub use backup::BackupMirror;
pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value persistence for JSON documents.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn save(&self, key: &str, value: &Value) -> Result<(), StoreError>;

    /// `None` when nothing was ever saved under `key`.
    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError>;
}

/// Serialize `value` and save it under `key`.
pub async fn save_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let value =
        serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.save(key, &value).await
}

/// Load `key` as `T`, falling back to `default` when it is missing,
/// unreadable or of the wrong shape.
pub async fn load_or_default<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
    default: T,
) -> T {
    match store.load(key).await {
        Ok(Some(value)) => match serde_json::from_value(value) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("Ignoring malformed value under {}: {}", key, e);
                default
            }
        },
        Ok(None) => default,
        Err(e) => {
            log::warn!("Failed to load {}: {}", key, e);
            default
        }
    }
}

pub fn dataset_key(dataset_id: &str) -> String {
    format!("dataset/{}", dataset_id)
}

pub const LAST_CONFIG_KEY: &str = "config/last";

/// Turn a key into a file-name stem. ASCII alphanumerics, `-`, `_` and `.`
/// pass through and every other byte becomes `%XX`, so distinct keys never
/// share a file and no key can name a path outside the store directory.
pub fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

//! Mirrored dataset backups
//!
//! After every change the session writes the whole dataset to
//! `<dir>/<datasetId>.backup.json`, typically a folder on another drive or a
//! synced share. The id is escaped the way store keys are.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{escape_key, StoreError};
use crate::replication::Dataset;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupFile {
    pub dataset_id: String,
    pub saved_at: DateTime<Utc>,
    pub payload: Dataset,
}

pub struct BackupMirror {
    dir: PathBuf,
}

impl BackupMirror {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, dataset_id: &str) -> PathBuf {
        self.dir.join(format!("{}.backup.json", escape_key(dataset_id)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn write(&self, dataset_id: &str, dataset: &Dataset) -> Result<PathBuf, StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let file = BackupFile {
            dataset_id: dataset_id.to_string(),
            saved_at: Utc::now(),
            payload: dataset.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let path = self.path_for(dataset_id);
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }

    pub async fn read(&self, dataset_id: &str) -> Result<Option<BackupFile>, StoreError> {
        let data = match tokio::fs::read(self.path_for(dataset_id)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

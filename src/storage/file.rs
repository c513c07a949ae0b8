//! Directory-backed store
//!
//! Each key is one pretty-printed `{key}.json` file. Keys are escaped into
//! file names (`dataset/acme` becomes `dataset%2Facme.json`). Writes go to a
//! temporary file first and are renamed into place.

use std::path::{Path, PathBuf};

use serde_json::Value;

use super::{escape_key, KeyValueStore, StoreError};

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", escape_key(key)))
    }
}

#[async_trait::async_trait]
impl KeyValueStore for FileStore {
    async fn save(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let json = serde_json::to_string_pretty(value)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = serde_json::from_slice(&data)
            .map_err(|e| StoreError::Serialization(format!("{}: {}", path.display(), e)))?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_escaping() {
        let store = FileStore::new("/data");
        assert_eq!(
            store.path_for("dataset/acme books"),
            PathBuf::from("/data/dataset%2Facme%20books.json")
        );
        assert_eq!(store.path_for("config/last"), PathBuf::from("/data/config%2Flast.json"));
    }

    #[tokio::test]
    async fn test_similar_keys_keep_separate_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());

        store.save("dataset/a_b", &json!({ "n": 1 })).await.unwrap();
        store.save("dataset/a/b", &json!({ "n": 2 })).await.unwrap();

        assert_eq!(store.load("dataset/a_b").await.unwrap(), Some(json!({ "n": 1 })));
        assert_eq!(store.load("dataset/a/b").await.unwrap(), Some(json!({ "n": 2 })));
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("store");

        let store = FileStore::new(&dir);
        assert_eq!(store.load("dataset/acme").await.unwrap(), None);
        store
            .save("dataset/acme", &json!({ "clients": [ { "id": "c1", "updatedAt": 1 } ] }))
            .await
            .unwrap();

        let reopened = FileStore::new(&dir);
        let value = reopened.load("dataset/acme").await.unwrap().unwrap();
        assert_eq!(value["clients"][0]["id"], json!("c1"));
        assert!(dir.join("dataset%2Facme.json").exists());
        assert!(!dir.join("dataset%2Facme.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        std::fs::write(store.path_for("k"), b"{ truncated").unwrap();
        assert!(matches!(
            store.load("k").await,
            Err(StoreError::Serialization(_))
        ));
    }
}

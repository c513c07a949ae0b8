use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use super::{KeyValueStore, StoreError};

/// Volatile store, for tests and simulations.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.values
            .lock()
            .map(|v| v.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn save(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))?;
        values.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let values = self
            .values
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))?;
        Ok(values.get(key).cloned())
    }
}

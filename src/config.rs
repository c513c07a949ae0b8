//! Session configuration
//!
//! Read from camelCase JSON, e.g.
//!
//! ```json
//! { "role": "WORKSTATION", "datasetId": "acme-books", "localUser": "bob" }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PRODUCT_PREFIX: &str = "tallysync";
pub const DEFAULT_AUDIT_COLLECTION: &str = "auditLogs";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which side of the star this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Hub,
    Workstation,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Hub => write!(f, "HUB"),
            Role::Workstation => write!(f, "WORKSTATION"),
        }
    }
}

/// What a dirty flush puts on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Only records touched since the last flush.
    #[default]
    Delta,
    /// The whole dataset every time.
    Full,
}

/// Timer settings, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncTimings {
    pub flush_interval_ms: u64,
    pub suppression_window_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub liveness_check_ms: u64,
    pub liveness_timeout_ms: u64,
    /// Delay between a peer joining and the hub's FULL_PUSH to it.
    pub settle_delay_ms: u64,
    pub retry_peer_unavailable_ms: u64,
    pub retry_address_taken_ms: u64,
    pub retry_network_ms: u64,
    pub force_reset_delay_ms: u64,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            flush_interval_ms: 2_000,
            suppression_window_ms: 2_000,
            heartbeat_interval_ms: 15_000,
            liveness_check_ms: 10_000,
            liveness_timeout_ms: 35_000,
            settle_delay_ms: 1_000,
            retry_peer_unavailable_ms: 5_000,
            retry_address_taken_ms: 3_000,
            retry_network_ms: 5_000,
            force_reset_delay_ms: 1_000,
        }
    }
}

impl SyncTimings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn suppression_window(&self) -> Duration {
        Duration::from_millis(self.suppression_window_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_check(&self) -> Duration {
        Duration::from_millis(self.liveness_check_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn retry_peer_unavailable(&self) -> Duration {
        Duration::from_millis(self.retry_peer_unavailable_ms)
    }

    pub fn retry_address_taken(&self) -> Duration {
        Duration::from_millis(self.retry_address_taken_ms)
    }

    pub fn retry_network(&self) -> Duration {
        Duration::from_millis(self.retry_network_ms)
    }

    pub fn force_reset_delay(&self) -> Duration {
        Duration::from_millis(self.force_reset_delay_ms)
    }
}

fn default_product_prefix() -> String {
    DEFAULT_PRODUCT_PREFIX.to_string()
}

fn default_audit_collection() -> String {
    DEFAULT_AUDIT_COLLECTION.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub role: Role,
    pub dataset_id: String,
    /// Replaces the derived hub address (e.g. `"192.168.1.20:41000"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_address_override: Option<String>,
    /// Stable peer id. A random one is generated per session when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_id: Option<String>,
    #[serde(default = "default_product_prefix")]
    pub product_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Author name of local audit entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,
    #[serde(default)]
    pub flush_mode: FlushMode,
    #[serde(default = "default_audit_collection")]
    pub audit_collection: String,
    /// Replicated collections. Everything is replicated when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collections: Option<Vec<String>>,
    #[serde(default)]
    pub timings: SyncTimings,
}

impl SyncConfig {
    pub fn new(role: Role, dataset_id: impl Into<String>) -> Self {
        Self {
            role,
            dataset_id: dataset_id.into(),
            hub_address_override: None,
            self_id: None,
            product_prefix: default_product_prefix(),
            display_name: None,
            local_user: None,
            backup_dir: None,
            flush_mode: FlushMode::default(),
            audit_collection: default_audit_collection(),
            collections: None,
            timings: SyncTimings::default(),
        }
    }

    pub fn hub(dataset_id: impl Into<String>) -> Self {
        Self::new(Role::Hub, dataset_id)
    }

    pub fn workstation(dataset_id: impl Into<String>) -> Self {
        Self::new(Role::Workstation, dataset_id)
    }

    pub fn with_self_id(mut self, id: impl Into<String>) -> Self {
        self.self_id = Some(id.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_local_user(mut self, user: impl Into<String>) -> Self {
        self.local_user = Some(user.into());
        self
    }

    pub fn with_hub_address(mut self, address: impl Into<String>) -> Self {
        self.hub_address_override = Some(address.into());
        self
    }

    pub fn with_flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SyncConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// The rendezvous address hub and workstations agree on.
    pub fn hub_address(&self) -> String {
        match &self.hub_address_override {
            Some(address) => address.clone(),
            None => format!("{}-hub-{}", self.product_prefix, self.dataset_id),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dataset_id.trim().is_empty() {
            return Err(ConfigError::Invalid("datasetId must not be empty".into()));
        }
        if self.dataset_id.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid(format!(
                "datasetId must not contain whitespace: {:?}",
                self.dataset_id
            )));
        }
        if self.dataset_id.contains(['/', '\\'])
            || self.dataset_id.starts_with('.')
            || self.dataset_id.chars().any(char::is_control)
        {
            return Err(ConfigError::Invalid(format!(
                "datasetId must not look like a path: {:?}",
                self.dataset_id
            )));
        }
        if self.product_prefix.is_empty() && self.hub_address_override.is_none() {
            return Err(ConfigError::Invalid("productPrefix must not be empty".into()));
        }
        if matches!(&self.hub_address_override, Some(a) if a.trim().is_empty()) {
            return Err(ConfigError::Invalid("hubAddressOverride is empty".into()));
        }
        if matches!(&self.collections, Some(c) if c.is_empty()) {
            return Err(ConfigError::Invalid("collections must not be an empty list".into()));
        }

        let t = &self.timings;
        for (name, value) in [
            ("flushIntervalMs", t.flush_interval_ms),
            ("heartbeatIntervalMs", t.heartbeat_interval_ms),
            ("livenessCheckMs", t.liveness_check_ms),
            ("livenessTimeoutMs", t.liveness_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if t.liveness_timeout_ms <= t.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "livenessTimeoutMs must exceed heartbeatIntervalMs".into(),
            ));
        }
        Ok(())
    }
}

//! Service configuration.
//!
//! Loaded from `~/.hooksync/config.json` (or the path in `HOOKSYNC_CONFIG`).
//! All fields have serde defaults so a minimal `{}` config runs with sane
//! local settings.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::QueueType;

/// Default retry ceiling for a queue item.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default claim batch size per run.
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Default wall-clock budget per run, seconds. Sized to fit comfortably
/// inside an external scheduler's execution ceiling.
pub const DEFAULT_MAX_RUNTIME_SECS: u64 = 45;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// SQLite database path. Defaults to `~/.hooksync/hooksync.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// HTTP bind address.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Shared secret expected in `X-Run-Secret` on run-batch triggers.
    /// Empty means the trigger endpoint is open (local development only).
    #[serde(default)]
    pub run_secret: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_max_runtime_secs")]
    pub max_runtime_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-queue SLA targets in seconds, keyed by queue type name.
    /// Unlisted queue types use built-in defaults.
    #[serde(default)]
    pub sla_targets_secs: HashMap<String, u64>,

    /// Outbound notification endpoint for provisioning side effects.
    /// None disables outbound sends (they are logged instead).
    #[serde(default)]
    pub notify_url: Option<String>,

    /// When set, an internal ticker invokes a batch run for every queue type
    /// on this interval. Leave unset when an external scheduler drives
    /// `POST /run/{queueType}`.
    #[serde(default)]
    pub internal_scheduler_secs: Option<u64>,
}

fn default_bind() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}

fn default_max_runtime_secs() -> u64 {
    DEFAULT_MAX_RUNTIME_SECS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            bind: default_bind(),
            run_secret: String::new(),
            batch_size: default_batch_size(),
            max_runtime_secs: default_max_runtime_secs(),
            max_attempts: default_max_attempts(),
            sla_targets_secs: HashMap::new(),
            notify_url: None,
            internal_scheduler_secs: None,
        }
    }
}

impl Config {
    /// Resolve the database path: explicit config > `~/.hooksync/hooksync.db`.
    pub fn resolved_db_path(&self) -> Result<PathBuf, String> {
        if let Some(ref path) = self.db_path {
            return Ok(path.clone());
        }
        let home = dirs::home_dir().ok_or("Could not find home directory")?;
        Ok(home.join(".hooksync").join("hooksync.db"))
    }

    /// SLA target for a queue type, seconds.
    ///
    /// Built-in defaults reflect latency expectations per category:
    /// near-real-time for messages, minutes for bulk general updates.
    pub fn sla_target_secs(&self, queue_type: QueueType) -> u64 {
        if let Some(&secs) = self.sla_targets_secs.get(queue_type.as_str()) {
            return secs;
        }
        match queue_type {
            QueueType::Messages => 60,
            QueueType::Critical | QueueType::Install | QueueType::Appointments => 120,
            QueueType::Financial => 300,
            QueueType::Contacts | QueueType::Projects => 600,
            QueueType::General => 900,
        }
    }
}

/// Canonical config file path: `$HOOKSYNC_CONFIG` or `~/.hooksync/config.json`.
pub fn config_path() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var("HOOKSYNC_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".hooksync").join("config.json"))
}

/// Load configuration from disk. A missing file yields defaults.
pub fn load_config() -> Result<Config, String> {
    let path = config_path()?;
    if !path.exists() {
        log::info!("Config: no file at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let content =
        std::fs::read_to_string(&path).map_err(|e| format!("Failed to read config: {}", e))?;
    serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_has_defaults() {
        let config: Config = serde_json::from_str("{}").expect("parse");
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.max_runtime_secs, DEFAULT_MAX_RUNTIME_SECS);
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.bind, "127.0.0.1:8090");
        assert!(config.run_secret.is_empty());
    }

    #[test]
    fn test_sla_target_override() {
        let config: Config =
            serde_json::from_str(r#"{"slaTargetsSecs":{"messages":30}}"#).expect("parse");
        assert_eq!(config.sla_target_secs(QueueType::Messages), 30);
        // Unlisted types keep defaults
        assert_eq!(config.sla_target_secs(QueueType::General), 900);
    }

    #[test]
    fn test_camel_case_fields() {
        let config: Config = serde_json::from_str(
            r#"{"runSecret":"s3cret","maxRuntimeSecs":20,"internalSchedulerSecs":60}"#,
        )
        .expect("parse");
        assert_eq!(config.run_secret, "s3cret");
        assert_eq!(config.max_runtime_secs, 20);
        assert_eq!(config.internal_scheduler_secs, Some(60));
    }
}

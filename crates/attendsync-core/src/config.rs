//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! the server of record, where local data lives, the operator's teacher
//! identity, and every storage and sync tunable.
//!
//! Configuration is stored at `~/.config/attendsync/config.json`. The
//! `ATTENDSYNC_SERVER_URL` and `ATTENDSYNC_DATA_DIR` environment variables
//! override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::store::{StoreOptions, CURRENT_VERSION};

/// Application name used for config/data directory paths
const APP_NAME: &str = "attendsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const SERVER_URL_ENV: &str = "ATTENDSYNC_SERVER_URL";
pub const DATA_DIR_ENV: &str = "ATTENDSYNC_DATA_DIR";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_url: String,
    pub data_dir: Option<PathBuf>,
    pub teacher_id: Option<String>,
    pub teacher_name: Option<String>,
    pub default_location: String,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost/kes-smart".to_string(),
            data_dir: None,
            teacher_id: None,
            teacher_name: None,
            default_location: crate::models::DEFAULT_SCAN_LOCATION.to_string(),
            cache: CacheConfig::default(),
            sync: SyncConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Storage quotas, eviction thresholds and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub response_cache_quota_bytes: u64,
    pub local_store_quota_bytes: u64,
    pub cache_entries_quota_bytes: u64,
    /// Usage ratio that triggers a routine cleanup.
    pub cleanup_threshold: f64,
    /// Usage ratio that triggers an emergency cleanup.
    pub emergency_threshold: f64,
    pub routine_trim_ratio: f64,
    pub emergency_trim_ratio: f64,
    /// Multiplier applied to every max age during an emergency cleanup.
    pub emergency_age_factor: f64,
    pub response_max_age_days: i64,
    pub unsynced_max_age_days: i64,
    pub synced_max_age_days: i64,
    pub entry_max_age_days: i64,
    pub aggressive_synced_max_age_hours: i64,
    /// Records retried more often than this are dropped by an emergency cleanup.
    pub max_retry_count: u32,
    pub check_interval_secs: u64,
    pub routine_interval_secs: u64,
    pub quick_cleanup_budget_ms: u64,
    pub quick_cleanup_entry_limit: usize,
    pub bucket_prefix: String,
    pub known_buckets: Vec<String>,
    pub dynamic_buckets: Vec<String>,
    pub api_bucket: String,
    pub essential_key_prefixes: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let bucket = |name: &str| format!("kes-smart-{}-v1", name);
        Self {
            response_cache_quota_bytes: 100 * MIB,
            local_store_quota_bytes: 50 * MIB,
            cache_entries_quota_bytes: 5 * MIB,
            cleanup_threshold: 0.8,
            emergency_threshold: 0.95,
            routine_trim_ratio: 0.7,
            emergency_trim_ratio: 0.5,
            emergency_age_factor: 0.5,
            response_max_age_days: 7,
            unsynced_max_age_days: 30,
            synced_max_age_days: 7,
            entry_max_age_days: 7,
            aggressive_synced_max_age_hours: 24,
            max_retry_count: 5,
            check_interval_secs: 5 * 60,
            routine_interval_secs: 60 * 60,
            quick_cleanup_budget_ms: 2000,
            quick_cleanup_entry_limit: 10,
            bucket_prefix: "kes-smart".to_string(),
            known_buckets: ["static", "dynamic", "api", "offline", "auth"]
                .iter()
                .map(|n| bucket(n))
                .collect(),
            dynamic_buckets: vec![bucket("dynamic"), bucket("api")],
            api_bucket: bucket("api"),
            essential_key_prefixes: vec![
                "user_".to_string(),
                "auth_".to_string(),
                "session_".to_string(),
            ],
        }
    }
}

impl CacheConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn routine_interval(&self) -> Duration {
        Duration::from_secs(self.routine_interval_secs)
    }

    pub fn quick_cleanup_budget(&self) -> Duration {
        Duration::from_millis(self.quick_cleanup_budget_ms)
    }

    pub fn is_dynamic_bucket(&self, bucket: &str) -> bool {
        self.dynamic_buckets.iter().any(|b| b == bucket)
    }

    /// A product bucket this build no longer writes to.
    pub fn is_stale_bucket(&self, bucket: &str) -> bool {
        bucket.starts_with(&self.bucket_prefix) && !self.known_buckets.iter().any(|b| b == bucket)
    }
}

/// Sync engine, coordinator and connectivity tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: usize,
    /// Hard cap enforced before a batch leaves the client.
    pub max_batch_size: usize,
    pub debounce_ms: u64,
    pub periodic_interval_secs: u64,
    pub retry_base_secs: u64,
    pub retry_max_secs: u64,
    /// Random spread applied to each backoff delay (0.2 = +/-20 %).
    pub retry_jitter: f64,
    pub probe_interval_secs: u64,
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_batch_size: 50,
            debounce_ms: 2000,
            periodic_interval_secs: 5 * 60,
            retry_base_secs: 30,
            retry_max_secs: 60 * 60,
            retry_jitter: 0.2,
            probe_interval_secs: 30,
            event_buffer: crate::events::DEFAULT_EVENT_BUFFER,
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    /// Configured batch size, never above the hard cap.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, self.max_batch_size.max(1))
    }
}

/// Local record store tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub schema_version: u32,
    pub blocked_retry_delay_ms: u64,
    pub upgrade_retry_interval_secs: u64,
    pub upgrade_retry_window_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_VERSION,
            blocked_retry_delay_ms: crate::store::DEFAULT_BLOCKED_RETRY_DELAY_MS,
            upgrade_retry_interval_secs: 30,
            upgrade_retry_window_secs: 10 * 60,
        }
    }
}

impl StoreConfig {
    pub fn upgrade_retry_interval(&self) -> Duration {
        Duration::from_secs(self.upgrade_retry_interval_secs)
    }

    pub fn upgrade_retry_window(&self) -> Duration {
        Duration::from_secs(self.upgrade_retry_window_secs)
    }
}

impl Config {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Self = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(SERVER_URL_ENV) {
            if !url.trim().is_empty() {
                self.server_url = url;
            }
        }
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.data_dir = Some(PathBuf::from(dir));
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.cache;
        for (name, value) in [
            ("cleanup_threshold", c.cleanup_threshold),
            ("emergency_threshold", c.emergency_threshold),
            ("routine_trim_ratio", c.routine_trim_ratio),
            ("emergency_trim_ratio", c.emergency_trim_ratio),
            ("emergency_age_factor", c.emergency_age_factor),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                bail!("cache.{} must be in (0, 1], got {}", name, value);
            }
        }
        if c.cleanup_threshold >= c.emergency_threshold {
            bail!("cache.cleanup_threshold must be below cache.emergency_threshold");
        }
        if self.sync.batch_size == 0 || self.sync.batch_size > self.sync.max_batch_size {
            bail!(
                "sync.batch_size must be between 1 and sync.max_batch_size ({})",
                self.sync.max_batch_size
            );
        }
        if !(0.0..1.0).contains(&self.sync.retry_jitter) {
            bail!("sync.retry_jitter must be in [0, 1)");
        }
        Ok(())
    }

    /// Root directory for the record store, response cache, session and logs.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn store_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("db"))
    }

    pub fn response_cache_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("responses"))
    }

    pub fn log_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("logs"))
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            version: self.store.schema_version,
            quota_bytes: Some(self.cache.local_store_quota_bytes),
            blocked_retry_delay: Duration::from_millis(self.store.blocked_retry_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().expect("valid");
        assert_eq!(config.cache.local_store_quota_bytes, 50 * MIB);
        assert_eq!(config.sync.effective_batch_size(), 10);
        assert!(config.cache.is_dynamic_bucket("kes-smart-api-v1"));
        assert!(!config.cache.is_dynamic_bucket("kes-smart-static-v1"));
    }

    #[test]
    fn test_stale_bucket_detection() {
        let cache = CacheConfig::default();
        assert!(cache.is_stale_bucket("kes-smart-static-v0"));
        assert!(!cache.is_stale_bucket("kes-smart-static-v1"));
        assert!(!cache.is_stale_bucket("third-party"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "server_url": "https://school.test", "sync": { "batch_size": 5 } }"#)
            .expect("write");

        let config = Config::load_from(&path).expect("load");
        assert_eq!(config.server_url, "https://school.test");
        assert_eq!(config.sync.batch_size, 5);
        assert_eq!(config.sync.max_batch_size, 50);
        assert_eq!(config.default_location, "Main Gate");
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let mut config = Config::default();
        config.cache.cleanup_threshold = 0.97;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sync.batch_size = 80;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.teacher_id = Some("3".to_string());
        config.save_to(&path).expect("save");

        let loaded = Config::load_from(&path).expect("load");
        assert_eq!(loaded.teacher_id.as_deref(), Some("3"));
    }
}

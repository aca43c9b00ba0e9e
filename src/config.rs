//! Configuration management for Memo.
//!
//! This module handles loading and saving application configuration to/from
//! a JSON file. The config directory can be customized.
//!
//! Includes sync-related configuration:
//! - cloud_sync: on/off switch, snapshot object key and scheduler timings
//! - s3: credentials and bucket of the S3-compatible remote store
//! - storage: local store quota and inline blob threshold

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MemoError, MemoResult};
use crate::validation::validate_object_key;

/// Default object key of the sync snapshot
pub const DEFAULT_SYNC_OBJECT_KEY: &str = "meow-app/app-data.json";

/// Cloud sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSyncConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Object key the snapshot is stored under
    #[serde(default = "default_object_key")]
    pub object_key: String,
    /// Minimum time between two cycle starts
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Debounce delay when the last sync is older than `recent_window_ms`
    #[serde(default = "default_idle_debounce_ms")]
    pub idle_debounce_ms: u64,
    /// Debounce delay right after a sync
    #[serde(default = "default_recent_debounce_ms")]
    pub recent_debounce_ms: u64,
    #[serde(default = "default_recent_window_ms")]
    pub recent_window_ms: u64,
    /// Delay before re-running a request that arrived mid-cycle
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_object_key() -> String {
    DEFAULT_SYNC_OBJECT_KEY.to_string()
}

fn default_min_interval_ms() -> u64 {
    5000
}

fn default_idle_debounce_ms() -> u64 {
    200
}

fn default_recent_debounce_ms() -> u64 {
    800
}

fn default_recent_window_ms() -> u64 {
    1500
}

fn default_retry_delay_ms() -> u64 {
    500
}

impl Default for CloudSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            object_key: default_object_key(),
            min_interval_ms: default_min_interval_ms(),
            idle_debounce_ms: default_idle_debounce_ms(),
            recent_debounce_ms: default_recent_debounce_ms(),
            recent_window_ms: default_recent_window_ms(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl CloudSyncConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn idle_debounce(&self) -> Duration {
        Duration::from_millis(self.idle_debounce_ms)
    }

    pub fn recent_debounce(&self) -> Duration {
        Duration::from_millis(self.recent_debounce_ms)
    }

    pub fn recent_window(&self) -> Duration {
        Duration::from_millis(self.recent_window_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// S3-compatible storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Settings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub public_url: String,
    /// "r2", "s3" or "minio"
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_region() -> String {
    "auto".to_string()
}

fn default_provider() -> String {
    "r2".to_string()
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            bucket: String::new(),
            region: default_region(),
            public_url: String::new(),
            provider: default_provider(),
            prefix: None,
        }
    }
}

impl S3Settings {
    /// Enabled and carrying everything needed to build a client
    pub fn is_configured(&self) -> bool {
        self.enabled
            && !self.access_key_id.is_empty()
            && !self.secret_access_key.is_empty()
            && !self.bucket.is_empty()
            && (self.provider == "s3" || !self.endpoint.is_empty())
    }

    /// Public URL, falling back to the endpoint
    pub fn public_url(&self) -> &str {
        if self.public_url.is_empty() {
            &self.endpoint
        } else {
            &self.public_url
        }
    }
}

/// Local store limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Largest serialized value accepted per key (None = unlimited)
    #[serde(default)]
    pub max_value_bytes: Option<usize>,
    /// Inline `data:` blobs longer than this are dropped when a write has
    /// to be reduced to fit the quota
    #[serde(default = "default_max_inline_blob_bytes")]
    pub max_inline_blob_bytes: usize,
}

fn default_max_inline_blob_bytes() -> usize {
    100_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_value_bytes: None,
            max_inline_blob_bytes: default_max_inline_blob_bytes(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigData {
    /// Path to the database file
    #[serde(default)]
    pub database_file: String,
    #[serde(default)]
    pub cloud_sync: CloudSyncConfig,
    #[serde(default)]
    pub s3: S3Settings,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Configuration manager
pub struct Config {
    config_dir: PathBuf,
    config_file: PathBuf,
    data: ConfigData,
}

impl Config {
    /// Create a new configuration manager
    ///
    /// Without the `desktop` feature, `config_dir` is required.
    pub fn new(config_dir: Option<PathBuf>) -> MemoResult<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => {
                #[cfg(feature = "desktop")]
                {
                    dirs::config_dir()
                        .unwrap_or_else(|| PathBuf::from("."))
                        .join("memo")
                }
                #[cfg(not(feature = "desktop"))]
                {
                    return Err(MemoError::Config(
                        "config_dir is required without the desktop feature".to_string(),
                    ));
                }
            }
        };

        fs::create_dir_all(&config_dir)?;
        let config_file = config_dir.join("config.json");

        let default_data = || {
            let mut default = ConfigData::default();
            default.database_file = config_dir.join("memo.db").to_string_lossy().to_string();
            default
        };

        let data = if config_file.exists() {
            match fs::read_to_string(&config_file) {
                Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Config file unreadable, using defaults");
                    default_data()
                }),
                Err(_) => default_data(),
            }
        } else {
            default_data()
        };

        let config = Self {
            config_dir,
            config_file,
            data,
        };

        // Save default config if it doesn't exist
        if !config.config_file.exists() {
            config.save()?;
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> MemoResult<()> {
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.config_file, content)?;
        Ok(())
    }

    /// Get the configuration directory path
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Get the database file path
    pub fn database_file(&self) -> &str {
        &self.data.database_file
    }

    /// Get cloud sync configuration
    pub fn cloud_sync(&self) -> &CloudSyncConfig {
        &self.data.cloud_sync
    }

    /// Cloud sync runs only when switched on and S3 is usable
    pub fn is_cloud_sync_enabled(&self) -> bool {
        self.data.cloud_sync.enabled && self.data.s3.enabled
    }

    /// Enable or disable cloud sync
    pub fn set_cloud_sync_enabled(&mut self, enabled: bool) -> MemoResult<()> {
        self.data.cloud_sync.enabled = enabled;
        self.save()
    }

    /// Change the snapshot object key
    pub fn set_sync_object_key(&mut self, key: &str) -> MemoResult<()> {
        validate_object_key(key)?;
        self.data.cloud_sync.object_key = key.to_string();
        self.save()
    }

    /// Get S3 settings
    pub fn s3(&self) -> &S3Settings {
        &self.data.s3
    }

    /// Replace the S3 settings.
    ///
    /// Cloud sync follows the S3 enabled switch.
    pub fn set_s3(&mut self, settings: S3Settings) -> MemoResult<()> {
        self.data.cloud_sync.enabled = settings.enabled;
        self.data.s3 = settings;
        self.save()
    }

    /// Get local storage limits
    pub fn storage(&self) -> &StorageConfig {
        &self.data.storage
    }

    /// Set the per-value quota of the local store
    pub fn set_max_value_bytes(&mut self, limit: Option<usize>) -> MemoResult<()> {
        self.data.storage.max_value_bytes = limit;
        self.save()
    }

    /// Set the size above which inline blobs are dropped from oversized writes
    pub fn set_max_inline_blob_bytes(&mut self, bytes: usize) -> MemoResult<()> {
        self.data.storage.max_inline_blob_bytes = bytes;
        self.save()
    }

    /// Get a configuration value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "database_file" => Some(self.data.database_file.clone()),
            "sync_object_key" => Some(self.data.cloud_sync.object_key.clone()),
            "s3_bucket" => Some(self.data.s3.bucket.clone()),
            "s3_endpoint" => Some(self.data.s3.endpoint.clone()),
            "s3_region" => Some(self.data.s3.region.clone()),
            "s3_provider" => Some(self.data.s3.provider.clone()),
            _ => None,
        }
    }

    /// Set a configuration value
    pub fn set(&mut self, key: &str, value: &str) -> MemoResult<()> {
        match key {
            "database_file" => self.data.database_file = value.to_string(),
            "sync_object_key" => {
                validate_object_key(value)?;
                self.data.cloud_sync.object_key = value.to_string()
            }
            "s3_bucket" => self.data.s3.bucket = value.to_string(),
            "s3_endpoint" => self.data.s3.endpoint = value.to_string(),
            "s3_region" => self.data.s3.region = value.to_string(),
            "s3_provider" => self.data.s3.provider = value.to_string(),
            _ => return Err(MemoError::Config(format!("Unknown config key: {}", key))),
        }
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn configured_s3() -> S3Settings {
        S3Settings {
            enabled: true,
            endpoint: "https://example.r2.cloudflarestorage.com".to_string(),
            access_key_id: "key".to_string(),
            secret_access_key: "secret".to_string(),
            bucket: "memos".to_string(),
            ..S3Settings::default()
        }
    }

    #[test]
    fn test_default_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();

        assert!(config.database_file().ends_with("memo.db"));
        assert!(!config.is_cloud_sync_enabled());
        assert_eq!(config.cloud_sync().object_key, DEFAULT_SYNC_OBJECT_KEY);
        assert_eq!(config.cloud_sync().min_interval(), Duration::from_secs(5));
        assert_eq!(config.cloud_sync().idle_debounce(), Duration::from_millis(200));
        assert_eq!(config.cloud_sync().recent_debounce(), Duration::from_millis(800));
        assert_eq!(config.s3().region, "auto");
        assert_eq!(config.s3().provider, "r2");
        assert_eq!(config.storage().max_inline_blob_bytes, 100_000);
        assert!(temp_dir.path().join("config.json").exists());
    }

    #[test]
    fn test_s3_is_configured() {
        let mut s3 = configured_s3();
        assert!(s3.is_configured());

        s3.endpoint.clear();
        assert!(!s3.is_configured());

        s3.provider = "s3".to_string();
        assert!(s3.is_configured());

        s3.enabled = false;
        assert!(!s3.is_configured());
    }

    #[test]
    fn test_public_url_falls_back_to_endpoint() {
        let mut s3 = configured_s3();
        assert_eq!(s3.public_url(), "https://example.r2.cloudflarestorage.com");
        s3.public_url = "https://cdn.example.com".to_string();
        assert_eq!(s3.public_url(), "https://cdn.example.com");
    }

    #[test]
    fn test_set_s3_follows_enabled_switch() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();

        config.set_s3(configured_s3()).unwrap();
        assert!(config.is_cloud_sync_enabled());

        config.set_cloud_sync_enabled(false).unwrap();
        assert!(!config.is_cloud_sync_enabled());
    }

    #[test]
    fn test_config_persistence() {
        let temp_dir = TempDir::new().unwrap();

        {
            let mut config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
            config.set_s3(configured_s3()).unwrap();
            config.set_sync_object_key("notes/state.json").unwrap();
            config.set_max_value_bytes(Some(4096)).unwrap();
        }

        {
            let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
            assert!(config.is_cloud_sync_enabled());
            assert_eq!(config.cloud_sync().object_key, "notes/state.json");
            assert_eq!(config.s3().bucket, "memos");
            assert_eq!(config.storage().max_value_bytes, Some(4096));
        }
    }

    #[test]
    fn test_s3_settings_use_camel_case_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
        config.set_s3(configured_s3()).unwrap();

        let raw = fs::read_to_string(temp_dir.path().join("config.json")).unwrap();
        assert!(raw.contains("accessKeyId"));
        assert!(raw.contains("secretAccessKey"));
    }

    #[test]
    fn test_corrupt_config_falls_back_to_defaults() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("config.json"), "{ not json").unwrap();

        let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
        assert_eq!(config.cloud_sync().object_key, DEFAULT_SYNC_OBJECT_KEY);
    }

    #[test]
    fn test_invalid_object_key() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();

        assert!(config.set_sync_object_key("").is_err());
        assert!(config.set_sync_object_key("/absolute.json").is_err());
    }

    #[test]
    fn test_get_set() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();

        config.set("s3_bucket", "archive").unwrap();
        assert_eq!(config.get("s3_bucket"), Some("archive".to_string()));
        assert!(config.set("unknown", "x").is_err());
        assert!(config.get("unknown").is_none());
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::SyncError;
use crate::cloud::RestTables;
use crate::storage::DisposalPolicy;

/// Engine configuration, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sync: SyncTimings,
    pub blob: BlobLimits,
    pub loader: LoaderConfig,
    pub cache: CacheConfig,
    pub broadcast: BroadcastConfig,
    pub cloud: CloudConfig,
}

impl EngineConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        if !path.exists() {
            log::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, SyncError> {
        toml::from_str(raw).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// `<data dir>/studyshelf`
    pub fn default_data_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|d| d.join("studyshelf"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTimings {
    /// Quiet period before a blob upload
    pub debounce_ms: u64,
    /// Quiet period before an auto-saved book is pushed
    pub autosave_ms: u64,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            debounce_ms: 2000,
            autosave_ms: 1000,
        }
    }
}

impl SyncTimings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn autosave(&self) -> Duration {
        Duration::from_millis(self.autosave_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobLimits {
    pub size_ceiling_bytes: u64,
    pub warn_ratio: f64,
}

impl Default for BlobLimits {
    fn default() -> Self {
        Self {
            size_ceiling_bytes: 50 * 1024 * 1024,
            warn_ratio: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Entries larger than this load in the background
    pub large_threshold_bytes: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            large_threshold_bytes: 100 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_bytes: Option<usize>,
    pub disposal: DisposalPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            quota_bytes: None,
            disposal: DisposalPolicy {
                prefixes: vec!["temp_".to_string(), "cache_".to_string()],
                markers: vec!["_old_".to_string(), "_backup_".to_string(), "_temp_".to_string()],
            },
        }
    }
}

impl CacheConfig {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path
            .clone()
            .or_else(|| EngineConfig::default_data_dir().map(|d| d.join("cache.db")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub channel_name: String,
    /// How long a storage signal stays visible before removal
    pub relay_window_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            channel_name: "bookshelf-sync".to_string(),
            relay_window_ms: 1000,
        }
    }
}

impl BroadcastConfig {
    pub fn relay_window(&self) -> Duration {
        Duration::from_millis(self.relay_window_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub tables: RestTables,
}

/// Phase of the blob sync state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BlobSyncPhase {
    #[default]
    Idle,
    Dirty,
    Syncing,
}

/// Blob sync status, published on every transition
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlobSyncStatus {
    pub phase: BlobSyncPhase,
    pub is_syncing: bool,
    pub has_unsynced_changes: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Book aggregate sync status
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    /// Book ids with local changes not yet in the cloud
    pub pending_sync: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.sync.debounce(), Duration::from_secs(2));
        assert_eq!(config.blob.size_ceiling_bytes, 52_428_800);
        assert_eq!(config.loader.large_threshold_bytes, 102_400);
        assert_eq!(config.broadcast.channel_name, "bookshelf-sync");
        assert!(config.cache.disposal.is_disposable("notes_backup_1"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [sync]
            debounce_ms = 500

            [cloud]
            base_url = "https://db.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.debounce_ms, 500);
        assert_eq!(config.sync.autosave_ms, 1000);
        assert_eq!(config.cloud.base_url.as_deref(), Some("https://db.example.com"));
        assert!(config.cloud.api_key.is_none());
        assert_eq!(config.cloud.tables.books, "user_books");
    }

    #[test]
    fn test_cloud_table_overrides() {
        let config = EngineConfig::from_toml(
            r#"
            [cloud.tables]
            books = "books"
            highlights = "highlights"
            "#,
        )
        .unwrap();
        assert_eq!(config.cloud.tables.books, "books");
        assert_eq!(config.cloud.tables.highlights, "highlights");
        assert_eq!(config.cloud.tables.exam_evaluations, "exam_evaluations");
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = EngineConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.blob.warn_ratio, 0.8);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        assert!(matches!(
            EngineConfig::from_toml("[sync]\ndebounce_ms = \"soon\""),
            Err(SyncError::Config(_))
        ));
    }
}

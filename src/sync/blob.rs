//! Per-user key/value blob with debounced cloud upload.
//!
//! Reads are served from memory. Every mutation is written to the local
//! cache immediately and uploaded as one JSON document once the debounce
//! window passes quietly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;

use super::config::{BlobLimits, BlobSyncPhase, BlobSyncStatus};
use super::debounce::Debouncer;
use super::error::SyncError;
use crate::cloud::{BlobMetadata, BlobStore, UserDataBlob};
use crate::keys::user_data_key;
use crate::storage::LocalCache;

pub const BLOB_FORMAT_VERSION: &str = "1.0.0";
const DEBOUNCE_KEY: &str = "blob";

/// Cloud path of a user's blob.
pub fn blob_path(user_id: &str) -> String {
    format!("user-{}/app-state.json", user_id)
}

/// md5 of the serialized data map.
pub fn checksum(data: &Map<String, Value>) -> Result<String, SyncError> {
    let serialized = serde_json::to_string(data)?;
    Ok(format!("{:x}", md5::compute(serialized.as_bytes())))
}

/// Result of a size check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub size_bytes: usize,
    pub size_mb: f64,
    pub warning: bool,
}

#[derive(Default)]
struct BlobState {
    user_id: Option<String>,
    data: Map<String, Value>,
    // Bumped on every mutation so an upload can tell if it went stale.
    revision: u64,
}

struct BlobInner {
    cache: LocalCache,
    store: Arc<dyn BlobStore>,
    debouncer: Debouncer,
    delay: Duration,
    limits: BlobLimits,
    device_id: String,
    state: Mutex<BlobState>,
    status: watch::Sender<BlobSyncStatus>,
}

/// Blob sync service. Clones share state.
#[derive(Clone)]
pub struct BlobSyncService {
    inner: Arc<BlobInner>,
}

impl BlobSyncService {
    pub fn new(
        cache: LocalCache,
        store: Arc<dyn BlobStore>,
        debouncer: Debouncer,
        delay: Duration,
        limits: BlobLimits,
    ) -> Self {
        let device_id = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-device".to_string());
        let (status, _) = watch::channel(BlobSyncStatus::default());

        Self {
            inner: Arc::new(BlobInner {
                cache,
                store,
                debouncer,
                delay,
                limits,
                device_id,
                state: Mutex::new(BlobState::default()),
                status,
            }),
        }
    }

    /// Bind the service to `user_id` and load the blob.
    ///
    /// Cloud data wins when it downloads and verifies. On a network or
    /// integrity failure the local copy is kept and the error is returned,
    /// leaving the service usable.
    pub async fn initialize(&self, user_id: &str) -> Result<(), SyncError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.user_id = Some(user_id.to_string());
            state.data = Map::new();
            state.revision = 0;
        }
        self.inner.debouncer.cancel(DEBOUNCE_KEY);
        log::info!("Initializing blob sync for user {}", user_id);
        self.inner.load_from_cloud(user_id).await
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.state.lock().unwrap().user_id.clone()
    }

    pub fn get_data(&self, key: &str) -> Option<Value> {
        self.inner.state.lock().unwrap().data.get(key).cloned()
    }

    pub fn get_all_data(&self) -> Map<String, Value> {
        self.inner.state.lock().unwrap().data.clone()
    }

    pub fn save_data(&self, key: &str, value: Value) -> Result<(), SyncError> {
        self.inner.mutate(|data| {
            data.insert(key.to_string(), value);
        })?;
        self.schedule();
        Ok(())
    }

    pub fn remove_data(&self, key: &str) -> Result<(), SyncError> {
        self.inner.mutate(|data| {
            data.remove(key);
        })?;
        self.schedule();
        Ok(())
    }

    pub fn clear_all_data(&self) -> Result<(), SyncError> {
        self.inner.mutate(Map::clear)?;
        self.schedule();
        Ok(())
    }

    /// Upload now, skipping the debounce window.
    pub async fn force_sync(&self) -> Result<(), SyncError> {
        self.inner.debouncer.cancel(DEBOUNCE_KEY);
        BlobInner::sync_to_cloud(&self.inner).await
    }

    pub fn get_sync_status(&self) -> BlobSyncStatus {
        self.inner.status.borrow().clone()
    }

    /// Receive every status transition.
    pub fn on_sync_status_change(&self) -> watch::Receiver<BlobSyncStatus> {
        self.inner.status.subscribe()
    }

    /// Serialized size of the data map in bytes.
    pub fn data_size(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        serde_json::to_string(&state.data).map(|s| s.len()).unwrap_or(0)
    }

    pub fn check_storage_usage(&self) -> StorageUsage {
        let size_bytes = self.data_size();
        let threshold = self.inner.limits.size_ceiling_bytes as f64 * self.inner.limits.warn_ratio;
        let warning = size_bytes as f64 > threshold;
        let size_mb = size_bytes as f64 / (1024.0 * 1024.0);
        if warning {
            log::warn!(
                "Blob size {:.2}MB is approaching the {}MB limit",
                size_mb,
                self.inner.limits.size_ceiling_bytes / (1024 * 1024)
            );
        }
        StorageUsage {
            size_bytes,
            size_mb,
            warning,
        }
    }

    /// Cancel any pending upload.
    pub fn shutdown(&self) {
        if self.inner.debouncer.cancel(DEBOUNCE_KEY) {
            log::info!("Blob sync shut down with a pending upload");
        }
    }

    fn schedule(&self) {
        self.inner.schedule_sync();
    }
}

impl BlobInner {
    fn schedule_sync(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.debouncer.schedule(DEBOUNCE_KEY, self.delay, move || async move {
            if let Err(e) = BlobInner::sync_to_cloud(&inner).await {
                log::warn!("Debounced blob sync failed: {}", e);
            }
        });
    }

    fn update_status(&self, f: impl FnOnce(&mut BlobSyncStatus)) {
        self.status.send_modify(f);
    }

    fn mutate(&self, f: impl FnOnce(&mut Map<String, Value>)) -> Result<(), SyncError> {
        let (user_id, snapshot) = {
            let mut state = self.state.lock().unwrap();
            let user_id = state.user_id.clone().ok_or(SyncError::NotInitialized)?;
            f(&mut state.data);
            state.revision += 1;
            (user_id, state.data.clone())
        };

        if let Err(e) = self.cache.set_json(&user_data_key(&user_id), &snapshot) {
            log::warn!("Failed to persist blob locally: {}", e);
            self.update_status(|s| s.error = Some(e.to_string()));
        }

        self.update_status(|s| {
            s.has_unsynced_changes = true;
            if s.phase == BlobSyncPhase::Idle {
                s.phase = BlobSyncPhase::Dirty;
            }
        });
        Ok(())
    }

    fn load_from_local(&self, user_id: &str) {
        let data = self
            .cache
            .get_json::<Map<String, Value>>(&user_data_key(user_id))
            .unwrap_or_default();
        self.state.lock().unwrap().data = data;
    }

    async fn load_from_cloud(self: &Arc<Self>, user_id: &str) -> Result<(), SyncError> {
        self.update_status(|s| {
            s.phase = BlobSyncPhase::Syncing;
            s.is_syncing = true;
            s.error = None;
        });

        let outcome = self.fetch_verified(user_id).await;
        let result = match outcome {
            Ok(Some(blob)) => {
                self.state.lock().unwrap().data = blob.data.clone();
                if let Err(e) = self.cache.set_json(&user_data_key(user_id), &blob.data) {
                    log::warn!("Failed to cache downloaded blob: {}", e);
                }
                self.update_status(|s| {
                    s.last_synced = Some(blob.metadata.last_modified);
                    s.has_unsynced_changes = false;
                });
                Ok(())
            }
            Ok(None) => {
                // Nothing uploaded yet. Keep whatever this device has and
                // push it if there is any.
                self.load_from_local(user_id);
                let has_local = !self.state.lock().unwrap().data.is_empty();
                self.update_status(|s| s.has_unsynced_changes = has_local);
                if has_local {
                    self.schedule_sync();
                }
                Ok(())
            }
            Err(e) => {
                log::warn!("Blob load failed, using local data: {}", e);
                self.load_from_local(user_id);
                Err(e)
            }
        };

        let error = result.as_ref().err().map(|e| match e {
            SyncError::IntegrityMismatch => e.to_string(),
            other => format!("Failed to sync from cloud, using local data: {}", other),
        });
        self.update_status(|s| {
            s.phase = if s.has_unsynced_changes {
                BlobSyncPhase::Dirty
            } else {
                BlobSyncPhase::Idle
            };
            s.is_syncing = false;
            s.error = error;
        });
        result
    }

    async fn fetch_verified(&self, user_id: &str) -> Result<Option<UserDataBlob>, SyncError> {
        let Some(bytes) = self.store.download_blob(user_id, &blob_path(user_id)).await? else {
            return Ok(None);
        };
        let blob: UserDataBlob = serde_json::from_slice(&bytes)?;
        if let Some(expected) = &blob.metadata.checksum {
            if *expected != checksum(&blob.data)? {
                log::error!("Blob checksum mismatch for user {}", user_id);
                return Err(SyncError::IntegrityMismatch);
            }
        }
        Ok(Some(blob))
    }

    async fn sync_to_cloud(self: &Arc<Self>) -> Result<(), SyncError> {
        let (user_id, data, revision) = {
            let state = self.state.lock().unwrap();
            let user_id = state.user_id.clone().ok_or(SyncError::NotInitialized)?;
            (user_id, state.data.clone(), state.revision)
        };

        if self.status.borrow().is_syncing {
            // One upload at a time. Try again after another window.
            self.schedule_sync();
            return Ok(());
        }

        self.update_status(|s| {
            s.phase = BlobSyncPhase::Syncing;
            s.is_syncing = true;
            s.error = None;
        });

        let result = self.upload(&user_id, data).await;

        let stale = self.state.lock().unwrap().revision != revision;
        match &result {
            Ok(()) => {
                log::info!("Blob synced for user {}", user_id);
                self.update_status(|s| {
                    s.last_synced = Some(Utc::now());
                    s.has_unsynced_changes = stale;
                });
            }
            Err(e) => {
                log::error!("Blob sync failed for user {}: {}", user_id, e);
                let message = e.to_string();
                self.update_status(|s| {
                    s.has_unsynced_changes = true;
                    s.error = Some(message);
                });
            }
        }
        self.update_status(|s| {
            s.is_syncing = false;
            s.phase = if stale {
                BlobSyncPhase::Dirty
            } else {
                BlobSyncPhase::Idle
            };
        });
        result
    }

    async fn upload(&self, user_id: &str, data: Map<String, Value>) -> Result<(), SyncError> {
        let blob = UserDataBlob {
            metadata: BlobMetadata {
                last_modified: Utc::now(),
                version: BLOB_FORMAT_VERSION.to_string(),
                device_id: self.device_id.clone(),
                checksum: Some(checksum(&data)?),
            },
            data,
        };
        let body = serde_json::to_vec_pretty(&blob)?;
        self.store
            .upload_blob(user_id, &blob_path(user_id), &body)
            .await?;
        Ok(())
    }
}

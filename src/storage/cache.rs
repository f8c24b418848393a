use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use super::backend::{MemoryBackend, Result, StorageBackend};
use crate::keys::{self, ContentKey, KeyTier};

const EVENT_CAPACITY: usize = 256;

/// A change made through one cache handle, seen by every other handle on
/// the same origin.
#[derive(Debug, Clone)]
pub struct StorageEvent {
    pub key: String,
    pub new_value: Option<String>,
    pub source: u64,
}

/// Keys the cache may drop to make room when the quota is hit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisposalPolicy {
    #[serde(default)]
    pub prefixes: Vec<String>,
    #[serde(default)]
    pub markers: Vec<String>,
}

impl DisposalPolicy {
    pub fn is_disposable(&self, key: &str) -> bool {
        self.prefixes.iter().any(|p| key.starts_with(p.as_str()))
            || self.markers.iter().any(|m| key.contains(m.as_str()))
    }
}

/// Per-key size summary of the cache.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_keys: usize,
    pub total_bytes: usize,
    pub template_keys: usize,
    pub by_type: BTreeMap<String, usize>,
}

struct OriginInner {
    origin: String,
    backend: Mutex<Box<dyn StorageBackend>>,
    events: broadcast::Sender<StorageEvent>,
    next_handle: AtomicU64,
    disposal: DisposalPolicy,
}

/// Storage shared by every tab of one origin.
#[derive(Clone)]
pub struct OriginStorage {
    inner: Arc<OriginInner>,
}

impl OriginStorage {
    pub fn new(
        origin: impl Into<String>,
        backend: impl StorageBackend + 'static,
        disposal: DisposalPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(OriginInner {
                origin: origin.into(),
                backend: Mutex::new(Box::new(backend)),
                events,
                next_handle: AtomicU64::new(1),
                disposal,
            }),
        }
    }

    pub fn in_memory(origin: impl Into<String>) -> Self {
        Self::new(origin, MemoryBackend::new(), DisposalPolicy::default())
    }

    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// Open a handle for one execution context (a tab).
    pub fn open_cache(&self) -> LocalCache {
        LocalCache {
            storage: self.clone(),
            handle: self.inner.next_handle.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// Synchronous key/value cache handle.
///
/// Clones share the handle id, so they count as the same context when
/// change events are filtered.
#[derive(Clone)]
pub struct LocalCache {
    storage: OriginStorage,
    handle: u64,
}

impl LocalCache {
    /// A cache on a private in-memory origin.
    pub fn in_memory() -> Self {
        OriginStorage::in_memory("memory").open_cache()
    }

    pub fn origin(&self) -> &str {
        self.storage.origin()
    }

    pub fn handle_id(&self) -> u64 {
        self.handle
    }

    fn backend(&self) -> MutexGuard<'_, Box<dyn StorageBackend>> {
        self.storage.inner.backend.lock().unwrap()
    }

    fn notify(&self, key: &str, new_value: Option<&str>) {
        // No receivers is fine.
        let _ = self.storage.inner.events.send(StorageEvent {
            key: key.to_string(),
            new_value: new_value.map(str::to_string),
            source: self.handle,
        });
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self.backend().get(key) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Read and deserialize. Unparseable values read as absent.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                log::debug!("Ignoring unparseable value at {}: {}", key, e);
                None
            }
        }
    }

    /// Read as JSON, falling back to a plain string for non-JSON values.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        let raw = self.get(key)?;
        Some(serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
    }

    /// Write a raw string.
    ///
    /// When the quota is hit, disposable keys are purged and the write is
    /// retried once. Only the retry's failure is returned.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut purged = Vec::new();
        let result = {
            let mut backend = self.backend();
            match backend.set(key, value) {
                Err(e) if e.is_quota() => {
                    purged = purge_disposable(backend.as_mut(), &self.storage.inner.disposal, key);
                    log::warn!(
                        "Cache quota hit writing {}, purged {} disposable keys",
                        key,
                        purged.len()
                    );
                    backend.set(key, value)
                }
                other => other,
            }
        };

        for k in &purged {
            self.notify(k, None);
        }

        match result {
            Ok(()) => {
                self.notify(key, Some(value));
                Ok(())
            }
            Err(e) => {
                log::error!("Cache write failed for {}: {}", key, e);
                Err(e)
            }
        }
    }

    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw)
    }

    /// Write a JSON value. Strings are stored raw.
    pub fn set_value(&self, key: &str, value: &Value) -> Result<()> {
        match value {
            Value::String(s) => self.set(key, s),
            other => self.set(key, &other.to_string()),
        }
    }

    pub fn remove(&self, key: &str) {
        if let Err(e) = self.backend().remove(key) {
            log::warn!("Cache remove failed for {}: {}", key, e);
            return;
        }
        self.notify(key, None);
    }

    pub fn keys(&self) -> Vec<String> {
        match self.backend().keys() {
            Ok(keys) => keys,
            Err(e) => {
                log::warn!("Cache key listing failed: {}", e);
                Vec::new()
            }
        }
    }

    pub fn list_keys<F: Fn(&str) -> bool>(&self, predicate: F) -> Vec<String> {
        self.keys().into_iter().filter(|k| predicate(k)).collect()
    }

    /// Stored size of one value in bytes, 0 when absent.
    pub fn estimate_size(&self, key: &str) -> usize {
        self.get(key).map(|v| v.len()).unwrap_or(0)
    }

    pub fn total_size(&self) -> usize {
        self.backend().used_bytes().unwrap_or(0)
    }

    /// Read content through the tab, then base, key chain.
    pub fn lookup(&self, key: &ContentKey) -> Option<(KeyTier, Value)> {
        keys::resolve_with_fallback(key, |k| self.get_value(k))
    }

    /// Typed fallback read with a caller supplied default.
    pub fn get_with_fallback<T: DeserializeOwned>(&self, key: &ContentKey, default: T) -> T {
        keys::resolve_with_fallback(key, |k| self.get_json::<T>(k))
            .map(|(_, v)| v)
            .unwrap_or(default)
    }

    /// Keys that extend `base_key` with a tab suffix.
    pub fn tab_keys(&self, base_key: &str) -> Vec<String> {
        let prefix = format!("{}_", base_key);
        self.list_keys(|k| k.starts_with(&prefix))
    }

    /// Give a tab its own copy of the base content. Returns false when the
    /// tab already has content or there is nothing to copy.
    pub fn isolate_to_tab(&self, key: &ContentKey) -> Result<bool> {
        if key.tab_id().is_none() {
            return Ok(false);
        }
        let tab_key = key.to_string();
        if self.contains(&tab_key) {
            return Ok(false);
        }
        match self.get(&key.base()) {
            Some(value) => {
                self.set(&tab_key, &value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop tab-scoped copies for tabs that no longer exist.
    pub fn remove_orphaned_tab_keys(&self, base_key: &str, live_tabs: &[&str]) -> usize {
        let live: Vec<String> = live_tabs
            .iter()
            .map(|t| format!("{}_{}", base_key, keys::normalize_segment(t)))
            .collect();
        let mut removed = 0;
        for key in self.tab_keys(base_key) {
            if !live.contains(&key) {
                self.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for key in self.keys() {
            stats.total_keys += 1;
            stats.total_bytes += key.len() + self.estimate_size(&key);
            if let Some(kind) = keys::template_type_of(&key) {
                stats.template_keys += 1;
                *stats.by_type.entry(kind.to_string()).or_default() += 1;
            }
        }
        stats
    }

    /// Subscribe to changes made by other handles on this origin.
    pub fn watch(&self) -> StorageWatcher {
        StorageWatcher {
            rx: self.storage.inner.events.subscribe(),
            handle: self.handle,
        }
    }
}

fn purge_disposable(
    backend: &mut dyn StorageBackend,
    policy: &DisposalPolicy,
    keep: &str,
) -> Vec<String> {
    let keys = backend.keys().unwrap_or_default();
    let mut purged = Vec::new();
    for key in keys {
        if key != keep && policy.is_disposable(&key) && backend.remove(&key).is_ok() {
            purged.push(key);
        }
    }
    purged
}

/// Stream of foreign storage events.
pub struct StorageWatcher {
    rx: broadcast::Receiver<StorageEvent>,
    handle: u64,
}

impl StorageWatcher {
    /// Next change made by another handle. `None` once the origin is gone.
    pub async fn next(&mut self) -> Option<StorageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.source == self.handle => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Storage watcher lagged, {} events dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quota_cache(quota: usize) -> LocalCache {
        OriginStorage::new(
            "test",
            MemoryBackend::with_quota(quota),
            DisposalPolicy {
                prefixes: vec!["backup_".to_string()],
                markers: vec!["_temp_".to_string()],
            },
        )
        .open_cache()
    }

    #[test]
    fn test_values_round_trip_as_json_or_text() {
        let cache = LocalCache::in_memory();
        cache.set_value("NOTES_Bio_Cells", &json!("<p>hello</p>")).unwrap();
        cache.set_value("MCQ_Bio_Cells", &json!([{"q": 1}])).unwrap();

        assert_eq!(cache.get("NOTES_Bio_Cells").as_deref(), Some("<p>hello</p>"));
        assert_eq!(cache.get_value("NOTES_Bio_Cells"), Some(json!("<p>hello</p>")));
        assert_eq!(cache.get_value("MCQ_Bio_Cells"), Some(json!([{"q": 1}])));
        assert_eq!(cache.get_json::<Vec<Value>>("NOTES_Bio_Cells"), None);
    }

    #[test]
    fn test_quota_purges_disposable_then_retries() {
        let cache = quota_cache(40);
        cache.set("backup_old", "0123456789").unwrap();
        cache.set("x_temp_1", "0123456789").unwrap();

        cache.set("FLASHCARD_A_B", "0123456789").unwrap();
        assert!(!cache.contains("backup_old"));
        assert!(!cache.contains("x_temp_1"));
        assert!(cache.contains("FLASHCARD_A_B"));
    }

    #[test]
    fn test_quota_failure_is_reported() {
        let cache = quota_cache(16);
        let err = cache.set("NOTES_A_B", "0123456789abcdef").unwrap_err();
        assert!(err.is_quota());
        assert!(!cache.contains("NOTES_A_B"));
    }

    #[test]
    fn test_fallback_read_with_default() {
        let cache = LocalCache::in_memory();
        cache.set_json("QA_Bio_Cells", &vec![1, 2]).unwrap();
        cache.set("QA_Bio_Cells_t1", "not json").unwrap();

        let key = ContentKey::new("QA", "Bio", "Cells").with_tab(Some("t1"));
        // The tab value is unparseable, so the base value wins.
        assert_eq!(cache.get_with_fallback(&key, Vec::<i32>::new()), vec![1, 2]);

        let missing = ContentKey::new("QA", "Bio", "Genes");
        assert_eq!(cache.get_with_fallback(&missing, vec![9]), vec![9]);
    }

    #[test]
    fn test_tab_helpers() {
        let cache = LocalCache::in_memory();
        cache.set("NOTES_Bio_Cells", "base").unwrap();

        let key = ContentKey::new("NOTES", "Bio", "Cells").with_tab(Some("t1"));
        assert!(cache.isolate_to_tab(&key).unwrap());
        assert!(!cache.isolate_to_tab(&key).unwrap());
        cache.set("NOTES_Bio_Cells_t2", "other").unwrap();

        assert_eq!(cache.tab_keys("NOTES_Bio_Cells").len(), 2);
        assert_eq!(cache.remove_orphaned_tab_keys("NOTES_Bio_Cells", &["t1"]), 1);
        assert!(cache.contains("NOTES_Bio_Cells_t1"));
        assert!(!cache.contains("NOTES_Bio_Cells_t2"));

        let stats = cache.stats();
        assert_eq!(stats.total_keys, 2);
        assert_eq!(stats.by_type.get("NOTES"), Some(&2));
    }

    #[tokio::test]
    async fn test_watchers_skip_own_writes() {
        let origin = OriginStorage::in_memory("app");
        let tab_a = origin.open_cache();
        let tab_b = origin.open_cache();

        let mut watcher = tab_a.watch();
        tab_a.set("own", "1").unwrap();
        tab_b.set("foreign", "2").unwrap();

        let event = watcher.next().await.unwrap();
        assert_eq!(event.key, "foreign");
        assert_eq!(event.new_value.as_deref(), Some("2"));
        assert_eq!(event.source, tab_b.handle_id());
    }
}

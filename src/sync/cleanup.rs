use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::error::SyncError;
use crate::cloud::{CloudStore, ContentMap};
use crate::identity::IdentityProvider;
use crate::keys::{canonical_key, is_template_key};
use crate::storage::LocalCache;

/// Keys written by sync layers that no longer exist.
pub const LEGACY_SYNC_KEYS: &[&str] = &[
    "sync_service_state",
    "progressive_loading_state",
    "backend_books_cache",
    "legacy_books_cache",
];

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardizeReport {
    /// Keys moved to a free canonical key
    pub migrated: usize,
    /// Keys folded into an existing canonical array
    pub merged: usize,
    /// Keys left in place because their values cannot be merged
    pub skipped: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudCleanupReport {
    pub books_updated: usize,
    pub groups_consolidated: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub success: bool,
    pub local: StandardizeReport,
    pub purged: usize,
    /// `None` when nobody is signed in
    pub cloud: Option<CloudCleanupReport>,
}

/// Two entries are the same when both carry an `id` and the ids agree, or
/// when neither does and they are equal.
fn same_entry(a: &Value, b: &Value) -> bool {
    match (a.get("id"), b.get("id")) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Append the entries of `incoming` that `existing` does not already hold.
pub fn merge_entries(existing: &[Value], incoming: &[Value]) -> Vec<Value> {
    let mut merged = existing.to_vec();
    for item in incoming {
        if !merged.iter().any(|m| same_entry(m, item)) {
            merged.push(item.clone());
        }
    }
    merged
}

fn array_len(value: &Value) -> usize {
    value.as_array().map_or(0, Vec::len)
}

/// Repairs key-naming drift in the cache and in cloud aggregates.
#[derive(Clone)]
pub struct KeyCleanupService {
    cache: LocalCache,
    cloud: Arc<dyn CloudStore>,
    identity: Arc<dyn IdentityProvider>,
}

impl KeyCleanupService {
    pub fn new(
        cache: LocalCache,
        cloud: Arc<dyn CloudStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            cache,
            cloud,
            identity,
        }
    }

    /// Move every drifted template key to its canonical key.
    pub fn standardize_local_keys(&self) -> StandardizeReport {
        let mut report = StandardizeReport::default();

        let drifted: Vec<(String, String)> = self
            .cache
            .list_keys(is_template_key)
            .into_iter()
            .filter_map(|key| {
                let canonical = canonical_key(&key);
                (canonical != key).then_some((key, canonical))
            })
            .collect();

        for (legacy, canonical) in drifted {
            let Some(incoming) = self.cache.get_value(&legacy) else {
                continue;
            };
            let result = match self.cache.get_value(&canonical) {
                None => self.cache.set_value(&canonical, &incoming).map(|_| {
                    report.migrated += 1;
                }),
                Some(Value::Array(existing)) => match &incoming {
                    Value::Array(items) => {
                        let merged = Value::Array(merge_entries(&existing, items));
                        self.cache.set_value(&canonical, &merged).map(|_| {
                            report.merged += 1;
                        })
                    }
                    _ => {
                        report.skipped.push(legacy.clone());
                        continue;
                    }
                },
                Some(_) => {
                    report.skipped.push(legacy.clone());
                    continue;
                }
            };

            match result {
                Ok(()) => {
                    log::debug!("Migrated {} -> {}", legacy, canonical);
                    self.cache.remove(&legacy);
                }
                Err(e) => report.errors.push(format!("{}: {}", legacy, e)),
            }
        }

        if !report.skipped.is_empty() {
            log::warn!(
                "Left {} keys in place, canonical values are not mergeable",
                report.skipped.len()
            );
        }
        log::info!(
            "Standardized keys: {} migrated, {} merged",
            report.migrated,
            report.merged
        );
        report
    }

    /// Remove state left behind by retired sync layers.
    pub fn purge_legacy_sync_state(&self) -> usize {
        LEGACY_SYNC_KEYS
            .iter()
            .filter(|key| {
                let present = self.cache.contains(key);
                if present {
                    self.cache.remove(key);
                }
                present
            })
            .count()
    }

    /// Collapse template keys in every cloud aggregate that share a
    /// canonical key, keeping the longest array.
    pub async fn cleanup_cloud_duplicates(&self) -> Result<CloudCleanupReport, SyncError> {
        let user_id = self
            .identity
            .current_user_id()
            .ok_or(SyncError::Unauthenticated)?;
        let mut report = CloudCleanupReport::default();

        for book in self.cloud.list_books_for_user(&user_id).await? {
            let aggregate = match self.cloud.fetch_book_aggregate(&user_id, &book.id).await {
                Ok(Some(aggregate)) => aggregate,
                Ok(None) => continue,
                Err(e) => {
                    report.errors.push(format!("{}: {}", book.name, e));
                    continue;
                }
            };

            let (content, consolidated) = consolidate(&aggregate.content);
            if consolidated == 0 && content == aggregate.content {
                continue;
            }

            match self
                .cloud
                .upsert_book_aggregate(&user_id, &aggregate.book, &aggregate.chapters, &content)
                .await
            {
                Ok(()) => {
                    report.books_updated += 1;
                    report.groups_consolidated += consolidated;
                }
                Err(e) => report.errors.push(format!("{}: {}", book.name, e)),
            }
        }

        log::info!(
            "Cloud cleanup: {} groups in {} books",
            report.groups_consolidated,
            report.books_updated
        );
        Ok(report)
    }

    /// Local standardization, legacy purge, then cloud consolidation when
    /// someone is signed in.
    pub async fn run_full_cleanup(&self) -> CleanupReport {
        let local = self.standardize_local_keys();
        let purged = self.purge_legacy_sync_state();

        let cloud = if self.identity.current_user_id().is_some() {
            Some(match self.cleanup_cloud_duplicates().await {
                Ok(report) => report,
                Err(e) => CloudCleanupReport {
                    errors: vec![e.to_string()],
                    ..Default::default()
                },
            })
        } else {
            None
        };

        let success = local.errors.is_empty()
            && cloud.as_ref().map_or(true, |c| c.errors.is_empty());
        CleanupReport {
            success,
            local,
            purged,
            cloud,
        }
    }
}

/// Returns the rewritten content map and how many multi-key groups were
/// collapsed. Non-template keys pass through untouched.
fn consolidate(content: &ContentMap) -> (ContentMap, usize) {
    let mut groups: BTreeMap<String, Vec<&String>> = BTreeMap::new();
    let mut out = ContentMap::new();

    for key in content.keys() {
        if is_template_key(key) {
            groups.entry(canonical_key(key)).or_default().push(key);
        } else {
            out.insert(key.clone(), content[key].clone());
        }
    }

    let mut consolidated = 0;
    for (canonical, keys) in groups {
        if keys.len() > 1 {
            consolidated += 1;
        }
        // Longest array wins; the canonical key breaks ties.
        let best = keys
            .iter()
            .copied()
            .max_by_key(|k| (array_len(&content[k.as_str()]), **k == canonical))
            .map(|k| content[k.as_str()].clone())
            .unwrap_or(Value::Null);
        out.insert(canonical, best);
    }
    (out, consolidated)
}

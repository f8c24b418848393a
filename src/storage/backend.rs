use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Storage quota exceeded while writing {key}")]
    QuotaExceeded { key: String },
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    pub fn is_quota(&self) -> bool {
        matches!(self, CacheError::QuotaExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Raw key/value store behind a [`LocalCache`](super::LocalCache).
pub trait StorageBackend: Send {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;
    /// Bytes used by keys plus values.
    fn used_bytes(&self) -> Result<usize>;
}

/// In-memory backend with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: BTreeMap<String, String>,
    quota_bytes: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn used(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some(quota) = self.quota_bytes {
            let replaced = self.entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
            if self.used() - replaced + key.len() + value.len() > quota {
                return Err(CacheError::QuotaExceeded {
                    key: key.to_string(),
                });
            }
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn used_bytes(&self) -> Result<usize> {
        Ok(self.used())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_quota() {
        let mut backend = MemoryBackend::with_quota(20);
        backend.set("a", "0123456789").unwrap();
        assert!(backend.set("b", "0123456789").unwrap_err().is_quota());

        // Replacing an entry only counts the difference.
        backend.set("a", "0123456789abcdef").unwrap();
        assert_eq!(backend.used_bytes().unwrap(), 17);

        backend.remove("a").unwrap();
        backend.set("b", "0123456789").unwrap();
        assert_eq!(backend.keys().unwrap(), vec!["b".to_string()]);
    }
}

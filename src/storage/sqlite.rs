use std::path::Path;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use super::backend::{CacheError, Result, StorageBackend};

/// Durable cache backend on a single SQLite table.
pub struct SqliteBackend {
    conn: Connection,
    quota_bytes: Option<usize>,
}

impl SqliteBackend {
    /// Open (or create) the cache database at `path`.
    pub fn open(path: &Path, quota_bytes: Option<usize>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn, quota_bytes)
    }

    pub fn open_in_memory(quota_bytes: Option<usize>) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, quota_bytes)
    }

    fn init(conn: Connection, quota_bytes: Option<usize>) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                key   TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn, quota_bytes })
    }

    fn entry_bytes(&self, key: &str) -> Result<usize> {
        let len: Option<i64> = self
            .conn
            .query_row(
                "SELECT length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))
                 FROM cache_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(len.unwrap_or(0) as usize)
    }
}

fn map_write_error(key: &str, err: rusqlite::Error) -> CacheError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => CacheError::QuotaExceeded {
            key: key.to_string(),
        },
        _ => CacheError::Database(err),
    }
}

impl StorageBackend for SqliteBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM cache_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some(quota) = self.quota_bytes {
            let projected = self.used_bytes()? - self.entry_bytes(key)? + key.len() + value.len();
            if projected > quota {
                return Err(CacheError::QuotaExceeded {
                    key: key.to_string(),
                });
            }
        }
        self.conn
            .execute(
                "INSERT INTO cache_entries (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(|e| map_write_error(key, e))?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT key FROM cache_entries ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    fn used_bytes(&self) -> Result<usize> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0)
             FROM cache_entries",
            [],
            |row| row.get(0),
        )?;
        Ok(total as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache").join("cache.db");

        {
            let mut backend = SqliteBackend::open(&path, None).unwrap();
            backend.set("FLASHCARD_Physics_Mechanics", "[1,2]").unwrap();
            backend.set("FLASHCARD_Physics_Mechanics", "[1,2,3]").unwrap();
            backend.set("createdBooks", "[]").unwrap();
        }

        let backend = SqliteBackend::open(&path, None).unwrap();
        assert_eq!(
            backend.get("FLASHCARD_Physics_Mechanics").unwrap().as_deref(),
            Some("[1,2,3]")
        );
        assert_eq!(backend.keys().unwrap().len(), 2);
        assert_eq!(backend.used_bytes().unwrap(), 27 + 7 + 12 + 2);
    }

    #[test]
    fn test_quota_rejects_write() {
        let mut backend = SqliteBackend::open_in_memory(Some(16)).unwrap();
        backend.set("k", "short").unwrap();
        let err = backend.set("big", "0123456789abcdef").unwrap_err();
        assert!(err.is_quota());
        assert!(backend.get("big").unwrap().is_none());
    }
}

mod backend;
mod cache;
mod sqlite;

pub use backend::{CacheError, MemoryBackend, StorageBackend};
pub use cache::{
    CacheStats, DisposalPolicy, LocalCache, OriginStorage, StorageEvent, StorageWatcher,
};
pub use sqlite::SqliteBackend;

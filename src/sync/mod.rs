pub mod config;

mod blob;
mod books;
mod cleanup;
mod debounce;
mod error;
mod loader;
mod reconcile;

pub use blob::{blob_path, checksum, BlobSyncService, StorageUsage, BLOB_FORMAT_VERSION};
pub use books::{
    BookListing, BookRegistry, BookSource, BookSyncService, BulkReport, CloudPush, SaveOutcome,
    StartupReport,
};
pub use cleanup::{
    merge_entries, CleanupReport, CloudCleanupReport, KeyCleanupService, StandardizeReport,
    LEGACY_SYNC_KEYS,
};
pub use config::{
    AggregateSyncStatus, BlobLimits, BlobSyncPhase, BlobSyncStatus, BroadcastConfig, CacheConfig,
    CloudConfig, EngineConfig, LoaderConfig, SyncTimings,
};
pub use debounce::Debouncer;
pub use error::SyncError;
pub use loader::{ChapterDataResult, ChapterLoader, LoadPhase, LoadingProgress, ProgressListener};
pub use reconcile::{PullReport, PushReport, ReconciliationService, ResyncReport};

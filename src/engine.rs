//! Wiring for the whole sync stack.
//!
//! Services are built once, in dependency order, and shared by handle:
//! cache and broadcaster first, then the book service, then everything
//! that reads through it.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::broadcast::{
    BroadcastCoordinator, BroadcastStatus, StorageSignal, SyncEvent, SyncEventType,
    TransportProvider,
};
use crate::cloud::{BlobStore, CloudStore, MemoryCloud};
use crate::identity::IdentityProvider;
use crate::keys::{KeyMatcher, SegmentKeyMatcher};
use crate::storage::{LocalCache, OriginStorage};
use crate::subscription::Subscription;
use crate::sync::{
    AggregateSyncStatus, BlobSyncService, BlobSyncStatus, BookSyncService, BulkReport,
    ChapterDataResult, ChapterLoader, Debouncer, EngineConfig, KeyCleanupService, LoadingProgress,
    ReconciliationService, ResyncReport, SaveOutcome, SyncError,
};

/// Collaborators handed to [`SyncEngine::start`].
pub struct EngineParts {
    pub config: EngineConfig,
    pub storage: OriginStorage,
    pub cloud: Arc<dyn CloudStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub identity: Arc<dyn IdentityProvider>,
    /// Extra transports; a storage signal on `storage` is always added.
    pub transports: Vec<Box<dyn TransportProvider>>,
    pub matcher: Arc<dyn KeyMatcher>,
    /// Generated when `None`.
    pub tab_id: Option<String>,
}

impl EngineParts {
    /// Parts backed by an in-memory cloud, with default config.
    pub fn with_memory_cloud(
        storage: OriginStorage,
        cloud: Arc<MemoryCloud>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            config: EngineConfig::default(),
            storage,
            blobs: Arc::clone(&cloud) as Arc<dyn BlobStore>,
            cloud: cloud as Arc<dyn CloudStore>,
            identity,
            transports: Vec::new(),
            matcher: Arc::new(SegmentKeyMatcher),
            tab_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub books: AggregateSyncStatus,
    pub blob: BlobSyncStatus,
    pub broadcast: BroadcastStatus,
}

pub struct SyncEngine {
    config: EngineConfig,
    cache: LocalCache,
    identity: Arc<dyn IdentityProvider>,
    debouncer: Debouncer,
    broadcaster: Arc<BroadcastCoordinator>,
    books: BookSyncService,
    blob: BlobSyncService,
    reconcile: ReconciliationService,
    cleanup: KeyCleanupService,
    loader: ChapterLoader,
}

impl SyncEngine {
    /// Build every service. Must be called from within a tokio runtime.
    pub fn start(parts: EngineParts) -> Self {
        let EngineParts {
            config,
            storage,
            cloud,
            blobs,
            identity,
            mut transports,
            matcher,
            tab_id,
        } = parts;

        let cache = storage.open_cache();
        transports.push(Box::new(StorageSignal::new(
            storage.open_cache(),
            config.broadcast.relay_window(),
        )));
        let tab_id = tab_id.unwrap_or_else(BroadcastCoordinator::generate_tab_id);
        let broadcaster = BroadcastCoordinator::start(tab_id, storage.origin(), transports);

        let debouncer = Debouncer::new();
        let books = BookSyncService::new(
            cache.clone(),
            Arc::clone(&cloud),
            Arc::clone(&identity),
            Arc::clone(&broadcaster),
            Arc::clone(&matcher),
            debouncer.clone(),
            config.sync.autosave(),
        );
        let blob = BlobSyncService::new(
            cache.clone(),
            blobs,
            debouncer.clone(),
            config.sync.debounce(),
            config.blob.clone(),
        );
        let reconcile = ReconciliationService::new(
            cache.clone(),
            books.clone(),
            Arc::clone(&cloud),
            Arc::clone(&identity),
        );
        let cleanup = KeyCleanupService::new(cache.clone(), Arc::clone(&cloud), Arc::clone(&identity));
        let loader = ChapterLoader::new(
            cache.clone(),
            books.clone(),
            cloud,
            Arc::clone(&identity),
            matcher,
            config.loader.large_threshold_bytes,
        );

        log::info!("Sync engine started for tab {}", broadcaster.tab_id());
        Self {
            config,
            cache,
            identity,
            debouncer,
            broadcaster,
            books,
            blob,
            reconcile,
            cleanup,
            loader,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn tab_id(&self) -> &str {
        self.broadcaster.tab_id()
    }

    pub fn books(&self) -> &BookSyncService {
        &self.books
    }

    pub fn blob(&self) -> &BlobSyncService {
        &self.blob
    }

    pub fn reconciliation(&self) -> &ReconciliationService {
        &self.reconcile
    }

    pub fn cleanup(&self) -> &KeyCleanupService {
        &self.cleanup
    }

    pub fn loader(&self) -> &ChapterLoader {
        &self.loader
    }

    pub fn broadcaster(&self) -> &Arc<BroadcastCoordinator> {
        &self.broadcaster
    }

    /// Bind per-user services to the signed-in user and run the start-up
    /// sync. Does nothing when signed out.
    pub async fn sign_in_sync(&self) -> Result<(), SyncError> {
        let Some(user_id) = self.identity.current_user_id() else {
            log::info!("No user signed in, staying local-only");
            return Ok(());
        };

        if let Err(e) = self.blob.initialize(&user_id).await {
            log::warn!("Blob sync started degraded: {}", e);
        }
        let report = self.books.startup_sync().await?;
        log::info!(
            "Start-up sync pushed {}/{} and pulled {}/{} books",
            report.pushed.succeeded,
            report.pushed.total,
            report.pulled.succeeded,
            report.pulled.total
        );
        Ok(())
    }

    pub async fn save_content(
        &self,
        book_id: &str,
        book_name: &str,
        chapter_name: &str,
        content_type: &str,
        value: &Value,
    ) -> Result<SaveOutcome, SyncError> {
        self.books
            .save_content(book_id, book_name, chapter_name, content_type, value)
            .await
    }

    pub async fn save_template(
        &self,
        book_id: &str,
        book_name: &str,
        chapter_name: &str,
        content_type: &str,
        tab_id: Option<&str>,
        value: &Value,
    ) -> Result<SaveOutcome, SyncError> {
        self.books
            .save_template(book_id, book_name, chapter_name, content_type, tab_id, value)
            .await
    }

    pub async fn get_content_with_cloud_fallback(
        &self,
        book_name: &str,
        chapter_name: &str,
        content_type: &str,
        tab_id: Option<&str>,
    ) -> Option<Value> {
        self.books
            .get_content_with_cloud_fallback(book_name, chapter_name, content_type, tab_id)
            .await
    }

    pub async fn load_chapter_data(&self, book_name: &str, chapter_name: &str) -> ChapterDataResult {
        self.loader.load_chapter_data(book_name, chapter_name).await
    }

    pub fn subscribe_to_loading_progress<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LoadingProgress) + Send + Sync + 'static,
    {
        self.loader.subscribe(listener)
    }

    pub fn subscribe_to_sync_events<F>(&self, listener_id: &str, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.broadcaster.subscribe(listener_id, listener)
    }

    pub fn get_sync_status(&self) -> EngineStatus {
        EngineStatus {
            books: self.books.status(),
            blob: self.blob.get_sync_status(),
            broadcast: self.broadcaster.status(),
        }
    }

    /// Upload the blob now and push every book.
    pub async fn force_sync(&self) -> Result<BulkReport, SyncError> {
        let blob_error = match self.blob.user_id() {
            Some(_) => self.blob.force_sync().await.err(),
            None => None,
        };
        let mut report = self.books.force_sync_all_to_cloud().await?;
        if let Some(e) = blob_error {
            report.errors.push(format!("User data: {}", e));
        }
        Ok(report)
    }

    pub async fn force_complete_resync(&self) -> ResyncReport {
        let report = self.reconcile.force_complete_resync().await;
        self.broadcaster
            .broadcast_sync_event(SyncEvent::new(SyncEventType::SyncComplete, ""));
        report
    }

    /// Cancel pending timers and close transports.
    pub fn shutdown(&self) {
        self.blob.shutdown();
        self.debouncer.cancel_all();
        self.broadcaster.stop();
        log::info!("Sync engine for tab {} stopped", self.tab_id());
    }
}

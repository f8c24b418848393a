use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use super::config::AggregateSyncStatus;
use super::debounce::Debouncer;
use super::error::SyncError;
use crate::broadcast::{BroadcastCoordinator, SyncEvent, SyncEventType};
use crate::cloud::{
    Book, BookAggregate, Chapter, CloudError, CloudStore, ContentMap, NewBook, NewChapter,
};
use crate::identity::IdentityProvider;
use crate::keys::{
    chapters_key, is_global_key, normalize_segment, BookScope, ContentKey, KeyMatcher,
    BOOKS_KEY, LAST_SYNC_KEY,
};
use crate::storage::LocalCache;

/// Local list of books and their chapters.
#[derive(Clone)]
pub struct BookRegistry {
    cache: LocalCache,
}

impl BookRegistry {
    pub fn new(cache: LocalCache) -> Self {
        Self { cache }
    }

    pub fn books(&self) -> Vec<Book> {
        self.cache.get_json(BOOKS_KEY).unwrap_or_default()
    }

    pub fn save_books(&self, books: &[Book]) -> Result<(), SyncError> {
        self.cache.set_json(BOOKS_KEY, books)?;
        Ok(())
    }

    /// Insert or replace by id.
    pub fn upsert_book(&self, book: &Book) -> Result<(), SyncError> {
        let mut books = self.books();
        match books.iter_mut().find(|b| b.id == book.id) {
            Some(existing) => *existing = book.clone(),
            None => books.push(book.clone()),
        }
        self.save_books(&books)
    }

    pub fn remove_book(&self, book_id: &str) -> Result<Option<Book>, SyncError> {
        let mut books = self.books();
        let removed = books
            .iter()
            .position(|b| b.id == book_id)
            .map(|i| books.remove(i));
        if removed.is_some() {
            self.save_books(&books)?;
        }
        self.cache.remove(&chapters_key(book_id));
        Ok(removed)
    }

    pub fn find_by_id(&self, book_id: &str) -> Option<Book> {
        self.books().into_iter().find(|b| b.id == book_id)
    }

    /// Match on the normalized name, so spacing differences still resolve.
    pub fn find_by_name(&self, name: &str) -> Option<Book> {
        let wanted = normalize_segment(name);
        self.books()
            .into_iter()
            .find(|b| normalize_segment(&b.name) == wanted)
    }

    pub fn chapters(&self, book_id: &str) -> Vec<Chapter> {
        self.cache.get_json(&chapters_key(book_id)).unwrap_or_default()
    }

    pub fn save_chapters(&self, book_id: &str, chapters: &[Chapter]) -> Result<(), SyncError> {
        self.cache.set_json(&chapters_key(book_id), chapters)?;
        Ok(())
    }

    /// Matching scope for `book`, aware of every other local book name.
    pub fn scope(&self, book: &Book) -> BookScope {
        let books = self.books();
        BookScope::new(&book.id, &book.name).with_known_names(books.iter().map(|b| b.name.as_str()))
    }

    /// Split a `<prefix><book>_<rest>` key into its book and the rest.
    /// Longer book names are tried first.
    pub fn resolve_key(&self, key: &str, prefix: &str) -> Option<(Book, String)> {
        let mut books = self.books();
        books.sort_by_key(|b| std::cmp::Reverse(normalize_segment(&b.name).len()));
        books.into_iter().find_map(|book| {
            let head = format!("{}{}_", prefix, normalize_segment(&book.name));
            let rest = key.strip_prefix(&head)?;
            (!rest.is_empty()).then(|| (book, rest.to_string()))
        })
    }

    /// Display name of the chapter whose normalized name is `segment`.
    pub fn chapter_name(&self, book_id: &str, segment: &str) -> String {
        self.chapters(book_id)
            .into_iter()
            .find(|c| normalize_segment(&c.name) == segment)
            .map(|c| c.name)
            .unwrap_or_else(|| segment.replace('_', " "))
    }
}

/// What happened to the cloud copy after a local write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum CloudPush {
    Synced,
    /// Queued behind the auto-save window
    Deferred,
    /// Nobody signed in, or the book is unknown to the registry
    LocalOnly,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub key: String,
    pub cloud: CloudPush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSource {
    Cloud,
    Local,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookListing {
    pub books: Vec<Book>,
    pub source: BookSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a bulk push or pull.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkReport {
    pub total: usize,
    pub succeeded: usize,
    pub errors: Vec<String>,
}

impl BulkReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupReport {
    pub pushed: BulkReport,
    pub pulled: BulkReport,
    pub skipped: bool,
}

struct BooksInner {
    cache: LocalCache,
    registry: BookRegistry,
    cloud: Arc<dyn CloudStore>,
    identity: Arc<dyn IdentityProvider>,
    broadcaster: Arc<BroadcastCoordinator>,
    matcher: Arc<dyn KeyMatcher>,
    debouncer: Debouncer,
    autosave_delay: Duration,
    status: watch::Sender<AggregateSyncStatus>,
}

/// Write path for books, chapters and content.
///
/// Every operation writes the cache first, then pushes the whole book
/// aggregate. A failed push never fails the local write; it is reported
/// in the returned [`CloudPush`] and the status channel.
#[derive(Clone)]
pub struct BookSyncService {
    inner: Arc<BooksInner>,
}

impl BookSyncService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: LocalCache,
        cloud: Arc<dyn CloudStore>,
        identity: Arc<dyn IdentityProvider>,
        broadcaster: Arc<BroadcastCoordinator>,
        matcher: Arc<dyn KeyMatcher>,
        debouncer: Debouncer,
        autosave_delay: Duration,
    ) -> Self {
        let (status, _) = watch::channel(AggregateSyncStatus::default());
        Self {
            inner: Arc::new(BooksInner {
                registry: BookRegistry::new(cache.clone()),
                cache,
                cloud,
                identity,
                broadcaster,
                matcher,
                debouncer,
                autosave_delay,
                status,
            }),
        }
    }

    pub fn registry(&self) -> &BookRegistry {
        &self.inner.registry
    }

    pub fn status(&self) -> AggregateSyncStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<AggregateSyncStatus> {
        self.inner.status.subscribe()
    }

    pub async fn create_book(&self, input: NewBook) -> Result<(Book, CloudPush), SyncError> {
        let book = Book::new(input);
        self.inner.registry.upsert_book(&book)?;
        self.inner.registry.save_chapters(&book.id, &[])?;
        log::info!("Created book {} ({})", book.name, book.id);

        let push = self.inner.push_book(&book).await;
        self.inner.announce(
            &push,
            SyncEvent::new(SyncEventType::BookCreated, &book.name).with_book_id(&book.id),
        );
        Ok((book, push))
    }

    pub async fn add_chapter(
        &self,
        book_id: &str,
        input: NewChapter,
    ) -> Result<(Chapter, CloudPush), SyncError> {
        let mut book = self
            .inner
            .registry
            .find_by_id(book_id)
            .ok_or_else(|| SyncError::BookNotFound(book_id.to_string()))?;

        let chapter = Chapter::new(book_id, input);
        let mut chapters = self.inner.registry.chapters(book_id);
        chapters.push(chapter.clone());
        chapters.sort_by_key(|c| c.number);
        self.inner.registry.save_chapters(book_id, &chapters)?;

        book.touch();
        self.inner.registry.upsert_book(&book)?;

        let push = self.inner.push_book(&book).await;
        self.inner.announce(
            &push,
            SyncEvent::new(SyncEventType::ChapterAdded, &book.name)
                .with_book_id(&book.id)
                .with_chapter(&chapter.name),
        );
        Ok((chapter, push))
    }

    /// Write `value` under `contentType_book_chapter` and push the book.
    pub async fn save_content(
        &self,
        book_id: &str,
        book_name: &str,
        chapter_name: &str,
        content_type: &str,
        value: &Value,
    ) -> Result<SaveOutcome, SyncError> {
        let key = ContentKey::new(content_type, book_name, chapter_name);
        self.write_and_push(
            book_id,
            book_name,
            chapter_name,
            &key,
            value,
            SyncEventType::ContentSaved,
        )
        .await
    }

    /// Like [`save_content`](Self::save_content), scoped to one tab.
    pub async fn save_tab_content(
        &self,
        book_id: &str,
        book_name: &str,
        chapter_name: &str,
        content_type: &str,
        tab_id: &str,
        value: &Value,
    ) -> Result<SaveOutcome, SyncError> {
        let key = ContentKey::new(content_type, book_name, chapter_name).with_tab(Some(tab_id));
        self.write_and_push(
            book_id,
            book_name,
            chapter_name,
            &key,
            value,
            SyncEventType::ContentSaved,
        )
        .await
    }

    /// Replace a template editor's whole set and tell other tabs with
    /// `template_updated`. `tab_id` scopes the write like
    /// [`save_tab_content`](Self::save_tab_content).
    pub async fn save_template(
        &self,
        book_id: &str,
        book_name: &str,
        chapter_name: &str,
        content_type: &str,
        tab_id: Option<&str>,
        value: &Value,
    ) -> Result<SaveOutcome, SyncError> {
        let key = ContentKey::new(content_type, book_name, chapter_name).with_tab(tab_id);
        self.write_and_push(
            book_id,
            book_name,
            chapter_name,
            &key,
            value,
            SyncEventType::TemplateUpdated,
        )
        .await
    }

    async fn write_and_push(
        &self,
        book_id: &str,
        book_name: &str,
        chapter_name: &str,
        key: &ContentKey,
        value: &Value,
        event_type: SyncEventType,
    ) -> Result<SaveOutcome, SyncError> {
        let raw_key = key.to_string();
        let Some(book) = self.inner.write_local(book_id, book_name, &raw_key, value)? else {
            return Ok(SaveOutcome {
                key: raw_key,
                cloud: CloudPush::LocalOnly,
            });
        };

        let push = self.inner.push_book(&book).await;
        self.inner.announce(
            &push,
            SyncEvent::new(event_type, &book.name)
                .with_book_id(&book.id)
                .with_chapter(chapter_name)
                .with_content_type(key.content_type()),
        );
        Ok(SaveOutcome {
            key: raw_key,
            cloud: push,
        })
    }

    /// Write locally now and push the book once edits pause.
    pub fn autosave_content(
        &self,
        book_id: &str,
        book_name: &str,
        chapter_name: &str,
        content_type: &str,
        value: &Value,
    ) -> Result<SaveOutcome, SyncError> {
        let key = ContentKey::new(content_type, book_name, chapter_name);
        let raw_key = key.to_string();
        let Some(book) = self.inner.write_local(book_id, book_name, &raw_key, value)? else {
            return Ok(SaveOutcome {
                key: raw_key,
                cloud: CloudPush::LocalOnly,
            });
        };

        self.inner.mark_pending(&book.id);
        let inner = Arc::clone(&self.inner);
        let chapter = chapter_name.to_string();
        let content_type = content_type.to_string();
        self.inner.debouncer.schedule(
            format!("autosave:{}", book.id),
            self.inner.autosave_delay,
            move || async move {
                // Re-read so the push carries the latest metadata.
                let book = inner.registry.find_by_id(&book.id).unwrap_or(book);
                let push = inner.push_book(&book).await;
                inner.announce(
                    &push,
                    SyncEvent::content_saved(&book.id, &book.name, &chapter, &content_type),
                );
            },
        );

        Ok(SaveOutcome {
            key: raw_key,
            cloud: CloudPush::Deferred,
        })
    }

    /// Local read through the tab, then base, fallback chain.
    pub fn get_content(
        &self,
        book_name: &str,
        chapter_name: &str,
        content_type: &str,
        tab_id: Option<&str>,
    ) -> Option<Value> {
        let key = ContentKey::new(content_type, book_name, chapter_name).with_tab(tab_id);
        self.inner.cache.lookup(&key).map(|(_, v)| v)
    }

    /// Local read; on a miss, pull the chapter from the cloud and retry.
    pub async fn get_content_with_cloud_fallback(
        &self,
        book_name: &str,
        chapter_name: &str,
        content_type: &str,
        tab_id: Option<&str>,
    ) -> Option<Value> {
        if let Some(value) = self.get_content(book_name, chapter_name, content_type, tab_id) {
            return Some(value);
        }
        let user_id = self.inner.identity.current_user_id()?;

        let book = match self.inner.registry.find_by_name(book_name) {
            Some(book) => book,
            None => {
                let wanted = normalize_segment(book_name);
                match self.inner.cloud.list_books_for_user(&user_id).await {
                    Ok(books) => books
                        .into_iter()
                        .find(|b| normalize_segment(&b.name) == wanted)?,
                    Err(e) => {
                        log::warn!("Cloud fallback listing failed: {}", e);
                        return None;
                    }
                }
            }
        };

        match self.inner.cloud.fetch_book_aggregate(&user_id, &book.id).await {
            Ok(Some(aggregate)) => {
                let restored = self.inner.restore_chapter(&aggregate, chapter_name);
                log::debug!(
                    "Restored {} entries of {}/{} from cloud",
                    restored,
                    book.name,
                    chapter_name
                );
            }
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Cloud fallback fetch failed for {}: {}", book.name, e);
                return None;
            }
        }

        self.get_content(book_name, chapter_name, content_type, tab_id)
    }

    /// Cloud listing merged with local-only books; local list on failure.
    pub async fn get_all_books(&self) -> BookListing {
        let local = self.inner.registry.books();
        let Some(user_id) = self.inner.identity.current_user_id() else {
            return BookListing {
                books: sorted(local),
                source: BookSource::Local,
                error: None,
            };
        };

        match self.inner.cloud.list_books_for_user(&user_id).await {
            Ok(cloud_books) => {
                self.inner.mark_online(true);
                let merged = merge_books(cloud_books, local);
                if let Err(e) = self.inner.registry.save_books(&merged) {
                    log::warn!("Failed to cache book list: {}", e);
                }
                BookListing {
                    books: merged,
                    source: BookSource::Cloud,
                    error: None,
                }
            }
            Err(e) => {
                log::warn!("Book listing failed, using local list: {}", e);
                self.inner.record_error(&e);
                BookListing {
                    books: sorted(local),
                    source: BookSource::Local,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Cloud copy if reachable (written into the cache), else the local one.
    pub async fn get_complete_book_data(&self, book_id: &str) -> Result<BookAggregate, SyncError> {
        if let Some(user_id) = self.inner.identity.current_user_id() {
            match self.inner.cloud.fetch_book_aggregate(&user_id, book_id).await {
                Ok(Some(aggregate)) => {
                    self.inner.restore_aggregate(&aggregate)?;
                    return Ok(aggregate);
                }
                Ok(None) => log::debug!("Book {} not in cloud, using local copy", book_id),
                Err(e) => {
                    log::warn!("Fetching book {} failed, using local copy: {}", book_id, e);
                    self.inner.record_error(&e);
                }
            }
        }

        let book = self
            .inner
            .registry
            .find_by_id(book_id)
            .ok_or_else(|| SyncError::BookNotFound(book_id.to_string()))?;
        Ok(BookAggregate {
            chapters: self.inner.registry.chapters(book_id),
            content: self.inner.collect_content(&book),
            book,
            last_synced: None,
        })
    }

    /// Restore one book from the cloud. Returns the number of content entries.
    pub async fn load_book_from_cloud(&self, book_id: &str) -> Result<usize, SyncError> {
        let user_id = self.inner.require_user()?;
        let aggregate = self
            .inner
            .cloud
            .fetch_book_aggregate(&user_id, book_id)
            .await?
            .ok_or_else(|| SyncError::BookNotFound(book_id.to_string()))?;
        self.inner.restore_aggregate(&aggregate)
    }

    pub async fn load_all_user_books(&self) -> Result<BulkReport, SyncError> {
        let user_id = self.inner.require_user()?;
        let books = self.inner.cloud.list_books_for_user(&user_id).await?;

        let mut report = BulkReport {
            total: books.len(),
            ..Default::default()
        };
        for book in books {
            match self.load_book_from_cloud(&book.id).await {
                Ok(_) => report.succeeded += 1,
                Err(e) => report.errors.push(format!("{}: {}", book.name, e)),
            }
        }
        log::info!("Loaded {}/{} books from cloud", report.succeeded, report.total);
        Ok(report)
    }

    /// Remove a book locally and from the cloud.
    pub async fn delete_book(&self, book_id: &str) -> Result<(), SyncError> {
        let book = self
            .inner
            .registry
            .find_by_id(book_id)
            .ok_or_else(|| SyncError::BookNotFound(book_id.to_string()))?;

        self.inner.debouncer.cancel(&format!("autosave:{}", book_id));
        let scope = self.inner.registry.scope(&book);
        let mut removed = 0;
        for key in self.inner.cache.keys() {
            if self.inner.matcher.belongs_to_book(&key, &scope) {
                self.inner.cache.remove(&key);
                removed += 1;
            }
        }
        self.inner.registry.remove_book(book_id)?;
        self.inner.clear_pending(book_id);
        log::info!("Deleted book {} and {} local keys", book.name, removed);

        if let Some(user_id) = self.inner.identity.current_user_id() {
            self.inner.cloud.delete_book_aggregate(&user_id, book_id).await?;
        }
        self.inner.broadcaster.broadcast_sync_event(
            SyncEvent::new(SyncEventType::BookUpdated, &book.name).with_book_id(book_id),
        );
        Ok(())
    }

    pub async fn force_sync_book(&self, book_id: &str) -> Result<CloudPush, SyncError> {
        let book = self
            .inner
            .registry
            .find_by_id(book_id)
            .ok_or_else(|| SyncError::BookNotFound(book_id.to_string()))?;
        Ok(self.inner.push_book(&book).await)
    }

    /// Push every local book, collecting per-book failures.
    pub async fn force_sync_all_to_cloud(&self) -> Result<BulkReport, SyncError> {
        self.inner.require_user()?;
        let books = self.inner.registry.books();
        let mut report = BulkReport {
            total: books.len(),
            ..Default::default()
        };

        for book in &books {
            match self.inner.push_book(book).await {
                CloudPush::Synced => report.succeeded += 1,
                CloudPush::Failed(e) => report.errors.push(format!("{}: {}", book.name, e)),
                other => report
                    .errors
                    .push(format!("{}: unexpected push state {:?}", book.name, other)),
            }
        }

        if report.success() {
            if let Err(e) = self.inner.cache.set(LAST_SYNC_KEY, &Utc::now().to_rfc3339()) {
                log::warn!("Failed to record last sync time: {}", e);
            }
        }
        self.inner.broadcaster.broadcast_sync_event(SyncEvent::new(
            SyncEventType::SyncComplete,
            "",
        ));
        log::info!("Pushed {}/{} books", report.succeeded, report.total);
        Ok(report)
    }

    /// First sync after start-up.
    ///
    /// An empty device pulls everything. Otherwise local books are pushed,
    /// then books changed in the cloud since the last sync are pulled.
    pub async fn startup_sync(&self) -> Result<StartupReport, SyncError> {
        let Some(user_id) = self.inner.identity.current_user_id() else {
            return Ok(StartupReport {
                skipped: true,
                ..Default::default()
            });
        };

        if self.inner.registry.books().is_empty() {
            let pulled = self.load_all_user_books().await?;
            if let Err(e) = self.inner.cache.set(LAST_SYNC_KEY, &Utc::now().to_rfc3339()) {
                log::warn!("Failed to record last sync time: {}", e);
            }
            return Ok(StartupReport {
                pulled,
                ..Default::default()
            });
        }

        let last_sync: Option<DateTime<Utc>> = self
            .inner
            .cache
            .get(LAST_SYNC_KEY)
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc));

        let pushed = self.force_sync_all_to_cloud().await?;
        let mut pulled = BulkReport::default();

        if let Some(since) = last_sync {
            let local: HashMap<String, Book> = self
                .inner
                .registry
                .books()
                .into_iter()
                .map(|b| (b.id.clone(), b))
                .collect();
            let cloud_books = self.inner.cloud.list_books_for_user(&user_id).await?;
            for book in cloud_books {
                let newer = local
                    .get(&book.id)
                    .map_or(true, |l| book.updated_at > l.updated_at);
                if book.updated_at <= since || !newer {
                    continue;
                }
                pulled.total += 1;
                match self.load_book_from_cloud(&book.id).await {
                    Ok(_) => pulled.succeeded += 1,
                    Err(e) => pulled.errors.push(format!("{}: {}", book.name, e)),
                }
            }
        } else {
            log::info!("No last sync time, skipping cloud update check");
        }

        Ok(StartupReport {
            pushed,
            pulled,
            skipped: false,
        })
    }

    /// Every cached entry that belongs to `book`.
    pub fn collect_book_content(&self, book: &Book) -> ContentMap {
        self.inner.collect_content(book)
    }

    /// Write a cloud aggregate into the cache and registry.
    pub fn restore_aggregate(&self, aggregate: &BookAggregate) -> Result<usize, SyncError> {
        self.inner.restore_aggregate(aggregate)
    }

    pub(crate) fn restore_chapter(&self, aggregate: &BookAggregate, chapter_name: &str) -> usize {
        self.inner.restore_chapter(aggregate, chapter_name)
    }
}

impl BooksInner {
    fn require_user(&self) -> Result<String, SyncError> {
        self.identity
            .current_user_id()
            .ok_or(SyncError::Unauthenticated)
    }

    /// Write the value and bump the owning book. `None` when the book is
    /// not in the registry.
    fn write_local(
        &self,
        book_id: &str,
        book_name: &str,
        key: &str,
        value: &Value,
    ) -> Result<Option<Book>, SyncError> {
        self.cache.set_value(key, value)?;
        log::debug!("Saved {}", key);

        let Some(mut book) = self
            .registry
            .find_by_id(book_id)
            .or_else(|| self.registry.find_by_name(book_name))
        else {
            log::warn!("Saved {} for unregistered book {}", key, book_name);
            return Ok(None);
        };
        book.touch();
        self.registry.upsert_book(&book)?;
        Ok(Some(book))
    }

    fn collect_content(&self, book: &Book) -> ContentMap {
        let scope = self.registry.scope(book);
        let own_chapters = chapters_key(&book.id);
        let mut content = ContentMap::new();
        for key in self.cache.keys() {
            if is_global_key(&key) || key == own_chapters {
                continue;
            }
            if self.matcher.belongs_to_book(&key, &scope) {
                if let Some(value) = self.cache.get_value(&key) {
                    content.insert(key, value);
                }
            }
        }
        content
    }

    async fn push_book(&self, book: &Book) -> CloudPush {
        let Some(user_id) = self.identity.current_user_id() else {
            self.mark_pending(&book.id);
            return CloudPush::LocalOnly;
        };

        self.status.send_modify(|s| s.is_syncing = true);
        let chapters = self.registry.chapters(&book.id);
        let content = self.collect_content(book);

        let result = self
            .cloud
            .upsert_book_aggregate(&user_id, book, &chapters, &content)
            .await;
        self.status.send_modify(|s| s.is_syncing = false);

        match result {
            Ok(()) => {
                log::debug!("Pushed {} with {} entries", book.name, content.len());
                self.clear_pending(&book.id);
                self.status.send_modify(|s| {
                    s.is_online = true;
                    s.last_sync = Some(Utc::now());
                    s.last_error = None;
                });
                CloudPush::Synced
            }
            Err(e) => {
                log::error!("Failed to push book {}: {}", book.name, e);
                self.mark_pending(&book.id);
                self.record_error(&e);
                CloudPush::Failed(e.to_string())
            }
        }
    }

    /// Broadcast after a write unless the push failed.
    fn announce(&self, push: &CloudPush, event: SyncEvent) {
        if matches!(push, CloudPush::Failed(_)) {
            return;
        }
        self.broadcaster.broadcast_sync_event(event);
    }

    fn restore_aggregate(&self, aggregate: &BookAggregate) -> Result<usize, SyncError> {
        self.registry.upsert_book(&aggregate.book)?;
        self.registry
            .save_chapters(&aggregate.book.id, &aggregate.chapters)?;
        for (key, value) in &aggregate.content {
            self.cache.set_value(key, value)?;
        }
        Ok(aggregate.content.len())
    }

    /// Write the chapter's slice of `aggregate` into the cache.
    fn restore_chapter(&self, aggregate: &BookAggregate, chapter_name: &str) -> usize {
        if self.registry.find_by_id(&aggregate.book.id).is_none() {
            if let Err(e) = self.registry.upsert_book(&aggregate.book) {
                log::warn!("Failed to register {}: {}", aggregate.book.name, e);
            }
            if let Err(e) = self
                .registry
                .save_chapters(&aggregate.book.id, &aggregate.chapters)
            {
                log::warn!("Failed to save chapters of {}: {}", aggregate.book.name, e);
            }
        }
        let scope = self.registry.scope(&aggregate.book);
        let mut restored = 0;
        for (key, value) in &aggregate.content {
            if !self.matcher.belongs_to_chapter(key, &scope, chapter_name) {
                continue;
            }
            match self.cache.set_value(key, value) {
                Ok(()) => restored += 1,
                Err(e) => log::warn!("Failed to restore {}: {}", key, e),
            }
        }
        restored
    }

    fn mark_pending(&self, book_id: &str) {
        self.status.send_modify(|s| {
            if !s.pending_sync.iter().any(|id| id == book_id) {
                s.pending_sync.push(book_id.to_string());
            }
        });
    }

    fn clear_pending(&self, book_id: &str) {
        self.status
            .send_modify(|s| s.pending_sync.retain(|id| id != book_id));
    }

    fn mark_online(&self, online: bool) {
        self.status.send_modify(|s| s.is_online = online);
    }

    fn record_error(&self, err: &CloudError) {
        let offline = matches!(err, CloudError::Network(_) | CloudError::Http(_));
        let message = err.to_string();
        self.status.send_modify(|s| {
            if offline {
                s.is_online = false;
            }
            s.last_error = Some(message);
        });
    }
}

fn sorted(mut books: Vec<Book>) -> Vec<Book> {
    books.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    books
}

/// Union by id; the newer copy of a book present on both sides wins.
fn merge_books(cloud: Vec<Book>, local: Vec<Book>) -> Vec<Book> {
    let mut by_id: HashMap<String, Book> = HashMap::new();
    for book in cloud.into_iter().chain(local) {
        match by_id.get(&book.id) {
            Some(existing) if existing.updated_at >= book.updated_at => {}
            _ => {
                by_id.insert(book.id.clone(), book);
            }
        }
    }
    sorted(by_id.into_values().collect())
}

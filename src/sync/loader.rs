use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use super::books::{BookRegistry, BookSyncService};
use crate::cloud::{Book, CloudError, CloudStore, Highlight, LocalHighlight};
use crate::identity::IdentityProvider;
use crate::keys::{
    evaluation_reports_key, highlights_key, is_template_key, normalize_segment, BookScope,
    KeyMatcher, CUSTOM_TAB_PREFIX, EVALUATION_REPORTS_PREFIX, HIGHLIGHTS_PREFIX,
    QUESTION_PAPERS_PREFIX,
};
use crate::storage::LocalCache;
use crate::subscription::Subscription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadPhase {
    CloudSync,
    LocalStorage,
    BackgroundSync,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingProgress {
    pub phase: LoadPhase,
    pub progress: u8,
    pub message: String,
    /// Set once every small entry is in the cache; the chapter can render.
    pub small_files_loaded: bool,
    pub background_files_loading: bool,
}

impl LoadingProgress {
    fn new(phase: LoadPhase, progress: u8, message: &str) -> Self {
        Self {
            phase,
            progress,
            message: message.to_string(),
            small_files_loaded: matches!(phase, LoadPhase::BackgroundSync | LoadPhase::Complete),
            background_files_loading: phase == LoadPhase::BackgroundSync,
        }
    }
}

impl Default for LoadingProgress {
    fn default() -> Self {
        Self::new(LoadPhase::Complete, 100, "")
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterDataResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub highlight_count: usize,
    pub template_count: usize,
    pub custom_tab_count: usize,
    pub exam_data_count: usize,
    pub total_size_kb: usize,
    pub small_entries: usize,
    pub large_entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Highlights,
    Template,
    CustomTab,
    Exam,
    Other,
}

fn classify(key: &str) -> EntryKind {
    if key.starts_with(HIGHLIGHTS_PREFIX) {
        EntryKind::Highlights
    } else if key.contains(CUSTOM_TAB_PREFIX) {
        EntryKind::CustomTab
    } else if key.starts_with(QUESTION_PAPERS_PREFIX) || key.starts_with(EVALUATION_REPORTS_PREFIX)
    {
        EntryKind::Exam
    } else if is_template_key(key) {
        EntryKind::Template
    } else {
        EntryKind::Other
    }
}

pub type ProgressListener = Arc<dyn Fn(&LoadingProgress) + Send + Sync>;

struct LoaderInner {
    cache: LocalCache,
    registry: BookRegistry,
    books: BookSyncService,
    cloud: Arc<dyn CloudStore>,
    identity: Arc<dyn IdentityProvider>,
    matcher: Arc<dyn KeyMatcher>,
    large_threshold: usize,
    listeners: Mutex<BTreeMap<u64, ProgressListener>>,
    next_listener: AtomicU64,
    state: Mutex<LoadingProgress>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Loads one chapter at a time, reporting progress so a UI can render as
/// soon as the small entries are cached.
#[derive(Clone)]
pub struct ChapterLoader {
    inner: Arc<LoaderInner>,
}

impl ChapterLoader {
    pub fn new(
        cache: LocalCache,
        books: BookSyncService,
        cloud: Arc<dyn CloudStore>,
        identity: Arc<dyn IdentityProvider>,
        matcher: Arc<dyn KeyMatcher>,
        large_threshold: usize,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                registry: BookRegistry::new(cache.clone()),
                cache,
                books,
                cloud,
                identity,
                matcher,
                large_threshold,
                listeners: Mutex::new(BTreeMap::new()),
                next_listener: AtomicU64::new(1),
                state: Mutex::new(LoadingProgress::default()),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LoadingProgress) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .unwrap()
            .insert(id, Arc::new(listener));

        let inner: Weak<LoaderInner> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.listeners.lock().unwrap().remove(&id);
            }
        })
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().unwrap().len()
    }

    pub fn current_state(&self) -> LoadingProgress {
        self.inner.state.lock().unwrap().clone()
    }

    /// Pull the chapter's slice from the cloud when possible, then classify
    /// what is cached. Returns once the small entries are ready; large ones
    /// finish in the background.
    pub async fn load_chapter_data(&self, book_name: &str, chapter_name: &str) -> ChapterDataResult {
        let inner = &self.inner;
        let mut result = ChapterDataResult {
            success: true,
            ..Default::default()
        };

        let Some(user_id) = inner.identity.current_user_id() else {
            log::debug!("Signed out, loading {}/{} from cache", book_name, chapter_name);
            let scope = inner.local_scope(book_name);
            inner.finish_local(&scope, chapter_name, "Loaded from cache", &mut result);
            return result;
        };

        inner.notify(LoadingProgress::new(LoadPhase::CloudSync, 10, "Connecting to cloud..."));
        let book = inner.resolve_book(&user_id, book_name).await;
        inner.notify(LoadingProgress::new(
            LoadPhase::CloudSync,
            20,
            "Syncing content from cloud...",
        ));

        let scope = match &book {
            Some(book) => {
                if let Err(e) = inner.pull_chapter(&user_id, book, chapter_name).await {
                    log::warn!("Cloud pull for {}/{} failed: {}", book_name, chapter_name, e);
                    result.error = Some(e.to_string());
                    inner.finish_local(
                        &inner.registry.scope(book),
                        chapter_name,
                        "Loading failed, using cached data",
                        &mut result,
                    );
                    return result;
                }
                inner.registry.scope(book)
            }
            None => {
                log::debug!("{} is not in the cloud yet", book_name);
                inner.local_scope(book_name)
            }
        };

        inner.notify(LoadingProgress::new(
            LoadPhase::LocalStorage,
            60,
            "Loading essential data...",
        ));
        let large = inner.classify_chapter(&scope, chapter_name, &mut result);

        if large.is_empty() {
            inner.notify(LoadingProgress::new(LoadPhase::Complete, 100, "Chapter loaded"));
        } else {
            inner.notify(LoadingProgress::new(
                LoadPhase::BackgroundSync,
                90,
                "Preparing interface...",
            ));
            self.spawn_background(large);
        }
        result
    }

    /// Drop the chapter's cached entries, then load it again.
    pub async fn force_refresh_chapter(
        &self,
        book_name: &str,
        chapter_name: &str,
    ) -> ChapterDataResult {
        let scope = self.inner.local_scope(book_name);
        let keys = self
            .inner
            .cache
            .list_keys(|k| self.inner.matcher.belongs_to_chapter(k, &scope, chapter_name));
        for key in &keys {
            self.inner.cache.remove(key);
        }
        log::info!(
            "Cleared {} cached entries for {}/{}",
            keys.len(),
            book_name,
            chapter_name
        );
        self.load_chapter_data(book_name, chapter_name).await
    }

    /// True when no background pass is running.
    pub fn background_idle(&self) -> bool {
        let mut handles = self.inner.background.lock().unwrap();
        handles.retain(|h| !h.is_finished());
        handles.is_empty()
    }

    /// Wait for every background pass started so far.
    pub async fn wait_for_background(&self) {
        let handles: Vec<JoinHandle<()>> =
            self.inner.background.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("Background chapter pass ended abnormally: {}", e);
            }
        }
    }

    fn spawn_background(&self, large: Vec<(String, usize)>) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            log::debug!("Background loading {} large entries", large.len());
            for (key, size) in &large {
                // Parse once so the entry is known to be readable.
                if let Some(raw) = inner.cache.get(key) {
                    if serde_json::from_str::<Value>(&raw).is_err() {
                        log::debug!("{} ({} KiB) is not JSON", key, size / 1024);
                    }
                }
                tokio::task::yield_now().await;
            }
            inner.notify(LoadingProgress::new(LoadPhase::Complete, 100, "All data loaded"));
        });
        self.inner.background.lock().unwrap().push(handle);
    }
}

impl LoaderInner {
    fn notify(&self, progress: LoadingProgress) {
        *self.state.lock().unwrap() = progress.clone();

        let listeners: Vec<ProgressListener> =
            self.listeners.lock().unwrap().values().cloned().collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&progress))).is_err() {
                log::error!("Loading progress listener panicked");
            }
        }
    }

    fn local_scope(&self, book_name: &str) -> BookScope {
        match self.registry.find_by_name(book_name) {
            Some(book) => self.registry.scope(&book),
            None => BookScope::new("", book_name),
        }
    }

    async fn resolve_book(&self, user_id: &str, book_name: &str) -> Option<Book> {
        if let Some(book) = self.registry.find_by_name(book_name) {
            return Some(book);
        }
        let wanted = normalize_segment(book_name);
        match self.cloud.list_books_for_user(user_id).await {
            Ok(books) => books
                .into_iter()
                .find(|b| normalize_segment(&b.name) == wanted),
            Err(e) => {
                log::warn!("Book lookup for {} failed: {}", book_name, e);
                None
            }
        }
    }

    /// Aggregate slice, then highlights and evaluations from their tables.
    async fn pull_chapter(
        &self,
        user_id: &str,
        book: &Book,
        chapter_name: &str,
    ) -> Result<(), CloudError> {
        if let Some(aggregate) = self.cloud.fetch_book_aggregate(user_id, &book.id).await? {
            let restored = self.books.restore_chapter(&aggregate, chapter_name);
            log::debug!("Restored {} entries for {}/{}", restored, book.name, chapter_name);
        }

        let highlights = self
            .cloud
            .query_highlights(user_id, Some(&book.id), Some(chapter_name))
            .await?;
        if !highlights.is_empty() {
            let local: Vec<LocalHighlight> = highlights.iter().map(Highlight::to_local).collect();
            if let Err(e) = self
                .cache
                .set_json(&highlights_key(&book.name, chapter_name), &local)
            {
                log::warn!("Failed to cache highlights: {}", e);
            }
        }

        let evaluations = self
            .cloud
            .query_exam_evaluations(user_id, Some(&book.id), Some(chapter_name))
            .await?;
        if !evaluations.is_empty() {
            let reports: Vec<&Value> = evaluations.iter().map(|e| &e.evaluation_data).collect();
            if let Err(e) = self
                .cache
                .set_json(&evaluation_reports_key(&book.name, chapter_name), &reports)
            {
                log::warn!("Failed to cache evaluations: {}", e);
            }
        }
        Ok(())
    }

    /// Count the chapter's cached entries and return the large ones.
    fn classify_chapter(
        &self,
        scope: &BookScope,
        chapter_name: &str,
        result: &mut ChapterDataResult,
    ) -> Vec<(String, usize)> {
        let mut large = Vec::new();
        let mut total = 0;

        for key in self
            .cache
            .list_keys(|k| self.matcher.belongs_to_chapter(k, scope, chapter_name))
        {
            let size = self.cache.estimate_size(&key);
            total += size;

            match classify(&key) {
                EntryKind::Highlights => {
                    result.highlight_count += self
                        .cache
                        .get_value(&key)
                        .as_ref()
                        .and_then(Value::as_array)
                        .map_or(0, Vec::len);
                }
                EntryKind::Template => result.template_count += 1,
                EntryKind::CustomTab => result.custom_tab_count += 1,
                EntryKind::Exam => result.exam_data_count += 1,
                EntryKind::Other => {}
            }

            if size <= self.large_threshold {
                result.small_entries += 1;
            } else {
                result.large_entries += 1;
                large.push((key, size));
            }
        }

        result.total_size_kb = (total + 512) / 1024;
        large
    }

    fn finish_local(
        &self,
        scope: &BookScope,
        chapter_name: &str,
        message: &str,
        result: &mut ChapterDataResult,
    ) {
        self.classify_chapter(scope, chapter_name, result);
        self.notify(LoadingProgress::new(LoadPhase::Complete, 100, message));
    }
}

impl std::fmt::Debug for ChapterLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChapterLoader")
            .field("state", &self.current_state())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastCoordinator;
    use crate::cloud::{MemoryCloud, NewBook, NewChapter};
    use crate::identity::SessionIdentity;
    use crate::keys::SegmentKeyMatcher;
    use crate::sync::debounce::Debouncer;
    use serde_json::json;
    use std::time::Duration;

    struct Device {
        cache: LocalCache,
        books: BookSyncService,
        loader: ChapterLoader,
    }

    fn device(cloud: &Arc<MemoryCloud>, identity: &Arc<SessionIdentity>, threshold: usize) -> Device {
        let cache = LocalCache::in_memory();
        let matcher: Arc<dyn KeyMatcher> = Arc::new(SegmentKeyMatcher);
        let books = BookSyncService::new(
            cache.clone(),
            Arc::clone(cloud) as Arc<dyn CloudStore>,
            Arc::clone(identity) as Arc<dyn IdentityProvider>,
            BroadcastCoordinator::start(BroadcastCoordinator::generate_tab_id(), "test", Vec::new()),
            Arc::clone(&matcher),
            Debouncer::new(),
            Duration::from_millis(1000),
        );
        let loader = ChapterLoader::new(
            cache.clone(),
            books.clone(),
            Arc::clone(cloud) as Arc<dyn CloudStore>,
            Arc::clone(identity) as Arc<dyn IdentityProvider>,
            matcher,
            threshold,
        );
        Device {
            cache,
            books,
            loader,
        }
    }

    fn record(loader: &ChapterLoader) -> (Arc<Mutex<Vec<LoadingProgress>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = loader.subscribe(move |p| sink.lock().unwrap().push(p.clone()));
        (seen, sub)
    }

    #[tokio::test]
    async fn test_missing_aggregate_completes_empty() {
        let cloud = Arc::new(MemoryCloud::new());
        let identity = Arc::new(SessionIdentity::signed_in("u1"));
        let d = device(&cloud, &identity, 100 * 1024);
        let (seen, _sub) = record(&d.loader);

        let result = d.loader.load_chapter_data("Physics", "Mechanics").await;
        assert!(result.success);
        assert_eq!(result.small_entries + result.large_entries, 0);

        let state = d.loader.current_state();
        assert_eq!(state.phase, LoadPhase::Complete);
        assert!(state.small_files_loaded);
        assert!(!state.background_files_loading);

        let phases: Vec<LoadPhase> = seen.lock().unwrap().iter().map(|p| p.phase).collect();
        assert_eq!(phases.first(), Some(&LoadPhase::CloudSync));
        assert_eq!(phases.last(), Some(&LoadPhase::Complete));
    }

    #[tokio::test]
    async fn test_pulls_chapter_slice_and_defers_large_entries() {
        let cloud = Arc::new(MemoryCloud::new());
        let identity = Arc::new(SessionIdentity::signed_in("u1"));
        let a = device(&cloud, &identity, 64);
        let (book, _) = a
            .books
            .create_book(NewBook {
                name: "Physics".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        a.books
            .add_chapter(&book.id, NewChapter { number: 1, name: "Mechanics".into() })
            .await
            .unwrap();
        a.books
            .save_content(&book.id, "Physics", "Mechanics", "FLASHCARD", &json!([{"q": "F=ma?"}]))
            .await
            .unwrap();
        a.books
            .save_content(&book.id, "Physics", "Mechanics", "NOTES", &json!("x".repeat(500)))
            .await
            .unwrap();
        a.books
            .save_content(&book.id, "Physics", "Optics", "NOTES", &json!("lens"))
            .await
            .unwrap();

        let b = device(&cloud, &identity, 64);
        let (seen, _sub) = record(&b.loader);
        let result = b.loader.load_chapter_data("Physics", "Mechanics").await;

        assert_eq!(result.template_count, 2);
        assert_eq!(result.small_entries, 1);
        assert_eq!(result.large_entries, 1);
        assert!(b.cache.contains("FLASHCARD_Physics_Mechanics"));
        assert!(!b.cache.contains("NOTES_Physics_Optics"));

        let ready = b.loader.current_state();
        assert!(ready.small_files_loaded);

        b.loader.wait_for_background().await;
        assert!(b.loader.background_idle());
        let done = b.loader.current_state();
        assert_eq!(done.phase, LoadPhase::Complete);
        assert!(!done.background_files_loading);
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.phase == LoadPhase::BackgroundSync && p.small_files_loaded));
    }

    #[tokio::test]
    async fn test_offline_falls_back_to_cache() {
        let cloud = Arc::new(MemoryCloud::new());
        let identity = Arc::new(SessionIdentity::signed_in("u1"));
        let d = device(&cloud, &identity, 1024);
        d.cache
            .set_json("highlights_Biology_Cells", &json!([{"text": "a", "position": {"start": 0, "end": 1}}]))
            .unwrap();
        d.books
            .create_book(NewBook {
                name: "Biology".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        cloud.set_offline(true);
        let result = d.loader.load_chapter_data("Biology", "Cells").await;
        assert!(result.success);
        assert!(result.error.is_some());
        assert_eq!(result.highlight_count, 1);
        assert_eq!(d.loader.current_state().phase, LoadPhase::Complete);
    }

    #[tokio::test]
    async fn test_entry_at_threshold_counts_as_small() {
        let cloud = Arc::new(MemoryCloud::new());
        let identity = Arc::new(SessionIdentity::signed_in("u1"));
        let d = device(&cloud, &identity, "[1,2,3]".len());
        d.books
            .create_book(NewBook {
                name: "Biology".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        d.cache.set_json("FLASHCARD_Biology_Cells", &json!([1, 2, 3])).unwrap();
        d.cache.set_json("QA_Biology_Cells", &json!([1, 2, 3, 4])).unwrap();

        cloud.set_offline(true);
        let result = d.loader.load_chapter_data("Biology", "Cells").await;
        assert_eq!(result.small_entries, 1);
        assert_eq!(result.large_entries, 1);
        d.loader.wait_for_background().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_callbacks() {
        let cloud = Arc::new(MemoryCloud::new());
        let identity = Arc::new(SessionIdentity::new(None));
        let d = device(&cloud, &identity, 1024);

        let (seen, sub) = record(&d.loader);
        d.loader.load_chapter_data("Physics", "Mechanics").await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(d.loader.listener_count(), 1);

        sub.unsubscribe();
        d.loader.load_chapter_data("Physics", "Mechanics").await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(d.loader.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_force_refresh_restores_from_cloud() {
        let cloud = Arc::new(MemoryCloud::new());
        let identity = Arc::new(SessionIdentity::signed_in("u1"));
        let d = device(&cloud, &identity, 1024);
        let (book, _) = d
            .books
            .create_book(NewBook {
                name: "Physics".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        d.books
            .save_content(&book.id, "Physics", "Mechanics", "MCQ", &json!([1]))
            .await
            .unwrap();
        // Local-only drift that the refresh must discard.
        d.cache.set_json("QA_Physics_Mechanics", &json!(["stale"])).unwrap();

        let result = d.loader.force_refresh_chapter("Physics", "Mechanics").await;
        assert!(result.success);
        assert!(d.cache.contains("MCQ_Physics_Mechanics"));
        assert!(!d.cache.contains("QA_Physics_Mechanics"));
    }
}

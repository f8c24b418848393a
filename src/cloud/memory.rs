use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::models::{Book, BookAggregate, Chapter, ContentMap, ExamEvaluation, Highlight};
use super::store::{BlobStore, CloudError, CloudStore};

#[derive(Default)]
struct CloudState {
    // (user, book id)
    books: HashMap<(String, String), BookAggregate>,
    highlights: HashMap<String, BTreeMap<String, Highlight>>,
    evaluations: HashMap<String, BTreeMap<String, ExamEvaluation>>,
    // (user, path)
    blobs: HashMap<(String, String), Vec<u8>>,
}

/// Cloud backend kept entirely in memory.
///
/// Used by the CLI when no remote is configured and by tests, which can
/// take it offline and count writes.
#[derive(Default)]
pub struct MemoryCloud {
    state: Mutex<CloudState>,
    offline: AtomicBool,
    aggregate_writes: AtomicUsize,
    blob_uploads: AtomicUsize,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn aggregate_writes(&self) -> usize {
        self.aggregate_writes.load(Ordering::SeqCst)
    }

    pub fn blob_uploads(&self) -> usize {
        self.blob_uploads.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), CloudError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CloudError::Network("cloud unreachable".to_string()));
        }
        Ok(())
    }

    fn check_user(user_id: &str) -> Result<(), CloudError> {
        if user_id.is_empty() {
            return Err(CloudError::Unauthenticated);
        }
        Ok(())
    }

    fn guard(&self, user_id: &str) -> Result<(), CloudError> {
        self.check_online()?;
        Self::check_user(user_id)
    }
}

fn scoped<'a, T: 'a>(
    rows: impl Iterator<Item = &'a T>,
    book_id: Option<&str>,
    chapter_id: Option<&str>,
    key: impl Fn(&T) -> (&str, &str),
) -> Vec<T>
where
    T: Clone,
{
    rows.filter(|row| {
        let (book, chapter) = key(row);
        book_id.map_or(true, |b| b == book) && chapter_id.map_or(true, |c| c == chapter)
    })
    .cloned()
    .collect()
}

#[async_trait]
impl CloudStore for MemoryCloud {
    async fn upsert_book_aggregate(
        &self,
        user_id: &str,
        book: &Book,
        chapters: &[Chapter],
        content: &ContentMap,
    ) -> Result<(), CloudError> {
        self.guard(user_id)?;
        let aggregate = BookAggregate {
            book: book.clone(),
            chapters: chapters.to_vec(),
            content: content.clone(),
            last_synced: Some(Utc::now()),
        };
        self.state
            .lock()
            .unwrap()
            .books
            .insert((user_id.to_string(), book.id.clone()), aggregate);
        self.aggregate_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_book_aggregate(
        &self,
        user_id: &str,
        book_id: &str,
    ) -> Result<Option<BookAggregate>, CloudError> {
        self.guard(user_id)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .books
            .get(&(user_id.to_string(), book_id.to_string()))
            .cloned())
    }

    async fn list_books_for_user(&self, user_id: &str) -> Result<Vec<Book>, CloudError> {
        self.guard(user_id)?;
        let state = self.state.lock().unwrap();
        let mut books: Vec<Book> = state
            .books
            .iter()
            .filter(|((owner, _), _)| owner == user_id)
            .map(|(_, agg)| agg.book.clone())
            .collect();
        books.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(books)
    }

    async fn delete_book_aggregate(&self, user_id: &str, book_id: &str) -> Result<(), CloudError> {
        self.guard(user_id)?;
        self.state
            .lock()
            .unwrap()
            .books
            .remove(&(user_id.to_string(), book_id.to_string()));
        Ok(())
    }

    async fn upsert_highlight(&self, user_id: &str, highlight: &Highlight) -> Result<(), CloudError> {
        self.guard(user_id)?;
        self.state
            .lock()
            .unwrap()
            .highlights
            .entry(user_id.to_string())
            .or_default()
            .insert(highlight.id.clone(), highlight.clone());
        Ok(())
    }

    async fn query_highlights(
        &self,
        user_id: &str,
        book_id: Option<&str>,
        chapter_id: Option<&str>,
    ) -> Result<Vec<Highlight>, CloudError> {
        self.guard(user_id)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .highlights
            .get(user_id)
            .map(|rows| {
                scoped(rows.values(), book_id, chapter_id, |h: &Highlight| {
                    (h.book_id.as_str(), h.chapter_id.as_str())
                })
            })
            .unwrap_or_default())
    }

    async fn delete_highlight(&self, user_id: &str, highlight_id: &str) -> Result<(), CloudError> {
        self.guard(user_id)?;
        if let Some(rows) = self.state.lock().unwrap().highlights.get_mut(user_id) {
            rows.remove(highlight_id);
        }
        Ok(())
    }

    async fn upsert_exam_evaluation(
        &self,
        user_id: &str,
        evaluation: &ExamEvaluation,
    ) -> Result<(), CloudError> {
        self.guard(user_id)?;
        self.state
            .lock()
            .unwrap()
            .evaluations
            .entry(user_id.to_string())
            .or_default()
            .insert(evaluation.id.clone(), evaluation.clone());
        Ok(())
    }

    async fn query_exam_evaluations(
        &self,
        user_id: &str,
        book_id: Option<&str>,
        chapter_id: Option<&str>,
    ) -> Result<Vec<ExamEvaluation>, CloudError> {
        self.guard(user_id)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .evaluations
            .get(user_id)
            .map(|rows| {
                scoped(rows.values(), book_id, chapter_id, |e: &ExamEvaluation| {
                    (e.book_id.as_str(), e.chapter_id.as_str())
                })
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl BlobStore for MemoryCloud {
    async fn upload_blob(&self, user_id: &str, path: &str, body: &[u8]) -> Result<(), CloudError> {
        self.guard(user_id)?;
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert((user_id.to_string(), path.to_string()), body.to_vec());
        self.blob_uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn download_blob(&self, user_id: &str, path: &str) -> Result<Option<Vec<u8>>, CloudError> {
        self.guard(user_id)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .blobs
            .get(&(user_id.to_string(), path.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::models::{HighlightPosition, NewBook};

    fn highlight(id: &str, book: &str, chapter: &str) -> Highlight {
        let now = Utc::now();
        Highlight {
            id: id.to_string(),
            book_id: book.to_string(),
            chapter_id: chapter.to_string(),
            text: "text".to_string(),
            color: "yellow".to_string(),
            position: HighlightPosition { start: 0, end: 4 },
            note: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_rows_are_scoped_per_user() {
        let cloud = MemoryCloud::new();
        let book = Book::new(NewBook {
            name: "Physics".to_string(),
            ..Default::default()
        });
        cloud
            .upsert_book_aggregate("alice", &book, &[], &ContentMap::new())
            .await
            .unwrap();
        cloud.upsert_highlight("alice", &highlight("h1", "b1", "Optics")).await.unwrap();
        cloud.upsert_highlight("alice", &highlight("h2", "b1", "Waves")).await.unwrap();

        assert_eq!(cloud.list_books_for_user("alice").await.unwrap().len(), 1);
        assert!(cloud.list_books_for_user("bob").await.unwrap().is_empty());
        assert!(cloud.fetch_book_aggregate("bob", &book.id).await.unwrap().is_none());

        let optics = cloud
            .query_highlights("alice", Some("b1"), Some("Optics"))
            .await
            .unwrap();
        assert_eq!(optics.len(), 1);
        assert_eq!(cloud.query_highlights("alice", None, None).await.unwrap().len(), 2);
        assert!(cloud.query_highlights("bob", None, None).await.unwrap().is_empty());

        cloud.delete_highlight("bob", "h1").await.unwrap();
        cloud.delete_highlight("alice", "h1").await.unwrap();
        assert_eq!(cloud.query_highlights("alice", None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_and_unauthenticated() {
        let cloud = MemoryCloud::new();
        assert!(matches!(
            cloud.list_books_for_user("").await,
            Err(CloudError::Unauthenticated)
        ));

        cloud.set_offline(true);
        assert!(matches!(
            cloud.download_blob("alice", "p").await,
            Err(CloudError::Network(_))
        ));
        cloud.set_offline(false);
        assert!(cloud.download_blob("alice", "p").await.unwrap().is_none());
    }
}

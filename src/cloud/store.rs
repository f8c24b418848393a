use async_trait::async_trait;
use thiserror::Error;

use super::models::{Book, BookAggregate, Chapter, ContentMap, ExamEvaluation, Highlight};

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Not authenticated")]
    Unauthenticated,
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Remote store for book aggregates and the normalized tables.
///
/// Every call is scoped to one user; implementations must never return
/// another user's rows.
#[async_trait]
pub trait CloudStore: Send + Sync {
    async fn upsert_book_aggregate(
        &self,
        user_id: &str,
        book: &Book,
        chapters: &[Chapter],
        content: &ContentMap,
    ) -> Result<(), CloudError>;

    async fn fetch_book_aggregate(
        &self,
        user_id: &str,
        book_id: &str,
    ) -> Result<Option<BookAggregate>, CloudError>;

    /// Books of the user, most recently updated first.
    async fn list_books_for_user(&self, user_id: &str) -> Result<Vec<Book>, CloudError>;

    async fn delete_book_aggregate(&self, user_id: &str, book_id: &str) -> Result<(), CloudError>;

    async fn upsert_highlight(&self, user_id: &str, highlight: &Highlight) -> Result<(), CloudError>;

    async fn query_highlights(
        &self,
        user_id: &str,
        book_id: Option<&str>,
        chapter_id: Option<&str>,
    ) -> Result<Vec<Highlight>, CloudError>;

    async fn delete_highlight(&self, user_id: &str, highlight_id: &str) -> Result<(), CloudError>;

    async fn upsert_exam_evaluation(
        &self,
        user_id: &str,
        evaluation: &ExamEvaluation,
    ) -> Result<(), CloudError>;

    async fn query_exam_evaluations(
        &self,
        user_id: &str,
        book_id: Option<&str>,
        chapter_id: Option<&str>,
    ) -> Result<Vec<ExamEvaluation>, CloudError>;
}

/// Object storage for per-user blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload_blob(&self, user_id: &str, path: &str, body: &[u8]) -> Result<(), CloudError>;

    /// `None` when nothing has been uploaded yet.
    async fn download_blob(&self, user_id: &str, path: &str) -> Result<Option<Vec<u8>>, CloudError>;
}

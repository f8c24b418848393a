//! Cross-context change notifications.
//!
//! A [`SyncEvent`] tells other tabs that local data changed. Events only
//! invalidate; receivers re-read the cache rather than trusting the payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What changed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    /// A piece of chapter content was written.
    ContentSaved,
    /// A template editor replaced its whole set (flashcards, Q&A, ...).
    TemplateUpdated,
    /// A new book appeared in the registry.
    BookCreated,
    /// Book metadata or its aggregate changed.
    BookUpdated,
    /// A chapter was appended to a book.
    ChapterAdded,
    /// A full push or pull finished.
    SyncComplete,
}

/// A change notification as it travels over every transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    #[serde(rename = "type")]
    pub event_type: SyncEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_id: Option<String>,
    pub book_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Sending context. Stamped by the coordinator.
    #[serde(default)]
    pub tab_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl SyncEvent {
    pub fn new(event_type: SyncEventType, book_name: impl Into<String>) -> Self {
        Self {
            event_type,
            book_id: None,
            book_name: book_name.into(),
            chapter_name: None,
            content_type: None,
            timestamp: Utc::now(),
            tab_id: String::new(),
            origin: None,
        }
    }

    pub fn content_saved(
        book_id: &str,
        book_name: &str,
        chapter_name: &str,
        content_type: &str,
    ) -> Self {
        Self::new(SyncEventType::ContentSaved, book_name)
            .with_book_id(book_id)
            .with_chapter(chapter_name)
            .with_content_type(content_type)
    }

    pub fn template_updated(
        book_id: &str,
        book_name: &str,
        chapter_name: &str,
        content_type: &str,
    ) -> Self {
        Self::new(SyncEventType::TemplateUpdated, book_name)
            .with_book_id(book_id)
            .with_chapter(chapter_name)
            .with_content_type(content_type)
    }

    pub fn with_book_id(mut self, book_id: &str) -> Self {
        self.book_id = Some(book_id.to_string());
        self
    }

    pub fn with_chapter(mut self, chapter_name: &str) -> Self {
        self.chapter_name = Some(chapter_name.to_string());
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    /// Identity of one emission. The same event relayed over several
    /// transports has the same fingerprint.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{:?}|{}|{}|{}|{}",
            self.tab_id,
            self.event_type,
            self.timestamp.timestamp_nanos_opt().unwrap_or_default(),
            self.book_id.as_deref().unwrap_or(""),
            self.chapter_name.as_deref().unwrap_or(""),
            self.content_type.as_deref().unwrap_or(""),
        )
    }
}

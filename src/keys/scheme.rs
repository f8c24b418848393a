//! Local key scheme for book content.
//!
//! Every piece of study content lives under a key of the form
//! `contentType_book_chapter[_tabId]`. Book and chapter names are
//! normalized so that runs of whitespace become a single `_`.

use std::fmt;

/// Segment separator used in every composite key.
pub const SEPARATOR: char = '_';

/// Registry of books created on this device.
pub const BOOKS_KEY: &str = "createdBooks";
/// Timestamp of the last completed startup sync.
pub const LAST_SYNC_KEY: &str = "lastSyncTime";
/// Transient key written by the storage-signal broadcast transport.
pub const SYNC_EVENT_KEY: &str = "sync_event";

pub const HIGHLIGHTS_PREFIX: &str = "highlights_";
pub const CUSTOM_TAB_PREFIX: &str = "customtab_";
pub const QUESTION_PAPERS_PREFIX: &str = "questionPapers_";
pub const EVALUATION_REPORTS_PREFIX: &str = "evaluationReports_";
pub const CHAPTERS_PREFIX: &str = "chapters_";
pub const USER_DATA_PREFIX: &str = "userData_";

/// Canonical template content types.
pub mod content_types {
    pub const FLASHCARD: &str = "FLASHCARD";
    pub const MCQ: &str = "MCQ";
    pub const QA: &str = "QA";
    pub const NOTES: &str = "NOTES";
    pub const MINDMAP: &str = "MINDMAP";
    pub const VIDEOS: &str = "VIDEOS";

    pub const ALL: [&str; 6] = [FLASHCARD, MCQ, QA, NOTES, MINDMAP, VIDEOS];
}

/// Normalize a book or chapter name into a key segment.
///
/// Leading and trailing whitespace is dropped and every inner run of
/// whitespace collapses to one separator.
pub fn normalize_segment(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join("_")
}

/// Key of the per-book chapter list.
pub fn chapters_key(book_id: &str) -> String {
    format!("{}{}", CHAPTERS_PREFIX, book_id)
}

/// Local key holding a user's blob copy.
pub fn user_data_key(user_id: &str) -> String {
    format!("{}{}", USER_DATA_PREFIX, user_id)
}

/// Key of a chapter's highlight list.
pub fn highlights_key(book_name: &str, chapter_name: &str) -> String {
    format!(
        "{}{}_{}",
        HIGHLIGHTS_PREFIX,
        normalize_segment(book_name),
        normalize_segment(chapter_name)
    )
}

/// Key of a chapter's exam evaluation reports.
pub fn evaluation_reports_key(book_name: &str, chapter_name: &str) -> String {
    format!(
        "{}{}_{}",
        EVALUATION_REPORTS_PREFIX,
        normalize_segment(book_name),
        normalize_segment(chapter_name)
    )
}

/// Keys that never belong to a single book.
pub fn is_global_key(key: &str) -> bool {
    key == BOOKS_KEY
        || key == LAST_SYNC_KEY
        || key == SYNC_EVENT_KEY
        || key.starts_with(USER_DATA_PREFIX)
}

/// Where a fallback read found its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTier {
    Tab,
    Base,
}

/// A parsed content key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentKey {
    content_type: String,
    book: String,
    chapter: String,
    tab_id: Option<String>,
}

impl ContentKey {
    pub fn new(content_type: &str, book_name: &str, chapter_name: &str) -> Self {
        Self {
            content_type: content_type.trim().to_string(),
            book: normalize_segment(book_name),
            chapter: normalize_segment(chapter_name),
            tab_id: None,
        }
    }

    /// Scope the key to one tab. Blank ids leave the key unscoped.
    pub fn with_tab(mut self, tab_id: Option<&str>) -> Self {
        self.tab_id = tab_id
            .map(normalize_segment)
            .filter(|t| !t.is_empty());
        self
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn tab_id(&self) -> Option<&str> {
        self.tab_id.as_deref()
    }

    /// The key without a tab suffix.
    pub fn base(&self) -> String {
        format!("{}_{}_{}", self.content_type, self.book, self.chapter)
    }

    /// Keys to try on read, most specific first.
    pub fn candidates(&self) -> Vec<(KeyTier, String)> {
        let mut keys = Vec::with_capacity(2);
        if self.tab_id.is_some() {
            keys.push((KeyTier::Tab, self.to_string()));
        }
        keys.push((KeyTier::Base, self.base()));
        keys
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tab_id {
            Some(tab) => write!(f, "{}_{}", self.base(), tab),
            None => f.write_str(&self.base()),
        }
    }
}

/// Build the key for a piece of content.
pub fn content_key(
    content_type: &str,
    book_name: &str,
    chapter_name: &str,
    tab_id: Option<&str>,
) -> String {
    ContentKey::new(content_type, book_name, chapter_name)
        .with_tab(tab_id)
        .to_string()
}

/// Walk the fallback chain, returning the first value `lookup` yields.
pub fn resolve_with_fallback<T, F>(key: &ContentKey, mut lookup: F) -> Option<(KeyTier, T)>
where
    F: FnMut(&str) -> Option<T>,
{
    key.candidates()
        .into_iter()
        .find_map(|(tier, k)| lookup(&k).map(|v| (tier, v)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize_segment("Physics"), "Physics");
        assert_eq!(normalize_segment("Organic  Chemistry\tII"), "Organic_Chemistry_II");
        assert_eq!(normalize_segment("  padded name "), "padded_name");
        assert_eq!(normalize_segment(""), "");
    }

    #[test]
    fn test_content_key_shapes() {
        assert_eq!(
            content_key("FLASHCARD", "Physics", "Mechanics", None),
            "FLASHCARD_Physics_Mechanics"
        );
        assert_eq!(
            content_key("NOTES", "Organic Chemistry", "Alkanes and Alkenes", Some("tab7")),
            "NOTES_Organic_Chemistry_Alkanes_and_Alkenes_tab7"
        );
        assert_eq!(
            content_key("MCQ", "Physics", "Optics", Some("  ")),
            "MCQ_Physics_Optics"
        );
    }

    #[test]
    fn test_fallback_prefers_tab_key() {
        let mut store = HashMap::new();
        store.insert("QA_Bio_Cells".to_string(), "base");
        store.insert("QA_Bio_Cells_t1".to_string(), "tab");

        let key = ContentKey::new("QA", "Bio", "Cells").with_tab(Some("t1"));
        let found = resolve_with_fallback(&key, |k| store.get(k).copied());
        assert_eq!(found, Some((KeyTier::Tab, "tab")));

        let other_tab = ContentKey::new("QA", "Bio", "Cells").with_tab(Some("t2"));
        let found = resolve_with_fallback(&other_tab, |k| store.get(k).copied());
        assert_eq!(found, Some((KeyTier::Base, "base")));

        let missing = ContentKey::new("QA", "Bio", "Genetics").with_tab(Some("t1"));
        assert!(resolve_with_fallback(&missing, |k| store.get(k).copied()).is_none());
    }

    #[test]
    fn test_global_keys() {
        assert!(is_global_key(BOOKS_KEY));
        assert!(is_global_key("userData_42"));
        assert!(!is_global_key("chapters_abc"));
        assert_eq!(chapters_key("abc"), "chapters_abc");
        assert_eq!(highlights_key("Physics II", "Waves"), "highlights_Physics_II_Waves");
    }
}

use super::scheme::{chapters_key, is_global_key, normalize_segment, SEPARATOR};

/// Decides which local keys belong to a book or chapter.
///
/// Key ownership is heuristic because the key scheme is flat. Implementations
/// must be pure so the same key always lands in the same aggregate.
pub trait KeyMatcher: Send + Sync {
    fn belongs_to_book(&self, key: &str, book: &BookScope) -> bool;

    fn belongs_to_chapter(&self, key: &str, book: &BookScope, chapter_name: &str) -> bool;
}

/// A book as seen by a [`KeyMatcher`].
#[derive(Debug, Clone)]
pub struct BookScope {
    id: String,
    segment: String,
    rivals: Vec<String>,
}

impl BookScope {
    pub fn new(book_id: &str, book_name: &str) -> Self {
        Self {
            id: book_id.to_string(),
            segment: normalize_segment(book_name),
            rivals: Vec::new(),
        }
    }

    /// Register the names of the other books on this device. A longer name
    /// that contains this book's name claims its keys first.
    pub fn with_known_names<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        for name in names {
            let segment = normalize_segment(name);
            if segment.len() > self.segment.len()
                && segment.contains(&self.segment)
                && !self.rivals.contains(&segment)
            {
                self.rivals.push(segment);
            }
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }
}

/// Matches names only on whole `_`-delimited segments.
#[derive(Debug, Default, Clone, Copy)]
pub struct SegmentKeyMatcher;

impl SegmentKeyMatcher {
    /// Byte offsets just past every unshadowed mention of the book.
    fn book_ends(&self, key: &str, book: &BookScope) -> Vec<usize> {
        let mut ends = Vec::new();
        if !book.id.is_empty() {
            ends.extend(bounded(key, &book.id).map(|p| p + book.id.len()));
        }
        if !book.segment.is_empty() {
            for start in bounded(key, &book.segment) {
                let end = start + book.segment.len();
                let shadowed = book.rivals.iter().any(|rival| {
                    bounded(key, rival).any(|rs| rs <= start && rs + rival.len() >= end)
                });
                if !shadowed {
                    ends.push(end);
                }
            }
        }
        ends
    }
}

impl KeyMatcher for SegmentKeyMatcher {
    fn belongs_to_book(&self, key: &str, book: &BookScope) -> bool {
        if is_global_key(key) {
            return false;
        }
        if key == chapters_key(&book.id) {
            return true;
        }
        !self.book_ends(key, book).is_empty()
    }

    fn belongs_to_chapter(&self, key: &str, book: &BookScope, chapter_name: &str) -> bool {
        if is_global_key(key) {
            return false;
        }
        let chapter = normalize_segment(chapter_name);
        if chapter.is_empty() {
            return false;
        }
        self.book_ends(key, book)
            .into_iter()
            .any(|end| bounded(&key[end..], &chapter).next().is_some())
    }
}

/// Start offsets where `needle` sits between separators. The key's first
/// segment is its content type and never counts.
fn bounded<'a>(haystack: &'a str, needle: &'a str) -> impl Iterator<Item = usize> + 'a {
    let bytes = haystack.as_bytes();
    let sep = SEPARATOR as u8;
    haystack.match_indices(needle).filter_map(move |(start, _)| {
        let end = start + needle.len();
        let opens = start > 0 && bytes[start - 1] == sep;
        let closes = end == bytes.len() || bytes[end] == sep;
        (opens && closes).then_some(start)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(name: &str, known: &[&str]) -> BookScope {
        BookScope::new("b1", name).with_known_names(known.iter().copied())
    }

    #[test]
    fn test_whole_segment_matching() {
        let m = SegmentKeyMatcher;
        let physics = scope("Physics", &[]);

        assert!(m.belongs_to_book("FLASHCARD_Physics_Mechanics", &physics));
        assert!(m.belongs_to_book("flashcards_Physics", &physics));
        assert!(m.belongs_to_book("highlights_Physics_Optics", &physics));
        assert!(!m.belongs_to_book("FLASHCARD_Astrophysics_Stars", &physics));
        assert!(!m.belongs_to_book("FLASHCARD_Physicsx_Stars", &physics));
        assert!(!m.belongs_to_book("Physics", &physics));
    }

    #[test]
    fn test_longer_book_name_wins() {
        let m = SegmentKeyMatcher;
        let names = ["Physics", "Physics II"];
        let physics = scope("Physics", &names);
        let physics_two = BookScope::new("b2", "Physics II").with_known_names(names);

        let key = "NOTES_Physics_II_Waves";
        assert!(!m.belongs_to_book(key, &physics));
        assert!(m.belongs_to_book(key, &physics_two));
        assert!(m.belongs_to_book("NOTES_Physics_Waves", &physics));
    }

    #[test]
    fn test_book_id_and_chapter_list() {
        let m = SegmentKeyMatcher;
        let book = BookScope::new("book_123", "Chemistry");

        assert!(m.belongs_to_book("chapters_book_123", &book));
        assert!(m.belongs_to_book("subtopics_book_123_ch1", &book));
        assert!(!m.belongs_to_book("createdBooks", &book));
        assert!(!m.belongs_to_book("userData_book_123", &book));
    }

    #[test]
    fn test_chapter_matching() {
        let m = SegmentKeyMatcher;
        let book = scope("Organic Chemistry", &[]);

        assert!(m.belongs_to_chapter("MCQ_Organic_Chemistry_Alkanes", &book, "Alkanes"));
        assert!(m.belongs_to_chapter("MCQ_Organic_Chemistry_Alkanes_tab3", &book, "Alkanes"));
        assert!(m.belongs_to_chapter(
            "customtab_Summary_Organic_Chemistry_Alkanes",
            &book,
            "Alkanes"
        ));
        assert!(!m.belongs_to_chapter("MCQ_Organic_Chemistry_Alkenes", &book, "Alkanes"));
        assert!(!m.belongs_to_chapter("MCQ_Alkanes_Organic_Chemistry", &book, "Alkanes"));
    }
}

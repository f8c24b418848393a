use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const BOOK_FORMAT_VERSION: &str = "1.0.0";

/// Content entries of one book, keyed by local cache key.
pub type ContentMap = Map<String, Value>;

fn default_version() -> String {
    BOOK_FORMAT_VERSION.to_string()
}

/// Book metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub university: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semester: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_code: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub is_published: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a new book
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBook {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub creator_name: Option<String>,
    #[serde(default)]
    pub university: Option<String>,
    #[serde(default)]
    pub semester: Option<String>,
    #[serde(default)]
    pub subject_code: Option<String>,
}

impl Book {
    pub fn new(input: NewBook) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: input.name.trim().to_string(),
            description: input.description,
            creator_name: input.creator_name,
            university: input.university,
            semester: input.semester,
            subject_code: input.subject_code,
            version: default_version(),
            is_published: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A chapter within a book
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: String,
    pub book_id: String,
    pub number: u32,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChapter {
    pub number: u32,
    pub name: String,
}

impl Chapter {
    pub fn new(book_id: &str, input: NewChapter) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            book_id: book_id.to_string(),
            number: input.number,
            name: input.name.trim().to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One book as stored in the cloud: metadata, chapters and all content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookAggregate {
    pub book: Book,
    pub chapters: Vec<Chapter>,
    pub content: ContentMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HighlightPosition {
    pub start: i64,
    pub end: i64,
}

/// A highlight row. `chapter_id` holds the chapter's display name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Highlight {
    pub id: String,
    pub book_id: String,
    pub chapter_id: String,
    pub text: String,
    pub color: String,
    pub position: HighlightPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Highlight {
    /// Same visible highlight, ignoring ids and timestamps.
    pub fn same_content(&self, other: &LocalHighlight) -> bool {
        self.text == other.text
            && self.color == other.color
            && self.position == other.position
            && self.note == other.note
    }

    pub fn to_local(&self) -> LocalHighlight {
        LocalHighlight {
            id: Some(self.id.clone()),
            text: self.text.clone(),
            color: self.color.clone(),
            position: self.position,
            note: self.note.clone(),
            timestamp: Some(self.created_at),
            updated_at: Some(self.updated_at),
            extra: Map::new(),
        }
    }
}

/// A highlight as kept in the local cache list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalHighlight {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub text: String,
    #[serde(default = "default_color")]
    pub color: String,
    pub position: HighlightPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_color() -> String {
    "yellow".to_string()
}

impl LocalHighlight {
    /// Last time this entry changed locally.
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.timestamp)
    }

    pub fn to_row(&self, id: &str, book_id: &str, chapter_id: &str) -> Highlight {
        let created = self.timestamp.unwrap_or_else(Utc::now);
        Highlight {
            id: id.to_string(),
            book_id: book_id.to_string(),
            chapter_id: chapter_id.to_string(),
            text: self.text.clone(),
            color: self.color.clone(),
            position: self.position,
            note: self.note.clone(),
            created_at: created,
            updated_at: self.modified_at().unwrap_or(created),
        }
    }
}

/// A graded exam attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExamEvaluation {
    pub id: String,
    pub book_id: String,
    pub chapter_id: String,
    pub paper_title: String,
    pub evaluation_data: Value,
    pub total_marks: f64,
    pub obtained_marks: f64,
    pub percentage: f64,
    pub submitted_at: DateTime<Utc>,
}

impl ExamEvaluation {
    /// Build a row from a locally stored report. `None` when the report is
    /// not an object or has no id; reconciliation assigns ids first.
    pub fn from_local(report: &Value, book_id: &str, chapter_id: &str) -> Option<Self> {
        let obj = report.as_object()?;
        let id = match obj.get("id")? {
            Value::String(id) if !id.is_empty() => id.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let number = |field: &str| obj.get(field).and_then(Value::as_f64).unwrap_or(0.0);
        let submitted_at = obj
            .get("submittedAt")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Some(Self {
            id,
            book_id: book_id.to_string(),
            chapter_id: chapter_id.to_string(),
            paper_title: obj
                .get("paperTitle")
                .and_then(Value::as_str)
                .unwrap_or("Untitled paper")
                .to_string(),
            evaluation_data: report.clone(),
            total_marks: number("totalMarks"),
            obtained_marks: number("obtainedMarks"),
            percentage: number("percentage"),
            submitted_at,
        })
    }
}

/// Per-user blob document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserDataBlob {
    pub data: Map<String, Value>,
    pub metadata: BlobMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlobMetadata {
    pub last_modified: DateTime<Utc>,
    pub version: String,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_book_tolerates_missing_optional_fields() {
        let raw = json!({
            "id": "b1",
            "name": "Physics",
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-02T00:00:00Z"
        });
        let book: Book = serde_json::from_value(raw).unwrap();
        assert_eq!(book.version, BOOK_FORMAT_VERSION);
        assert!(!book.is_published);
        assert!(book.description.is_none());
    }

    #[test]
    fn test_local_highlight_keeps_unknown_fields() {
        let raw = json!({
            "text": "inertia",
            "position": {"start": 3, "end": 10},
            "pageHint": 4
        });
        let local: LocalHighlight = serde_json::from_value(raw).unwrap();
        assert_eq!(local.color, "yellow");
        assert_eq!(local.extra.get("pageHint"), Some(&json!(4)));

        let row = local.to_row("h1", "b1", "Mechanics");
        assert!(row.same_content(&local));
        assert_eq!(serde_json::to_value(&local).unwrap()["pageHint"], json!(4));
    }

    #[test]
    fn test_evaluation_from_local_report() {
        let report = json!({
            "id": "e1",
            "paperTitle": "Midterm",
            "totalMarks": 50,
            "obtainedMarks": 40,
            "percentage": 80.0,
            "submittedAt": "2024-03-01T10:00:00Z"
        });
        let eval = ExamEvaluation::from_local(&report, "b1", "Optics").unwrap();
        assert_eq!(eval.paper_title, "Midterm");
        assert_eq!(eval.total_marks, 50.0);
        assert_eq!(eval.evaluation_data, report);

        assert!(ExamEvaluation::from_local(&json!({"paperTitle": "x"}), "b1", "c").is_none());
    }
}

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::models::{
    Book, BookAggregate, Chapter, ContentMap, ExamEvaluation, Highlight, HighlightPosition,
};
use super::store::{BlobStore, CloudError, CloudStore};

const BLOB_BUCKET: &str = "user-data";

/// Table names on the database side.
///
/// The defaults match the hosted schema, which prefixes the per-user
/// tables with `user_`. Deployments with plain `books` and `highlights`
/// tables override them in the `[cloud.tables]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestTables {
    pub books: String,
    pub highlights: String,
    pub exam_evaluations: String,
}

impl Default for RestTables {
    fn default() -> Self {
        Self {
            books: "user_books".to_string(),
            highlights: "user_highlights".to_string(),
            exam_evaluations: "exam_evaluations".to_string(),
        }
    }
}

/// Client for a PostgREST-style database plus object storage.
pub struct RestCloudStore {
    client: Client,
    base_url: String,
    api_key: String,
    tables: RestTables,
    access_token: RwLock<Option<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BookRow {
    user_id: String,
    book_id: String,
    book_data: Book,
    chapters_data: Vec<Chapter>,
    content_data: ContentMap,
    #[serde(default)]
    last_synced: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct BookDataOnly {
    book_data: Book,
}

#[derive(Debug, Serialize, Deserialize)]
struct HighlightRow {
    id: String,
    user_id: String,
    book_id: String,
    chapter_id: String,
    text: String,
    color: String,
    position: HighlightPosition,
    note: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl HighlightRow {
    fn new(user_id: &str, h: &Highlight) -> Self {
        Self {
            id: h.id.clone(),
            user_id: user_id.to_string(),
            book_id: h.book_id.clone(),
            chapter_id: h.chapter_id.clone(),
            text: h.text.clone(),
            color: h.color.clone(),
            position: h.position,
            note: h.note.clone(),
            created_at: h.created_at,
            updated_at: h.updated_at,
        }
    }

    fn into_highlight(self) -> Highlight {
        Highlight {
            id: self.id,
            book_id: self.book_id,
            chapter_id: self.chapter_id,
            text: self.text,
            color: self.color,
            position: self.position,
            note: self.note,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EvaluationRow {
    id: String,
    user_id: String,
    book_id: String,
    chapter_id: String,
    paper_title: String,
    evaluation_data: Value,
    total_marks: f64,
    obtained_marks: f64,
    percentage: f64,
    submitted_at: DateTime<Utc>,
}

impl EvaluationRow {
    fn new(user_id: &str, e: &ExamEvaluation) -> Self {
        Self {
            id: e.id.clone(),
            user_id: user_id.to_string(),
            book_id: e.book_id.clone(),
            chapter_id: e.chapter_id.clone(),
            paper_title: e.paper_title.clone(),
            evaluation_data: e.evaluation_data.clone(),
            total_marks: e.total_marks,
            obtained_marks: e.obtained_marks,
            percentage: e.percentage,
            submitted_at: e.submitted_at,
        }
    }

    fn into_evaluation(self) -> ExamEvaluation {
        ExamEvaluation {
            id: self.id,
            book_id: self.book_id,
            chapter_id: self.chapter_id,
            paper_title: self.paper_title,
            evaluation_data: self.evaluation_data,
            total_marks: self.total_marks,
            obtained_marks: self.obtained_marks,
            percentage: self.percentage,
            submitted_at: self.submitted_at,
        }
    }
}

/// Build `col=eq.value&...` with values percent-encoded. `None` filters
/// are left out.
pub(crate) fn filter_query(filters: &[(&str, Option<&str>)]) -> String {
    filters
        .iter()
        .filter_map(|(col, value)| {
            value.map(|v| format!("{}=eq.{}", col, urlencoding::encode(v)))
        })
        .collect::<Vec<_>>()
        .join("&")
}

impl RestCloudStore {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, CloudError> {
        let base_url = base_url.trim_end_matches('/').to_string();

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(CloudError::InvalidUrl(
                "URL must start with http:// or https://".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.to_string(),
            tables: RestTables::default(),
            access_token: RwLock::new(None),
        })
    }

    pub fn with_tables(mut self, tables: RestTables) -> Self {
        self.tables = tables;
        self
    }

    /// Set the session token used for row-level access.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().unwrap() = token;
    }

    fn table_url(&self, table: &str, query: &str) -> String {
        if query.is_empty() {
            format!("{}/rest/v1/{}", self.base_url, table)
        } else {
            format!("{}/rest/v1/{}?{}", self.base_url, table, query)
        }
    }

    fn object_url(&self, path: &str) -> String {
        let encoded: Vec<String> = path
            .trim_start_matches('/')
            .split('/')
            .map(|seg| urlencoding::encode(seg).into_owned())
            .collect();
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url,
            BLOB_BUCKET,
            encoded.join("/")
        )
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let token = self
            .access_token
            .read()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.api_key.clone());
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(token)
    }

    async fn check(response: Response, what: &str) -> Result<Response, CloudError> {
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CloudError::Unauthenticated),
            StatusCode::NOT_FOUND => Err(CloudError::NotFound(what.to_string())),
            status if !status.is_success() => Err(CloudError::Server {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
            _ => Ok(response),
        }
    }

    async fn select<T: DeserializeOwned>(&self, table: &str, query: &str) -> Result<Vec<T>, CloudError> {
        let response = self
            .authorized(self.client.get(self.table_url(table, query)))
            .header("Accept", "application/json")
            .send()
            .await?;
        let response = Self::check(response, table).await?;
        Ok(response.json().await?)
    }

    async fn upsert<T: Serialize + ?Sized>(
        &self,
        table: &str,
        on_conflict: &str,
        row: &T,
    ) -> Result<(), CloudError> {
        let query = format!("on_conflict={}", on_conflict);
        let response = self
            .authorized(self.client.post(self.table_url(table, &query)))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[row])
            .send()
            .await?;
        Self::check(response, table).await?;
        Ok(())
    }
}

#[async_trait]
impl CloudStore for RestCloudStore {
    async fn upsert_book_aggregate(
        &self,
        user_id: &str,
        book: &Book,
        chapters: &[Chapter],
        content: &ContentMap,
    ) -> Result<(), CloudError> {
        let now = Utc::now();
        let row = BookRow {
            user_id: user_id.to_string(),
            book_id: book.id.clone(),
            book_data: book.clone(),
            chapters_data: chapters.to_vec(),
            content_data: content.clone(),
            last_synced: Some(now),
            updated_at: now,
        };
        self.upsert(&self.tables.books, "user_id,book_id", &row).await
    }

    async fn fetch_book_aggregate(
        &self,
        user_id: &str,
        book_id: &str,
    ) -> Result<Option<BookAggregate>, CloudError> {
        let query = format!(
            "select=*&{}",
            filter_query(&[("user_id", Some(user_id)), ("book_id", Some(book_id))])
        );
        let rows: Vec<BookRow> = self.select(&self.tables.books, &query).await?;
        Ok(rows.into_iter().next().map(|row| BookAggregate {
            book: row.book_data,
            chapters: row.chapters_data,
            content: row.content_data,
            last_synced: row.last_synced,
        }))
    }

    async fn list_books_for_user(&self, user_id: &str) -> Result<Vec<Book>, CloudError> {
        let query = format!(
            "select=book_data&{}&order=updated_at.desc",
            filter_query(&[("user_id", Some(user_id))])
        );
        let rows: Vec<BookDataOnly> = self.select(&self.tables.books, &query).await?;
        Ok(rows.into_iter().map(|r| r.book_data).collect())
    }

    async fn delete_book_aggregate(&self, user_id: &str, book_id: &str) -> Result<(), CloudError> {
        let query = filter_query(&[("user_id", Some(user_id)), ("book_id", Some(book_id))]);
        let response = self
            .authorized(self.client.delete(self.table_url(&self.tables.books, &query)))
            .send()
            .await?;
        Self::check(response, &self.tables.books).await?;
        Ok(())
    }

    async fn upsert_highlight(&self, user_id: &str, highlight: &Highlight) -> Result<(), CloudError> {
        self.upsert(&self.tables.highlights, "id", &HighlightRow::new(user_id, highlight))
            .await
    }

    async fn query_highlights(
        &self,
        user_id: &str,
        book_id: Option<&str>,
        chapter_id: Option<&str>,
    ) -> Result<Vec<Highlight>, CloudError> {
        let query = format!(
            "select=*&{}&order=created_at.asc",
            filter_query(&[
                ("user_id", Some(user_id)),
                ("book_id", book_id),
                ("chapter_id", chapter_id),
            ])
        );
        let rows: Vec<HighlightRow> = self.select(&self.tables.highlights, &query).await?;
        Ok(rows.into_iter().map(HighlightRow::into_highlight).collect())
    }

    async fn delete_highlight(&self, user_id: &str, highlight_id: &str) -> Result<(), CloudError> {
        let query = filter_query(&[("id", Some(highlight_id)), ("user_id", Some(user_id))]);
        let response = self
            .authorized(self.client.delete(self.table_url(&self.tables.highlights, &query)))
            .send()
            .await?;
        Self::check(response, &self.tables.highlights).await?;
        Ok(())
    }

    async fn upsert_exam_evaluation(
        &self,
        user_id: &str,
        evaluation: &ExamEvaluation,
    ) -> Result<(), CloudError> {
        self.upsert(
            &self.tables.exam_evaluations,
            "id,user_id",
            &EvaluationRow::new(user_id, evaluation),
        )
        .await
    }

    async fn query_exam_evaluations(
        &self,
        user_id: &str,
        book_id: Option<&str>,
        chapter_id: Option<&str>,
    ) -> Result<Vec<ExamEvaluation>, CloudError> {
        let query = format!(
            "select=*&{}&order=submitted_at.desc",
            filter_query(&[
                ("user_id", Some(user_id)),
                ("book_id", book_id),
                ("chapter_id", chapter_id),
            ])
        );
        let rows: Vec<EvaluationRow> = self.select(&self.tables.exam_evaluations, &query).await?;
        Ok(rows.into_iter().map(EvaluationRow::into_evaluation).collect())
    }
}

#[async_trait]
impl BlobStore for RestCloudStore {
    async fn upload_blob(&self, _user_id: &str, path: &str, body: &[u8]) -> Result<(), CloudError> {
        let response = self
            .authorized(self.client.post(self.object_url(path)))
            .header("x-upsert", "true")
            .header("Content-Type", "application/json")
            .body(body.to_vec())
            .send()
            .await?;
        Self::check(response, path).await?;
        Ok(())
    }

    async fn download_blob(&self, _user_id: &str, path: &str) -> Result<Option<Vec<u8>>, CloudError> {
        let response = self
            .authorized(self.client.get(self.object_url(path)))
            .send()
            .await?;
        match Self::check(response, path).await {
            Ok(response) => Ok(Some(response.bytes().await?.to_vec())),
            Err(CloudError::NotFound(_)) => Ok(None),
            // Object storage reports missing objects as 400 on some deployments.
            Err(CloudError::Server { status: 400, message }) if message.contains("not found") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_urls() {
        assert!(matches!(
            RestCloudStore::new("ftp://example.com", "key"),
            Err(CloudError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_urls() {
        let store = RestCloudStore::new("https://db.example.com/", "key").unwrap();
        assert_eq!(
            store.table_url("user_books", "select=*"),
            "https://db.example.com/rest/v1/user_books?select=*"
        );
        assert_eq!(
            store.object_url("user-u1/app-state.json"),
            "https://db.example.com/storage/v1/object/user-data/user-u1/app-state.json"
        );
    }

    #[test]
    fn test_table_names_follow_config() {
        let store = RestCloudStore::new("https://db.example.com", "key").unwrap();
        assert_eq!(store.tables.books, "user_books");
        assert_eq!(store.tables.highlights, "user_highlights");

        let store = store.with_tables(RestTables {
            books: "books".to_string(),
            highlights: "highlights".to_string(),
            ..Default::default()
        });
        assert_eq!(
            store.table_url(&store.tables.books, "select=book_data"),
            "https://db.example.com/rest/v1/books?select=book_data"
        );
        assert_eq!(store.tables.highlights, "highlights");
        assert_eq!(store.tables.exam_evaluations, "exam_evaluations");
    }

    #[test]
    fn test_filter_query_encodes_and_skips() {
        let query = filter_query(&[
            ("user_id", Some("u1")),
            ("book_id", None),
            ("chapter_id", Some("Laws of Motion")),
        ]);
        assert_eq!(query, "user_id=eq.u1&chapter_id=eq.Laws%20of%20Motion");
    }
}

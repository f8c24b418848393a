//! Bidirectional repair between the local cache and the cloud tables.
//!
//! Push walks the cache for highlight, custom-tab and exam keys and writes
//! whatever the cloud is missing. Pull rebuilds those keys from the cloud.
//! Both directions are safe to re-run.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::books::{BookRegistry, BookSyncService, CloudPush};
use super::error::SyncError;
use crate::cloud::{Book, BookAggregate, CloudStore, ExamEvaluation, Highlight, LocalHighlight};
use crate::identity::IdentityProvider;
use crate::keys::{
    evaluation_reports_key, highlights_key, normalize_segment, CUSTOM_TAB_PREFIX,
    EVALUATION_REPORTS_PREFIX, HIGHLIGHTS_PREFIX, QUESTION_PAPERS_PREFIX,
};
use crate::storage::LocalCache;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
    pub highlights: usize,
    pub custom_tabs: usize,
    pub exam_items: usize,
    /// Entries already present in the cloud with the same content
    pub unchanged: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReport {
    pub books: usize,
    /// Books whose local copy was pending or newer and so was not overwritten
    pub kept_local: usize,
    pub highlight_groups: usize,
    pub evaluation_groups: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncReport {
    pub success: bool,
    pub push: PushReport,
    pub pull: PullReport,
    pub errors: Vec<String>,
}

impl ResyncReport {
    /// Turn accumulated errors into [`SyncError::PartialReconciliation`].
    pub fn into_result(self) -> Result<Self, SyncError> {
        if self.success {
            Ok(self)
        } else {
            Err(SyncError::PartialReconciliation(self.errors))
        }
    }
}

#[derive(Clone)]
pub struct ReconciliationService {
    cache: LocalCache,
    registry: BookRegistry,
    books: BookSyncService,
    cloud: Arc<dyn CloudStore>,
    identity: Arc<dyn IdentityProvider>,
}

impl ReconciliationService {
    pub fn new(
        cache: LocalCache,
        books: BookSyncService,
        cloud: Arc<dyn CloudStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            registry: BookRegistry::new(cache.clone()),
            cache,
            books,
            cloud,
            identity,
        }
    }

    fn user(&self) -> Result<String, SyncError> {
        self.identity
            .current_user_id()
            .ok_or(SyncError::Unauthenticated)
    }

    pub async fn push_all(&self) -> Result<PushReport, SyncError> {
        let user_id = self.user()?;
        let mut report = PushReport::default();

        self.push_highlights(&user_id, &mut report).await;
        for book in self.registry.books() {
            self.push_aggregate_extras(&user_id, &book, &mut report).await;
        }
        self.push_evaluations(&user_id, &mut report).await;

        log::info!(
            "Pushed {} highlights, {} custom tabs, {} exam items ({} unchanged, {} errors)",
            report.highlights,
            report.custom_tabs,
            report.exam_items,
            report.unchanged,
            report.errors.len()
        );
        Ok(report)
    }

    pub async fn pull_all(&self) -> Result<PullReport, SyncError> {
        let user_id = self.user()?;
        let mut report = PullReport::default();

        // Unpushed local edits go up before anything comes down.
        for book_id in self.books.status().pending_sync {
            match self.books.force_sync_book(&book_id).await {
                Ok(CloudPush::Failed(e)) => report.errors.push(format!("{}: {}", book_id, e)),
                Ok(_) => {}
                Err(SyncError::BookNotFound(_)) => {}
                Err(e) => report.errors.push(format!("{}: {}", book_id, e)),
            }
        }
        let pending = self.books.status().pending_sync;

        // Aggregates first so the registry knows every book before the
        // table rows are grouped by book name.
        match self.cloud.list_books_for_user(&user_id).await {
            Ok(books) => {
                for book in books {
                    if pending.contains(&book.id) {
                        log::info!("Keeping unpushed local copy of {}", book.name);
                        report.kept_local += 1;
                        continue;
                    }
                    if let Some(local) = self.registry.find_by_id(&book.id) {
                        if local.updated_at > book.updated_at {
                            log::info!("Local copy of {} is newer than the cloud", book.name);
                            report.kept_local += 1;
                            continue;
                        }
                    }
                    match self.cloud.fetch_book_aggregate(&user_id, &book.id).await {
                        Ok(Some(aggregate)) => match self.books.restore_aggregate(&aggregate) {
                            Ok(_) => report.books += 1,
                            Err(e) => report.errors.push(format!("{}: {}", book.name, e)),
                        },
                        Ok(None) => {}
                        Err(e) => report.errors.push(format!("{}: {}", book.name, e)),
                    }
                }
            }
            Err(e) => report.errors.push(format!("Book listing failed: {}", e)),
        }

        match self.cloud.query_highlights(&user_id, None, None).await {
            Ok(rows) => {
                let mut grouped: BTreeMap<String, Vec<Highlight>> = BTreeMap::new();
                for row in rows {
                    let Some(book) = self.registry.find_by_id(&row.book_id) else {
                        log::debug!("Highlight {} belongs to unknown book {}", row.id, row.book_id);
                        continue;
                    };
                    grouped
                        .entry(highlights_key(&book.name, &row.chapter_id))
                        .or_default()
                        .push(row);
                }
                for (key, mut rows) in grouped {
                    rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                    let local: Vec<LocalHighlight> = rows.iter().map(Highlight::to_local).collect();
                    match self.cache.set_json(&key, &local) {
                        Ok(()) => report.highlight_groups += 1,
                        Err(e) => report.errors.push(format!("{}: {}", key, e)),
                    }
                }
            }
            Err(e) => report.errors.push(format!("Highlight query failed: {}", e)),
        }

        match self.cloud.query_exam_evaluations(&user_id, None, None).await {
            Ok(rows) => {
                let mut grouped: BTreeMap<String, Vec<ExamEvaluation>> = BTreeMap::new();
                for row in rows {
                    let Some(book) = self.registry.find_by_id(&row.book_id) else {
                        continue;
                    };
                    grouped
                        .entry(evaluation_reports_key(&book.name, &row.chapter_id))
                        .or_default()
                        .push(row);
                }
                for (key, mut rows) in grouped {
                    rows.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
                    let reports: Vec<Value> =
                        rows.into_iter().map(|r| r.evaluation_data).collect();
                    match self.cache.set_json(&key, &reports) {
                        Ok(()) => report.evaluation_groups += 1,
                        Err(e) => report.errors.push(format!("{}: {}", key, e)),
                    }
                }
            }
            Err(e) => report.errors.push(format!("Evaluation query failed: {}", e)),
        }

        log::info!(
            "Pulled {} books, {} highlight groups, {} evaluation groups",
            report.books,
            report.highlight_groups,
            report.evaluation_groups
        );
        Ok(report)
    }

    /// Push then pull. Never fails; problems end up in the report.
    pub async fn force_complete_resync(&self) -> ResyncReport {
        let mut report = ResyncReport::default();

        match self.push_all().await {
            Ok(push) => report.push = push,
            Err(e) => report.errors.push(e.to_string()),
        }
        match self.pull_all().await {
            Ok(pull) => report.pull = pull,
            Err(e) => report.errors.push(e.to_string()),
        }

        report.errors.extend(report.push.errors.iter().cloned());
        report.errors.extend(report.pull.errors.iter().cloned());
        report.errors.dedup();
        report.success = report.errors.is_empty();
        report
    }

    async fn push_highlights(&self, user_id: &str, report: &mut PushReport) {
        for key in self.cache.list_keys(|k| k.starts_with(HIGHLIGHTS_PREFIX)) {
            let Some((book, segment)) = self.registry.resolve_key(&key, HIGHLIGHTS_PREFIX) else {
                log::warn!("No local book owns {}, skipping", key);
                continue;
            };
            let chapter = self.registry.chapter_name(&book.id, &segment);

            let Some(mut local) = self.cache.get_json::<Vec<LocalHighlight>>(&key) else {
                report.errors.push(format!("{}: not a highlight list", key));
                continue;
            };

            let remote = match self
                .cloud
                .query_highlights(user_id, Some(&book.id), Some(&chapter))
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    report.errors.push(format!("{}: {}", key, e));
                    continue;
                }
            };

            let mut assigned = false;
            for entry in local.iter_mut() {
                let id = match &entry.id {
                    Some(id) => id.clone(),
                    None => {
                        // Adopt the id of an identical cloud row, else mint one.
                        let id = remote
                            .iter()
                            .find(|r| r.same_content(entry))
                            .map(|r| r.id.clone())
                            .unwrap_or_else(|| Uuid::new_v4().to_string());
                        entry.id = Some(id.clone());
                        assigned = true;
                        id
                    }
                };

                if let Some(existing) = remote.iter().find(|r| r.id == id) {
                    let local_newer = entry
                        .modified_at()
                        .map_or(false, |at| at > existing.updated_at);
                    if existing.same_content(entry) || !local_newer {
                        report.unchanged += 1;
                        continue;
                    }
                }

                let row = entry.to_row(&id, &book.id, &chapter);
                match self.cloud.upsert_highlight(user_id, &row).await {
                    Ok(()) => report.highlights += 1,
                    Err(e) => report.errors.push(format!("Highlight {}: {}", id, e)),
                }
            }

            if assigned {
                if let Err(e) = self.cache.set_json(&key, &local) {
                    report.errors.push(format!("{}: {}", key, e));
                }
            }
        }
    }

    /// Custom tabs and question papers travel inside the book aggregate.
    async fn push_aggregate_extras(&self, user_id: &str, book: &Book, report: &mut PushReport) {
        let segment = normalize_segment(&book.name);
        let content = self.books.collect_book_content(book);
        let extras: Vec<(&String, &Value)> = content
            .iter()
            .filter(|(key, _)| {
                key.contains(CUSTOM_TAB_PREFIX)
                    || key.starts_with(&format!("{}{}_", QUESTION_PAPERS_PREFIX, segment))
            })
            .collect();
        if extras.is_empty() {
            return;
        }
        log::debug!("{} aggregate extras for {}", extras.len(), book.name);

        let mut aggregate = match self.cloud.fetch_book_aggregate(user_id, &book.id).await {
            Ok(Some(aggregate)) => aggregate,
            Ok(None) => BookAggregate {
                book: book.clone(),
                chapters: self.registry.chapters(&book.id),
                content: Default::default(),
                last_synced: None,
            },
            Err(e) => {
                report.errors.push(format!("{}: {}", book.name, e));
                return;
            }
        };

        let mut tabs = 0;
        let mut papers = 0;
        for (key, value) in extras {
            if aggregate.content.get(key) == Some(value) {
                report.unchanged += 1;
                continue;
            }
            aggregate.content.insert(key.clone(), value.clone());
            if key.contains(CUSTOM_TAB_PREFIX) {
                tabs += 1;
            } else {
                papers += 1;
            }
        }
        if tabs + papers == 0 {
            return;
        }

        match self
            .cloud
            .upsert_book_aggregate(user_id, &aggregate.book, &aggregate.chapters, &aggregate.content)
            .await
        {
            Ok(()) => {
                report.custom_tabs += tabs;
                report.exam_items += papers;
            }
            Err(e) => report.errors.push(format!("{}: {}", book.name, e)),
        }
    }

    async fn push_evaluations(&self, user_id: &str, report: &mut PushReport) {
        for key in self.cache.list_keys(|k| k.starts_with(EVALUATION_REPORTS_PREFIX)) {
            let Some((book, segment)) = self.registry.resolve_key(&key, EVALUATION_REPORTS_PREFIX)
            else {
                log::warn!("No local book owns {}, skipping", key);
                continue;
            };
            let chapter = self.registry.chapter_name(&book.id, &segment);

            let mut reports = match self.cache.get_value(&key) {
                Some(Value::Array(items)) => items,
                Some(Value::Null) | None => continue,
                Some(single) => vec![single],
            };

            // Reports saved before ids existed get one now so the pull
            // that follows cannot drop them.
            let mut assigned = false;
            for item in reports.iter_mut() {
                let Value::Object(fields) = item else {
                    continue;
                };
                let has_id = match fields.get("id") {
                    Some(Value::String(id)) => !id.is_empty(),
                    Some(Value::Number(_)) => true,
                    _ => false,
                };
                if !has_id {
                    fields.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
                    assigned = true;
                }
            }
            if assigned {
                if let Err(e) = self.cache.set_json(&key, &reports) {
                    report.errors.push(format!("{}: {}", key, e));
                    continue;
                }
            }

            let existing = match self
                .cloud
                .query_exam_evaluations(user_id, Some(&book.id), Some(&chapter))
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    report.errors.push(format!("{}: {}", key, e));
                    continue;
                }
            };

            for item in &reports {
                let Some(row) = ExamEvaluation::from_local(item, &book.id, &chapter) else {
                    continue;
                };
                if existing
                    .iter()
                    .any(|e| e.id == row.id && e.evaluation_data == row.evaluation_data)
                {
                    report.unchanged += 1;
                    continue;
                }
                match self.cloud.upsert_exam_evaluation(user_id, &row).await {
                    Ok(()) => report.exam_items += 1,
                    Err(e) => report.errors.push(format!("Evaluation {}: {}", row.id, e)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastCoordinator;
    use crate::cloud::{HighlightPosition, MemoryCloud, NewBook, NewChapter};
    use crate::identity::SessionIdentity;
    use crate::keys::SegmentKeyMatcher;
    use crate::sync::debounce::Debouncer;
    use serde_json::json;
    use std::time::Duration;

    struct Device {
        cache: LocalCache,
        books: BookSyncService,
        reconcile: ReconciliationService,
    }

    fn device(cloud: &Arc<MemoryCloud>, identity: &Arc<SessionIdentity>) -> Device {
        let cache = LocalCache::in_memory();
        let books = BookSyncService::new(
            cache.clone(),
            Arc::clone(cloud) as Arc<dyn CloudStore>,
            Arc::clone(identity) as Arc<dyn IdentityProvider>,
            BroadcastCoordinator::start(BroadcastCoordinator::generate_tab_id(), "test", Vec::new()),
            Arc::new(SegmentKeyMatcher),
            Debouncer::new(),
            Duration::from_millis(1000),
        );
        let reconcile = ReconciliationService::new(
            cache.clone(),
            books.clone(),
            Arc::clone(cloud) as Arc<dyn CloudStore>,
            Arc::clone(identity) as Arc<dyn IdentityProvider>,
        );
        Device {
            cache,
            books,
            reconcile,
        }
    }

    async fn physics(device: &Device) -> Book {
        let (book, _) = device
            .books
            .create_book(NewBook {
                name: "Physics".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        device
            .books
            .add_chapter(&book.id, NewChapter { number: 1, name: "Laws of Motion".into() })
            .await
            .unwrap();
        book
    }

    #[tokio::test]
    async fn test_push_assigns_ids_and_is_idempotent() {
        let cloud = Arc::new(MemoryCloud::new());
        let identity = Arc::new(SessionIdentity::signed_in("u1"));
        let a = device(&cloud, &identity);
        let book = physics(&a).await;

        a.cache
            .set_json(
                "highlights_Physics_Laws_of_Motion",
                &json!([
                    {"text": "inertia", "color": "yellow", "position": {"start": 0, "end": 7}},
                    {"text": "momentum", "position": {"start": 10, "end": 18}, "note": "p = mv"}
                ]),
            )
            .unwrap();

        let first = a.reconcile.push_all().await.unwrap();
        assert_eq!(first.highlights, 2);
        assert!(first.errors.is_empty());

        let stored: Vec<LocalHighlight> =
            a.cache.get_json("highlights_Physics_Laws_of_Motion").unwrap();
        assert!(stored.iter().all(|h| h.id.is_some()));

        let rows = cloud
            .query_highlights("u1", Some(&book.id), Some("Laws of Motion"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let second = a.reconcile.push_all().await.unwrap();
        assert_eq!(second.highlights, 0);
        assert_eq!(second.unchanged, 2);
    }

    #[tokio::test]
    async fn test_push_routes_exam_and_custom_tab_keys() {
        let cloud = Arc::new(MemoryCloud::new());
        let identity = Arc::new(SessionIdentity::signed_in("u1"));
        let a = device(&cloud, &identity);
        let book = physics(&a).await;

        a.cache
            .set_json("customtab_Summary_Physics_Laws_of_Motion", &json!("<p>F = ma</p>"))
            .unwrap();
        a.cache
            .set_json("questionPapers_Physics_Laws_of_Motion", &json!([{"title": "Mid-term"}]))
            .unwrap();
        a.cache
            .set_json(
                "evaluationReports_Physics_Laws_of_Motion",
                &json!([{"id": "ev1", "paperTitle": "Mid-term", "totalMarks": 20, "obtainedMarks": 15}]),
            )
            .unwrap();

        let report = a.reconcile.push_all().await.unwrap();
        assert_eq!(report.custom_tabs, 1);
        assert_eq!(report.exam_items, 2);

        let aggregate = cloud.fetch_book_aggregate("u1", &book.id).await.unwrap().unwrap();
        assert!(aggregate.content.contains_key("customtab_Summary_Physics_Laws_of_Motion"));
        let evaluations = cloud.query_exam_evaluations("u1", None, None).await.unwrap();
        assert_eq!(evaluations.len(), 1);
        assert_eq!(evaluations[0].chapter_id, "Laws of Motion");
        assert_eq!(evaluations[0].obtained_marks, 15.0);

        let again = a.reconcile.push_all().await.unwrap();
        assert_eq!(again.custom_tabs + again.exam_items, 0);
    }

    #[tokio::test]
    async fn test_pull_rebuilds_keys_on_new_device() {
        let cloud = Arc::new(MemoryCloud::new());
        let identity = Arc::new(SessionIdentity::signed_in("u1"));
        let a = device(&cloud, &identity);
        let book = physics(&a).await;

        let now = chrono::Utc::now();
        cloud
            .upsert_highlight(
                "u1",
                &Highlight {
                    id: "h1".into(),
                    book_id: book.id.clone(),
                    chapter_id: "Laws of Motion".into(),
                    text: "inertia".into(),
                    color: "green".into(),
                    position: HighlightPosition { start: 0, end: 7 },
                    note: None,
                    created_at: now,
                    updated_at: now,
                },
            )
            .await
            .unwrap();

        let b = device(&cloud, &identity);
        let report = b.reconcile.pull_all().await.unwrap();
        assert_eq!(report.books, 1);
        assert_eq!(report.highlight_groups, 1);

        let local: Vec<LocalHighlight> =
            b.cache.get_json("highlights_Physics_Laws_of_Motion").unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].id.as_deref(), Some("h1"));
        assert_eq!(local[0].color, "green");
    }

    #[tokio::test]
    async fn test_newer_local_edit_wins() {
        let cloud = Arc::new(MemoryCloud::new());
        let identity = Arc::new(SessionIdentity::signed_in("u1"));
        let a = device(&cloud, &identity);
        let book = physics(&a).await;

        let then = chrono::Utc::now() - chrono::Duration::hours(1);
        let row = Highlight {
            id: "h1".into(),
            book_id: book.id.clone(),
            chapter_id: "Laws of Motion".into(),
            text: "inertia".into(),
            color: "yellow".into(),
            position: HighlightPosition { start: 0, end: 7 },
            note: None,
            created_at: then,
            updated_at: then,
        };
        cloud.upsert_highlight("u1", &row).await.unwrap();

        let mut edited = row.to_local();
        edited.note = Some("first law".into());
        edited.updated_at = Some(chrono::Utc::now());
        a.cache
            .set_json("highlights_Physics_Laws_of_Motion", &vec![edited])
            .unwrap();

        let report = a.reconcile.force_complete_resync().await;
        assert!(report.success, "{:?}", report.errors);
        let rows = cloud.query_highlights("u1", None, None).await.unwrap();
        assert_eq!(rows[0].note.as_deref(), Some("first law"));
    }

    #[tokio::test]
    async fn test_resync_keeps_offline_edit() {
        let cloud = Arc::new(MemoryCloud::new());
        let identity = Arc::new(SessionIdentity::signed_in("u1"));
        let a = device(&cloud, &identity);
        let book = physics(&a).await;
        let key = "NOTES_Physics_Laws_of_Motion";

        a.books
            .save_content(&book.id, "Physics", "Laws of Motion", "NOTES", &json!([{"text": "v1"}]))
            .await
            .unwrap();
        cloud.set_offline(true);
        a.books
            .save_content(
                &book.id,
                "Physics",
                "Laws of Motion",
                "NOTES",
                &json!([{"text": "v2-offline"}]),
            )
            .await
            .unwrap();
        assert_eq!(a.books.status().pending_sync, vec![book.id.clone()]);
        cloud.set_offline(false);

        let report = a.reconcile.force_complete_resync().await;
        assert!(report.success, "{:?}", report.errors);
        assert_eq!(a.cache.get_json::<Value>(key), Some(json!([{"text": "v2-offline"}])));
        assert!(a.books.status().pending_sync.is_empty());

        let aggregate = cloud.fetch_book_aggregate("u1", &book.id).await.unwrap().unwrap();
        assert_eq!(aggregate.content.get(key), Some(&json!([{"text": "v2-offline"}])));
    }

    #[tokio::test]
    async fn test_pull_skips_older_cloud_aggregate() {
        let cloud = Arc::new(MemoryCloud::new());
        let identity = Arc::new(SessionIdentity::signed_in("u1"));
        let a = device(&cloud, &identity);
        let book = physics(&a).await;
        let key = "NOTES_Physics_Laws_of_Motion";
        a.books
            .save_content(&book.id, "Physics", "Laws of Motion", "NOTES", &json!([{"text": "new"}]))
            .await
            .unwrap();

        let mut stale = book.clone();
        stale.updated_at = chrono::Utc::now() - chrono::Duration::hours(1);
        let mut content = crate::cloud::ContentMap::new();
        content.insert(key.to_string(), json!([{"text": "old"}]));
        cloud
            .upsert_book_aggregate("u1", &stale, &a.books.registry().chapters(&book.id), &content)
            .await
            .unwrap();

        let report = a.reconcile.pull_all().await.unwrap();
        assert_eq!(report.kept_local, 1);
        assert_eq!(report.books, 0);
        assert_eq!(a.cache.get_json::<Value>(key), Some(json!([{"text": "new"}])));
    }

    #[tokio::test]
    async fn test_reports_without_id_survive_resync() {
        let cloud = Arc::new(MemoryCloud::new());
        let identity = Arc::new(SessionIdentity::signed_in("u1"));
        let a = device(&cloud, &identity);
        physics(&a).await;
        let key = "evaluationReports_Physics_Laws_of_Motion";

        a.cache
            .set_json(
                key,
                &json!([
                    {"id": "r1", "paperTitle": "Mid-term", "totalMarks": 20, "obtainedMarks": 15},
                    {"paperTitle": "Quiz", "totalMarks": 10, "obtainedMarks": 7}
                ]),
            )
            .unwrap();

        let report = a.reconcile.force_complete_resync().await;
        assert!(report.success, "{:?}", report.errors);
        assert_eq!(report.push.exam_items, 2);

        let local: Vec<Value> = a.cache.get_json(key).unwrap();
        assert_eq!(local.len(), 2);
        assert!(local.iter().all(|r| r["id"].as_str().map_or(false, |id| !id.is_empty())));
        assert!(local.iter().any(|r| r["paperTitle"] == "Quiz"));

        let rows = cloud.query_exam_evaluations("u1", None, None).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_resync_reports_instead_of_failing() {
        let cloud = Arc::new(MemoryCloud::new());
        let identity = Arc::new(SessionIdentity::new(None));
        let a = device(&cloud, &identity);

        let report = a.reconcile.force_complete_resync().await;
        assert!(!report.success);
        assert!(matches!(
            report.clone().into_result(),
            Err(SyncError::PartialReconciliation(errors)) if !errors.is_empty()
        ));

        identity.sign_in("u1");
        cloud.set_offline(true);
        let report = a.reconcile.force_complete_resync().await;
        assert!(!report.success);
        assert!(!report.pull.errors.is_empty());
    }
}

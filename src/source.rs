//! Task sources: where tasks and projects are fetched from.
//!
//! | Config value | Source |
//! |--------------|--------|
//! | `"todoist"` | [`TodoistSource`]: paginated HTTP API, bearer token |
//! | `"file"` | [`FileSource`]: a JSON export `{ "projects": [...], "tasks": [...] }` |
//!
//! Both share the raw record types below, so a Todoist API response and a
//! file export map to the domain model identically.
//!
//! # Error mapping
//!
//! - network errors, HTTP 429, HTTP 5xx → [`SyncError::TransientSource`]
//! - other HTTP 4xx, undecodable bodies, unreadable files → [`SyncError::SourceRejected`]

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use task_harness_core::models::{Due, Priority, Project, Task};
use task_harness_core::{SyncError, SyncResult};

use crate::config::SourceConfig;

/// A provider of the full current task and project lists.
#[async_trait]
pub trait TaskSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_projects(&self) -> SyncResult<Vec<Project>>;

    /// Every task currently known to the source. Pagination, if any, is
    /// handled internally.
    async fn fetch_tasks(&self) -> SyncResult<Vec<Task>>;
}

// ============ Raw records ============

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Option::<serde_json::Value>::deserialize(d)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct RawDue {
    date: String,
    #[serde(default)]
    string: Option<String>,
    #[serde(default)]
    datetime: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default, alias = "recurring")]
    is_recurring: bool,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    #[serde(deserialize_with = "string_or_number")]
    project_id: String,
    content: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    due: Option<RawDue>,
    #[serde(default, alias = "checked")]
    is_completed: bool,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    parent_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    section_id: Option<String>,
    #[serde(default, alias = "responsible_uid", deserialize_with = "opt_string_or_number")]
    assignee_id: Option<String>,
    #[serde(default, alias = "child_order")]
    order: i64,
    #[serde(default, alias = "note_count")]
    comment_count: i64,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, alias = "added_at")]
    created_at: Option<String>,
}

impl RawTask {
    fn into_task(self) -> Task {
        let due = self.due.map(|d| Due {
            recurrence: if d.is_recurring { d.string } else { None },
            date: d.date,
            datetime: d.datetime,
            timezone: d.timezone,
        });
        Task {
            id: self.id,
            project_id: self.project_id,
            content: self.content,
            description: self.description.unwrap_or_default(),
            priority: Priority::from_source(self.priority.unwrap_or(0)),
            due,
            is_completed: self.is_completed,
            labels: self.labels.into_iter().collect(),
            parent_id: self.parent_id,
            section_id: self.section_id,
            assignee_id: self.assignee_id,
            order: self.order,
            comment_count: self.comment_count,
            url: self.url.filter(|u| !u.is_empty()),
            created_at: self
                .created_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawProject {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    name: String,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    parent_id: Option<String>,
    #[serde(default, alias = "child_order")]
    order: i64,
    #[serde(default, alias = "shared")]
    is_shared: bool,
    #[serde(default)]
    is_favorite: bool,
    #[serde(default, alias = "inbox_project")]
    is_inbox_project: bool,
    #[serde(default)]
    is_team_inbox: bool,
    #[serde(default)]
    view_style: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

impl RawProject {
    fn into_project(self) -> Project {
        Project {
            id: self.id,
            name: self.name,
            parent_id: self.parent_id,
            order: self.order,
            is_shared: self.is_shared,
            is_favorite: self.is_favorite,
            is_inbox_project: self.is_inbox_project,
            is_team_inbox: self.is_team_inbox,
            view_style: self.view_style.unwrap_or_else(|| "list".to_string()),
            url: self.url.filter(|u| !u.is_empty()),
        }
    }
}

/// A page of results: either `{ "results": [...], "next_cursor": ... }` or
/// a bare array, which is treated as the only page.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Page<T> {
    Cursor {
        results: Vec<T>,
        #[serde(default)]
        next_cursor: Option<String>,
    },
    Bare(Vec<T>),
}

impl<T> Page<T> {
    fn into_parts(self) -> (Vec<T>, Option<String>) {
        match self {
            Page::Cursor {
                results,
                next_cursor,
            } => (results, next_cursor.filter(|c| !c.is_empty())),
            Page::Bare(results) => (results, None),
        }
    }
}

// ============ Todoist ============

/// Source backed by the Todoist API (`GET /projects`, `GET /tasks`).
pub struct TodoistSource {
    client: reqwest::Client,
    base_url: String,
    token: String,
    page_size: usize,
}

impl TodoistSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let token = match std::env::var(&config.token_env) {
            Ok(t) if !t.is_empty() => t,
            _ => bail!("{} environment variable not set", config.token_env),
        };
        Self::with_token(config, token)
    }

    pub fn with_token(config: &SourceConfig, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            page_size: config.page_size,
        })
    }

    async fn fetch_all<T: DeserializeOwned>(&self, resource: &str) -> SyncResult<Vec<T>> {
        let url = format!("{}/{}", self.base_url, resource);
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            let mut request = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .query(&[("limit", self.page_size.to_string())]);
            if let Some(c) = &cursor {
                request = request.query(&[("cursor", c)]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| SyncError::TransientSource(format!("GET {resource}: {e}")))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_status(resource, status, &body));
            }

            let page: Page<T> = response.json().await.map_err(|e| {
                SyncError::SourceRejected(format!("GET {resource}: undecodable body: {e}"))
            })?;
            let (results, next) = page.into_parts();
            items.extend(results);

            match next {
                Some(next) => {
                    if !seen.insert(next.clone()) {
                        return Err(SyncError::SourceRejected(format!(
                            "GET {resource}: pagination cursor repeated"
                        )));
                    }
                    tracing::debug!(resource, fetched = items.len(), "fetching next page");
                    cursor = Some(next);
                }
                None => break,
            }
        }

        Ok(items)
    }
}

fn classify_status(resource: &str, status: StatusCode, body: &str) -> SyncError {
    let reason = format!("GET {resource}: HTTP {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SyncError::TransientSource(reason)
    } else {
        SyncError::SourceRejected(reason)
    }
}

#[async_trait]
impl TaskSource for TodoistSource {
    fn name(&self) -> &str {
        "todoist"
    }

    async fn fetch_projects(&self) -> SyncResult<Vec<Project>> {
        let raw: Vec<RawProject> = self.fetch_all("projects").await?;
        Ok(raw.into_iter().map(RawProject::into_project).collect())
    }

    async fn fetch_tasks(&self) -> SyncResult<Vec<Task>> {
        let raw: Vec<RawTask> = self.fetch_all("tasks").await?;
        Ok(raw.into_iter().map(RawTask::into_task).collect())
    }
}

// ============ File ============

#[derive(Debug, Deserialize)]
struct Export {
    #[serde(default)]
    projects: Vec<RawProject>,
    #[serde(default)]
    tasks: Vec<RawTask>,
}

/// Source reading a JSON export from disk. The file is re-read on every
/// fetch, so edits between runs are picked up.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> SyncResult<Export> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SyncError::SourceRejected(format!("cannot read {}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            SyncError::SourceRejected(format!("cannot parse {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl TaskSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn fetch_projects(&self) -> SyncResult<Vec<Project>> {
        let export = self.load().await?;
        Ok(export
            .projects
            .into_iter()
            .map(RawProject::into_project)
            .collect())
    }

    async fn fetch_tasks(&self) -> SyncResult<Vec<Task>> {
        let export = self.load().await?;
        Ok(export.tasks.into_iter().map(RawTask::into_task).collect())
    }
}

/// Instantiate the source named by `source.provider`.
pub fn create_source(config: &SourceConfig) -> Result<Box<dyn TaskSource>> {
    match config.provider.as_str() {
        "todoist" => Ok(Box::new(TodoistSource::new(config)?)),
        "file" => {
            let path = config
                .path
                .clone()
                .context("source.path required for file provider")?;
            Ok(Box::new(FileSource::new(path)))
        }
        other => bail!("Unknown source provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn raw_task(json: serde_json::Value) -> Task {
        serde_json::from_value::<RawTask>(json).unwrap().into_task()
    }

    #[test]
    fn test_maps_todoist_task() {
        let task = raw_task(serde_json::json!({
            "id": "6Jf8VQXxpwv56VQ7",
            "project_id": 2203306141u64,
            "content": "Buy milk",
            "description": "",
            "priority": 7,
            "checked": true,
            "labels": ["errand", "errand"],
            "parent_id": null,
            "child_order": 3,
            "note_count": 2,
            "added_at": "2024-05-01T10:00:00Z",
            "due": {
                "date": "2024-05-06",
                "string": "every monday",
                "is_recurring": true
            }
        }));
        assert_eq!(task.id, "6Jf8VQXxpwv56VQ7");
        assert_eq!(task.project_id, "2203306141");
        assert_eq!(task.priority, Priority::Urgent);
        assert!(task.is_completed);
        assert_eq!(task.labels.len(), 1);
        assert_eq!(task.order, 3);
        assert_eq!(task.comment_count, 2);
        assert!(task.created_at.is_some());
        let due = task.due.unwrap();
        assert_eq!(due.recurrence.as_deref(), Some("every monday"));
    }

    #[test]
    fn test_non_recurring_due_drops_rule_text() {
        let task = raw_task(serde_json::json!({
            "id": "1", "project_id": "p", "content": "Pay rent",
            "due": { "date": "2024-06-01", "string": "jun 1", "recurring": false }
        }));
        assert_eq!(task.due.unwrap().recurrence, None);
    }

    #[test]
    fn test_accepts_legacy_recurring_flag() {
        let task = raw_task(serde_json::json!({
            "id": "1", "project_id": "p", "content": "Standup",
            "due": { "date": "2024-06-03", "string": "every weekday", "recurring": true }
        }));
        assert_eq!(task.due.unwrap().recurrence.as_deref(), Some("every weekday"));
    }

    #[test]
    fn test_page_shapes() {
        let page: Page<i32> =
            serde_json::from_value(serde_json::json!({ "results": [1, 2], "next_cursor": "c2" }))
                .unwrap();
        assert_eq!(page.into_parts(), (vec![1, 2], Some("c2".to_string())));

        let page: Page<i32> = serde_json::from_value(serde_json::json!([3])).unwrap();
        assert_eq!(page.into_parts(), (vec![3], None));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status("tasks", StatusCode::TOO_MANY_REQUESTS, ""),
            SyncError::TransientSource(_)
        ));
        assert!(matches!(
            classify_status("tasks", StatusCode::SERVICE_UNAVAILABLE, ""),
            SyncError::TransientSource(_)
        ));
        assert!(matches!(
            classify_status("tasks", StatusCode::UNAUTHORIZED, ""),
            SyncError::SourceRejected(_)
        ));
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn source_for(base_url: String) -> TodoistSource {
        let config = SourceConfig {
            base_url,
            page_size: 2,
            ..SourceConfig::default()
        };
        TodoistSource::with_token(&config, "test-token").unwrap()
    }

    #[tokio::test]
    async fn test_todoist_follows_cursor_pagination() {
        async fn tasks(Query(q): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
            let body = match q.get("cursor").map(String::as_str) {
                None => serde_json::json!({
                    "results": [
                        { "id": "1", "project_id": "p", "content": "one" },
                        { "id": "2", "project_id": "p", "content": "two" }
                    ],
                    "next_cursor": "page2"
                }),
                Some(_) => serde_json::json!({
                    "results": [{ "id": "3", "project_id": "p", "content": "three" }],
                    "next_cursor": null
                }),
            };
            Json(body)
        }

        let base = serve(Router::new().route("/tasks", get(tasks))).await;
        let fetched = source_for(base).fetch_tasks().await.unwrap();
        let ids: Vec<_> = fetched.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_todoist_maps_http_failures() {
        async fn limited(State(hits): State<Arc<AtomicUsize>>) -> AxumStatus {
            hits.fetch_add(1, Ordering::SeqCst);
            AxumStatus::TOO_MANY_REQUESTS
        }
        async fn forbidden() -> AxumStatus {
            AxumStatus::FORBIDDEN
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/tasks", get(limited))
            .route("/projects", get(forbidden))
            .with_state(hits.clone());
        let source = source_for(serve(app).await);

        let err = source.fetch_tasks().await.unwrap_err();
        assert!(matches!(err, SyncError::TransientSource(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 1, "the source itself never retries");

        let err = source.fetch_projects().await.unwrap_err();
        assert!(matches!(err, SyncError::SourceRejected(_)));
    }

    #[tokio::test]
    async fn test_file_source_reads_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "projects": [{ "id": "p1", "name": "Inbox", "inbox_project": true }],
                "tasks": [{ "id": "t1", "project_id": "p1", "content": "Buy milk", "priority": 2 }]
            })
            .to_string(),
        )
        .unwrap();

        let source = FileSource::new(&path);
        let projects = source.fetch_projects().await.unwrap();
        assert_eq!(projects[0].kind(), "inbox");
        let tasks = source.fetch_tasks().await.unwrap();
        assert_eq!(tasks[0].priority, Priority::Medium);
    }

    #[tokio::test]
    async fn test_file_source_missing_file_is_rejected() {
        let source = FileSource::new("/nonexistent/export.json");
        let err = source.fetch_tasks().await.unwrap_err();
        assert!(matches!(err, SyncError::SourceRejected(_)));
    }
}

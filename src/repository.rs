//! SQLite-backed [`TaskRepository`].
//!
//! Canonical rows live in `projects` and `tasks`; the latest enrichment of
//! each task lives in `enriched_tasks`. Canonical task rows are written with
//! a conditional upsert that only fires when a column actually differs, so
//! an unchanged re-sync leaves the database untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::BTreeSet;
use task_harness_core::models::{EnrichedTask, Project, Task, VectorRecord};
use task_harness_core::store::TaskRepository;
use task_harness_core::{SyncError, SyncResult};

const UPSERT_TASK: &str = r#"
    INSERT INTO tasks (
        id, project_id, content, description, priority, due_json, is_completed,
        labels_json, parent_id, section_id, assignee_id, item_order,
        comment_count, url, created_at, synced_at
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        project_id = excluded.project_id,
        content = excluded.content,
        description = excluded.description,
        priority = excluded.priority,
        due_json = excluded.due_json,
        is_completed = excluded.is_completed,
        labels_json = excluded.labels_json,
        parent_id = excluded.parent_id,
        section_id = excluded.section_id,
        assignee_id = excluded.assignee_id,
        item_order = excluded.item_order,
        comment_count = excluded.comment_count,
        url = excluded.url,
        created_at = excluded.created_at,
        synced_at = excluded.synced_at
    WHERE tasks.project_id IS NOT excluded.project_id
       OR tasks.content IS NOT excluded.content
       OR tasks.description IS NOT excluded.description
       OR tasks.priority IS NOT excluded.priority
       OR tasks.due_json IS NOT excluded.due_json
       OR tasks.is_completed IS NOT excluded.is_completed
       OR tasks.labels_json IS NOT excluded.labels_json
       OR tasks.parent_id IS NOT excluded.parent_id
       OR tasks.section_id IS NOT excluded.section_id
       OR tasks.assignee_id IS NOT excluded.assignee_id
       OR tasks.item_order IS NOT excluded.item_order
       OR tasks.comment_count IS NOT excluded.comment_count
       OR tasks.url IS NOT excluded.url
       OR tasks.created_at IS NOT excluded.created_at
"#;

/// Row counts reported by `taskh status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    pub projects: i64,
    pub tasks: i64,
    pub enriched: i64,
    pub last_processed_at: Option<String>,
}

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn stats(&self) -> SyncResult<RepositoryStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM projects) AS projects,
                (SELECT COUNT(*) FROM tasks) AS tasks,
                (SELECT COUNT(*) FROM enriched_tasks) AS enriched,
                (SELECT MAX(processed_at) FROM enriched_tasks) AS last_processed_at
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(read_error)?;

        Ok(RepositoryStats {
            projects: row.get("projects"),
            tasks: row.get("tasks"),
            enriched: row.get("enriched"),
            last_processed_at: row.get("last_processed_at"),
        })
    }
}

fn read_error(e: sqlx::Error) -> SyncError {
    SyncError::Repository(e.to_string())
}

fn write_error(task_id: &str, e: impl std::fmt::Display) -> SyncError {
    SyncError::RepositoryWrite {
        task_id: task_id.to_string(),
        reason: e.to_string(),
    }
}

fn to_json<T: serde::Serialize>(task_id: &str, value: &T) -> SyncResult<String> {
    serde_json::to_string(value).map_err(|e| write_error(task_id, e))
}

/// Upsert one canonical task row; true when the row was inserted or changed.
async fn upsert_task(tx: &mut Transaction<'_, Sqlite>, task: &Task) -> SyncResult<bool> {
    let due_json = match &task.due {
        Some(due) => Some(to_json(&task.id, due)?),
        None => None,
    };
    let labels_json = to_json(&task.id, &task.labels)?;

    let result = sqlx::query(UPSERT_TASK)
        .bind(&task.id)
        .bind(&task.project_id)
        .bind(&task.content)
        .bind(&task.description)
        .bind(i64::from(task.priority.as_u8()))
        .bind(due_json)
        .bind(task.is_completed)
        .bind(labels_json)
        .bind(&task.parent_id)
        .bind(&task.section_id)
        .bind(&task.assignee_id)
        .bind(task.order)
        .bind(task.comment_count)
        .bind(&task.url)
        .bind(task.created_at.map(|dt| dt.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(|e| write_error(&task.id, e))?;

    Ok(result.rows_affected() > 0)
}

fn decode_error(task_id: &str, what: &str, e: impl std::fmt::Display) -> SyncError {
    SyncError::Repository(format!("corrupt {what} for task {task_id}: {e}"))
}

fn parse_ts(task_id: &str, s: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| decode_error(task_id, "timestamp", e))
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn get_previous_state(&self, task_id: &str) -> SyncResult<Option<EnrichedTask>> {
        let row = sqlx::query(
            r#"
            SELECT task_json, fingerprint, analysis_json, metadata_json,
                   index_document_id, embedding_model, last_updated, processed_at
            FROM enriched_tasks
            WHERE task_id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(read_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let task_json: String = row.get("task_json");
        let task: Task =
            serde_json::from_str(&task_json).map_err(|e| decode_error(task_id, "task_json", e))?;
        let fingerprint_hex: String = row.get("fingerprint");
        let fingerprint = fingerprint_hex
            .parse()
            .map_err(|e| decode_error(task_id, "fingerprint", e))?;
        let analysis = match row.get::<Option<String>, _>("analysis_json") {
            Some(s) => Some(
                serde_json::from_str(&s).map_err(|e| decode_error(task_id, "analysis_json", e))?,
            ),
            None => None,
        };
        let metadata_json: String = row.get("metadata_json");
        let metadata = serde_json::from_str(&metadata_json)
            .map_err(|e| decode_error(task_id, "metadata_json", e))?;

        let doc_id: Option<String> = row.get("index_document_id");
        let model: Option<String> = row.get("embedding_model");
        let last_updated: Option<String> = row.get("last_updated");
        let vector = match (doc_id, model, last_updated) {
            (Some(index_document_id), Some(embedding_model), Some(ts)) => Some(VectorRecord {
                index_document_id,
                embedding_model,
                last_updated: parse_ts(task_id, &ts)?,
                fingerprint,
            }),
            _ => None,
        };

        let processed_at: String = row.get("processed_at");
        Ok(Some(EnrichedTask {
            task,
            fingerprint,
            analysis,
            vector,
            metadata,
            processed_at: parse_ts(task_id, &processed_at)?,
        }))
    }

    async fn save(&self, enriched: &EnrichedTask) -> SyncResult<()> {
        let task_id = enriched.task.id.as_str();
        let task_json = to_json(task_id, &enriched.task)?;
        let analysis_json = match &enriched.analysis {
            Some(a) => Some(to_json(task_id, a)?),
            None => None,
        };
        let metadata_json = to_json(task_id, &enriched.metadata)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| write_error(task_id, e))?;

        upsert_task(&mut tx, &enriched.task).await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO enriched_tasks (
                task_id, task_json, fingerprint, analysis_json, metadata_json,
                index_document_id, embedding_model, last_updated, processed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task_id)
        .bind(task_json)
        .bind(enriched.fingerprint.to_hex())
        .bind(analysis_json)
        .bind(metadata_json)
        .bind(enriched.vector.as_ref().map(|v| v.index_document_id.clone()))
        .bind(enriched.vector.as_ref().map(|v| v.embedding_model.clone()))
        .bind(enriched.vector.as_ref().map(|v| v.last_updated.to_rfc3339()))
        .bind(enriched.processed_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error(task_id, e))?;

        tx.commit().await.map_err(|e| write_error(task_id, e))?;
        Ok(())
    }

    async fn save_task(&self, task: &Task) -> SyncResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| write_error(&task.id, e))?;
        let changed = upsert_task(&mut tx, task).await?;
        tx.commit().await.map_err(|e| write_error(&task.id, e))?;
        Ok(changed)
    }

    async fn save_projects(&self, projects: &[Project]) -> SyncResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::Repository(e.to_string()))?;

        for p in projects {
            sqlx::query(
                r#"
                INSERT INTO projects (
                    id, name, parent_id, item_order, is_shared, is_favorite,
                    is_inbox_project, is_team_inbox, view_style, url
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    parent_id = excluded.parent_id,
                    item_order = excluded.item_order,
                    is_shared = excluded.is_shared,
                    is_favorite = excluded.is_favorite,
                    is_inbox_project = excluded.is_inbox_project,
                    is_team_inbox = excluded.is_team_inbox,
                    view_style = excluded.view_style,
                    url = excluded.url
                "#,
            )
            .bind(&p.id)
            .bind(&p.name)
            .bind(&p.parent_id)
            .bind(p.order)
            .bind(p.is_shared)
            .bind(p.is_favorite)
            .bind(p.is_inbox_project)
            .bind(p.is_team_inbox)
            .bind(&p.view_style)
            .bind(&p.url)
            .execute(&mut *tx)
            .await
            .map_err(|e| SyncError::Repository(format!("project {}: {e}", p.id)))?;
        }

        tx.commit()
            .await
            .map_err(|e| SyncError::Repository(e.to_string()))
    }

    async fn get_all_known_ids(&self) -> SyncResult<BTreeSet<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM tasks UNION SELECT task_id FROM enriched_tasks")
                .fetch_all(&self.pool)
                .await
                .map_err(read_error)?;
        Ok(ids.into_iter().collect())
    }

    async fn clear_enrichment(&self, task_id: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM enriched_tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error(task_id, e))?;
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> SyncResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| write_error(task_id, e))?;
        sqlx::query("DELETE FROM enriched_tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| write_error(task_id, e))?;
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| write_error(task_id, e))?;
        tx.commit().await.map_err(|e| write_error(task_id, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use task_harness_core::models::{AnalysisResult, Due, Priority, TaskMetadata};

    async fn repo() -> (tempfile::TempDir, SqliteTaskRepository) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect_path(&dir.path().join("taskh.sqlite"))
            .await
            .unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        (dir, SqliteTaskRepository::new(pool))
    }

    fn task() -> Task {
        let mut t = Task::new("t1", "p1", "Buy milk");
        t.priority = Priority::High;
        t.labels.insert("errand".into());
        t.due = Some(Due {
            date: "2024-05-06".into(),
            datetime: None,
            timezone: None,
            recurrence: None,
        });
        t
    }

    fn enriched(task: Task) -> EnrichedTask {
        let fp = task.fingerprint();
        EnrichedTask {
            metadata: TaskMetadata::derive(&task, None),
            analysis: Some(AnalysisResult {
                category: "errand".into(),
                ..Default::default()
            }),
            vector: Some(VectorRecord {
                index_document_id: "doc-1".into(),
                embedding_model: "hash".into(),
                last_updated: Utc::now(),
                fingerprint: fp,
            }),
            fingerprint: fp,
            task,
            processed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_task_only_writes_changes() {
        let (_dir, repo) = repo().await;
        let mut t = task();
        assert!(repo.save_task(&t).await.unwrap());
        assert!(!repo.save_task(&t).await.unwrap());
        t.comment_count = 4;
        assert!(repo.save_task(&t).await.unwrap());
    }

    #[tokio::test]
    async fn test_save_and_load_enriched_task() {
        let (_dir, repo) = repo().await;
        let e = enriched(task());
        repo.save(&e).await.unwrap();

        let loaded = repo.get_previous_state("t1").await.unwrap().unwrap();
        assert_eq!(loaded.task, e.task);
        assert_eq!(loaded.fingerprint, e.fingerprint);
        assert_eq!(loaded.analysis, e.analysis);
        assert_eq!(loaded.metadata, e.metadata);
        let vector = loaded.vector.unwrap();
        assert_eq!(vector.index_document_id, "doc-1");
        assert_eq!(vector.fingerprint, e.fingerprint);

        assert!(!repo.save_task(&e.task).await.unwrap(), "save also wrote the canonical row");
        assert!(repo.get_previous_state("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_known_ids_and_delete() {
        let (_dir, repo) = repo().await;
        repo.save(&enriched(task())).await.unwrap();
        repo.save_task(&Task::new("t2", "p1", "Call bank")).await.unwrap();

        let ids = repo.get_all_known_ids().await.unwrap();
        assert_eq!(ids.iter().map(String::as_str).collect::<Vec<_>>(), vec!["t1", "t2"]);

        repo.delete("t1").await.unwrap();
        repo.delete("t1").await.unwrap();
        let ids = repo.get_all_known_ids().await.unwrap();
        assert_eq!(ids.len(), 1);
        assert!(repo.get_previous_state("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_enrichment_keeps_canonical_row() {
        let (_dir, repo) = repo().await;
        repo.save(&enriched(task())).await.unwrap();

        repo.clear_enrichment("t1").await.unwrap();
        repo.clear_enrichment("t1").await.unwrap();
        assert!(repo.get_previous_state("t1").await.unwrap().is_none());
        let ids = repo.get_all_known_ids().await.unwrap();
        assert!(ids.contains("t1"));
    }

    #[tokio::test]
    async fn test_projects_and_stats() {
        let (_dir, repo) = repo().await;
        let mut inbox = Project::new("p1", "Inbox");
        repo.save_projects(&[inbox.clone()]).await.unwrap();
        inbox.name = "Inbox (renamed)".into();
        repo.save_projects(&[inbox]).await.unwrap();
        repo.save(&enriched(task())).await.unwrap();

        let stats = repo.stats().await.unwrap();
        assert_eq!(stats.projects, 1);
        assert_eq!(stats.tasks, 1);
        assert_eq!(stats.enriched, 1);
        assert!(stats.last_processed_at.is_some());
    }
}

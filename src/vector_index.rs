//! Vector index adapter and its SQLite backend.
//!
//! [`VectorIndexAdapter`] is the only component that mutates the index. It
//! exposes task-level operations on top of the document-level
//! [`VectorIndex`] trait:
//!
//! - [`upsert`](VectorIndexAdapter::upsert): delete every live document of
//!   the task, then insert the replacement under a fresh `doc_id`. A failed
//!   insert after a successful delete surfaces as
//!   [`SyncError::PartialUpsertFailure`]; the task is then unindexed until
//!   the upsert is retried, but never indexed twice.
//! - [`refresh_metadata`](VectorIndexAdapter::refresh_metadata): rewrite the
//!   filter metadata (project, completion, priority, due date) of the live
//!   document in place when only those fields changed. No re-embedding.
//! - [`remove`](VectorIndexAdapter::remove): delete every live document of
//!   the task. Removing an unindexed task is a no-op.
//! - [`search`](VectorIndexAdapter::search): ranked cosine search.
//!
//! Live documents are looked up in the index itself rather than trusted
//! from the repository, so a crash between index write and repository
//! write is repaired by the next upsert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use task_harness_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, Embedding};
use task_harness_core::models::{Priority, Task, VectorRecord};
use task_harness_core::store::{rank_hits, SearchFilters, SearchHit, VectorDocument, VectorIndex};
use task_harness_core::{Fingerprint, SyncError, SyncResult};

use crate::retry::with_timeout;

#[derive(Clone)]
pub struct VectorIndexAdapter {
    index: Arc<dyn VectorIndex>,
    call_timeout: Duration,
}

impl VectorIndexAdapter {
    pub fn new(index: Arc<dyn VectorIndex>, call_timeout: Duration) -> Self {
        Self {
            index,
            call_timeout,
        }
    }

    pub async fn upsert(
        &self,
        task: &Task,
        embedding: &Embedding,
        fingerprint: Fingerprint,
    ) -> SyncResult<VectorRecord> {
        let existing = with_timeout(
            "vector lookup",
            self.call_timeout,
            self.index.documents_for_task(&task.id),
        )
        .await?;

        for doc_id in &existing {
            with_timeout(
                "vector delete",
                self.call_timeout,
                self.index.delete_document(doc_id),
            )
            .await?;
            tracing::debug!(task_id = %task.id, %doc_id, "deleted previous vector");
        }

        let doc = VectorDocument::new(task, embedding, fingerprint);
        let inserted = with_timeout(
            "vector insert",
            self.call_timeout,
            self.index.insert_document(&doc),
        )
        .await;

        match inserted {
            Ok(()) => {
                tracing::debug!(task_id = %task.id, doc_id = %doc.doc_id, "inserted vector");
                Ok(doc.record())
            }
            Err(e) if !existing.is_empty() => Err(SyncError::PartialUpsertFailure {
                task_id: task.id.clone(),
                reason: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Rewrite the filter metadata of every live vector for `task`. Returns
    /// the refreshed record, or `None` when the task has no live vector.
    pub async fn refresh_metadata(
        &self,
        task: &Task,
        previous: &VectorRecord,
    ) -> SyncResult<Option<VectorRecord>> {
        let existing = with_timeout(
            "vector lookup",
            self.call_timeout,
            self.index.documents_for_task(&task.id),
        )
        .await?;
        let now = Utc::now();
        let mut updated = 0;
        for doc_id in &existing {
            let found = with_timeout(
                "vector metadata update",
                self.call_timeout,
                self.index.update_metadata(doc_id, task, now),
            )
            .await?;
            if found {
                updated += 1;
            }
        }
        if updated == 0 {
            return Ok(None);
        }
        tracing::debug!(task_id = %task.id, updated, "refreshed vector metadata");
        Ok(Some(VectorRecord {
            last_updated: now,
            ..previous.clone()
        }))
    }

    /// Remove every live vector for `task_id`; returns how many were deleted.
    pub async fn remove(&self, task_id: &str) -> SyncResult<usize> {
        let existing = with_timeout(
            "vector lookup",
            self.call_timeout,
            self.index.documents_for_task(task_id),
        )
        .await?;
        for doc_id in &existing {
            with_timeout(
                "vector delete",
                self.call_timeout,
                self.index.delete_document(doc_id),
            )
            .await?;
        }
        Ok(existing.len())
    }

    pub async fn search(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> SyncResult<Vec<SearchHit>> {
        with_timeout(
            "vector search",
            self.call_timeout,
            self.index.search(query, k, filters),
        )
        .await
    }

    pub async fn document_count(&self) -> SyncResult<usize> {
        with_timeout("vector count", self.call_timeout, self.index.document_count()).await
    }
}

// ============ SQLite backend ============

/// Vector index stored in the `task_vectors` table. `task_id` is UNIQUE, so
/// the database itself refuses a second live vector for a task.
pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn index_error(e: impl std::fmt::Display) -> SyncError {
    SyncError::Index(e.to_string())
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn documents_for_task(&self, task_id: &str) -> SyncResult<Vec<String>> {
        sqlx::query_scalar("SELECT doc_id FROM task_vectors WHERE task_id = ?")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(index_error)
    }

    async fn delete_document(&self, doc_id: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM task_vectors WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .map_err(index_error)?;
        Ok(())
    }

    async fn insert_document(&self, doc: &VectorDocument) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO task_vectors (
                doc_id, task_id, project_id, priority, due_date, is_completed,
                fingerprint, model, dims, updated_at, text, embedding
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.doc_id)
        .bind(&doc.task_id)
        .bind(&doc.project_id)
        .bind(i64::from(doc.priority.as_u8()))
        .bind(&doc.due_date)
        .bind(doc.is_completed)
        .bind(doc.fingerprint.to_hex())
        .bind(&doc.model)
        .bind(doc.embedding.len() as i64)
        .bind(doc.updated_at.to_rfc3339())
        .bind(&doc.text)
        .bind(vec_to_blob(&doc.embedding))
        .execute(&self.pool)
        .await
        .map_err(index_error)?;
        Ok(())
    }

    async fn update_metadata(
        &self,
        doc_id: &str,
        task: &Task,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_vectors
            SET project_id = ?, priority = ?, due_date = ?, is_completed = ?, updated_at = ?
            WHERE doc_id = ?
            "#,
        )
        .bind(&task.project_id)
        .bind(i64::from(task.priority.as_u8()))
        .bind(task.due.as_ref().map(|d| d.date.clone()))
        .bind(task.is_completed)
        .bind(updated_at.to_rfc3339())
        .bind(doc_id)
        .execute(&self.pool)
        .await
        .map_err(index_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> SyncResult<Vec<SearchHit>> {
        let rows = sqlx::query(
            r#"
            SELECT doc_id, task_id, project_id, priority, due_date, is_completed,
                   fingerprint, model, updated_at, text, embedding
            FROM task_vectors
            WHERE (? IS NULL OR project_id = ?)
              AND priority >= ?
              AND (? OR is_completed = 0)
            "#,
        )
        .bind(&filters.project_id)
        .bind(&filters.project_id)
        .bind(i64::from(filters.min_priority.unwrap_or_default().as_u8()))
        .bind(filters.include_completed)
        .fetch_all(&self.pool)
        .await
        .map_err(index_error)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let doc = row_to_document(row)?;
            let score = cosine_similarity(query, &doc.embedding);
            hits.push(SearchHit::from_document(&doc, score));
        }
        Ok(rank_hits(hits, k))
    }

    async fn document_count(&self) -> SyncResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_vectors")
            .fetch_one(&self.pool)
            .await
            .map_err(index_error)?;
        Ok(count as usize)
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> SyncResult<VectorDocument> {
    let priority: i64 = row.get("priority");
    let fingerprint: String = row.get("fingerprint");
    let updated_at: String = row.get("updated_at");
    let blob: Vec<u8> = row.get("embedding");
    Ok(VectorDocument {
        doc_id: row.get("doc_id"),
        task_id: row.get("task_id"),
        project_id: row.get("project_id"),
        priority: Priority::from_source(priority),
        due_date: row.get("due_date"),
        is_completed: row.get("is_completed"),
        fingerprint: fingerprint.parse().map_err(index_error)?,
        model: row.get("model"),
        text: row.get("text"),
        embedding: blob_to_vec(&blob),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(index_error)?,
    })
}

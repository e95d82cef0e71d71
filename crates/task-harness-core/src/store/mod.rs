//! Storage abstractions for Task Harness.
//!
//! Two stores take part in a sync run and each is owned by exactly one
//! trait:
//!
//! | Trait | Owns | Used for |
//! |-------|------|----------|
//! | [`VectorIndex`] | vector documents keyed by `doc_id` | delete-then-insert upserts, search |
//! | [`TaskRepository`] | canonical task/project rows and enrichment records | change detection, deletion diffing |
//!
//! Implementations must be `Send + Sync`; the coordinator shares them
//! across a bounded worker pool. Both traits return [`SyncResult`] so that
//! failures arrive already classified as retryable or not.

pub mod memory;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::embedding::Embedding;
use crate::error::SyncResult;
use crate::fingerprint::Fingerprint;
use crate::models::{EnrichedTask, Priority, Project, Task, VectorRecord};

/// One live vector in the index together with its filterable metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorDocument {
    pub doc_id: String,
    pub task_id: String,
    pub project_id: String,
    pub priority: Priority,
    pub due_date: Option<String>,
    pub is_completed: bool,
    pub fingerprint: Fingerprint,
    pub model: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub updated_at: DateTime<Utc>,
}

impl VectorDocument {
    /// Build a document for `task` under a freshly generated `doc_id`.
    pub fn new(task: &Task, embedding: &Embedding, fingerprint: Fingerprint) -> Self {
        Self {
            doc_id: uuid::Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            project_id: task.project_id.clone(),
            priority: task.priority,
            due_date: task.due.as_ref().map(|d| d.date.clone()),
            is_completed: task.is_completed,
            fingerprint,
            model: embedding.model.clone(),
            text: task.embedding_text(),
            embedding: embedding.vector.clone(),
            updated_at: Utc::now(),
        }
    }

    /// Copy the filterable fields of `task` onto this document. Text and
    /// embedding are untouched.
    pub fn apply_metadata(&mut self, task: &Task, updated_at: DateTime<Utc>) {
        self.project_id = task.project_id.clone();
        self.priority = task.priority;
        self.due_date = task.due.as_ref().map(|d| d.date.clone());
        self.is_completed = task.is_completed;
        self.updated_at = updated_at;
    }

    /// The bookkeeping record kept alongside the enriched task.
    pub fn record(&self) -> VectorRecord {
        VectorRecord {
            index_document_id: self.doc_id.clone(),
            embedding_model: self.model.clone(),
            last_updated: self.updated_at,
            fingerprint: self.fingerprint,
        }
    }
}

/// Metadata filters applied during vector search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    pub project_id: Option<String>,
    pub min_priority: Option<Priority>,
    pub include_completed: bool,
}

impl SearchFilters {
    pub fn matches(&self, doc: &VectorDocument) -> bool {
        if !self.include_completed && doc.is_completed {
            return false;
        }
        if let Some(project) = &self.project_id {
            if &doc.project_id != project {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if doc.priority < min {
                return false;
            }
        }
        true
    }
}

/// A ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub doc_id: String,
    pub task_id: String,
    pub project_id: String,
    pub priority: Priority,
    pub due_date: Option<String>,
    pub is_completed: bool,
    pub score: f32,
    pub text: String,
}

impl SearchHit {
    pub fn from_document(doc: &VectorDocument, score: f32) -> Self {
        Self {
            doc_id: doc.doc_id.clone(),
            task_id: doc.task_id.clone(),
            project_id: doc.project_id.clone(),
            priority: doc.priority,
            due_date: doc.due_date.clone(),
            is_completed: doc.is_completed,
            score,
            text: doc.text.clone(),
        }
    }
}

/// Sort hits by descending score, ties broken by task id, and keep `k`.
pub fn rank_hits(mut hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.task_id.cmp(&b.task_id))
    });
    hits.truncate(k);
    hits
}

/// Low-level vector index operations.
///
/// The index is addressed by `doc_id`; `task_id` is metadata that the
/// index must be able to look up. At most one document per task may be
/// live, and implementations reject an insert that would create a second
/// one.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Ids of every live document belonging to `task_id`.
    async fn documents_for_task(&self, task_id: &str) -> SyncResult<Vec<String>>;

    /// Delete a document. Deleting an unknown id succeeds.
    async fn delete_document(&self, doc_id: &str) -> SyncResult<()>;

    async fn insert_document(&self, doc: &VectorDocument) -> SyncResult<()>;

    /// Rewrite the filter metadata of a live document from `task` without
    /// touching its embedding. Returns `false` when `doc_id` is unknown.
    async fn update_metadata(
        &self,
        doc_id: &str,
        task: &Task,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<bool>;

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> SyncResult<Vec<SearchHit>>;

    async fn document_count(&self) -> SyncResult<usize>;
}

/// Persistence for canonical rows and prior enrichment state.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_previous_state`](TaskRepository::get_previous_state) | Last enrichment record for a task |
/// | [`save`](TaskRepository::save) | Replace the enrichment record and canonical row together |
/// | [`save_task`](TaskRepository::save_task) | Upsert only the canonical row |
/// | [`save_projects`](TaskRepository::save_projects) | Upsert canonical project rows |
/// | [`get_all_known_ids`](TaskRepository::get_all_known_ids) | Ids used for deletion diffing |
/// | [`clear_enrichment`](TaskRepository::clear_enrichment) | Drop the enrichment record, keep the canonical row |
/// | [`delete`](TaskRepository::delete) | Drop every row for a task |
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get_previous_state(&self, task_id: &str) -> SyncResult<Option<EnrichedTask>>;

    /// Replace the enrichment record for `enriched.task.id` and upsert its
    /// canonical task row in the same write.
    async fn save(&self, enriched: &EnrichedTask) -> SyncResult<()>;

    /// Upsert the canonical row. Returns `false` when the stored row was
    /// already identical and nothing was written.
    async fn save_task(&self, task: &Task) -> SyncResult<bool>;

    async fn save_projects(&self, projects: &[Project]) -> SyncResult<()>;

    /// Ids of every task with a canonical row or an enrichment record.
    async fn get_all_known_ids(&self) -> SyncResult<BTreeSet<String>>;

    /// Delete only the enrichment record. Unknown ids are a no-op.
    async fn clear_enrichment(&self, task_id: &str) -> SyncResult<()>;

    /// Delete the canonical row and enrichment record. Unknown ids are a
    /// no-op.
    async fn delete(&self, task_id: &str) -> SyncResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(task_id: &str, project: &str, priority: Priority, completed: bool) -> VectorDocument {
        let mut task = Task::new(task_id, project, "content");
        task.priority = priority;
        task.is_completed = completed;
        let fp = task.fingerprint();
        VectorDocument::new(&task, &Embedding::new(vec![1.0, 0.0], "test"), fp)
    }

    #[test]
    fn test_vector_document_record() {
        let d = doc("t1", "p1", Priority::High, false);
        let record = d.record();
        assert_eq!(record.index_document_id, d.doc_id);
        assert_eq!(record.embedding_model, "test");
        assert_eq!(record.fingerprint, d.fingerprint);
        assert_eq!(d.text, "Task: content\nDescription: ");
    }

    #[test]
    fn test_fresh_doc_ids() {
        let a = doc("t1", "p1", Priority::None, false);
        let b = doc("t1", "p1", Priority::None, false);
        assert_ne!(a.doc_id, b.doc_id);
    }

    #[test]
    fn test_filters() {
        let open = doc("t1", "p1", Priority::Medium, false);
        let done = doc("t2", "p1", Priority::Medium, true);

        let default = SearchFilters::default();
        assert!(default.matches(&open));
        assert!(!default.matches(&done));

        let with_done = SearchFilters {
            include_completed: true,
            ..Default::default()
        };
        assert!(with_done.matches(&done));

        let other_project = SearchFilters {
            project_id: Some("p2".into()),
            ..Default::default()
        };
        assert!(!other_project.matches(&open));

        let urgent_only = SearchFilters {
            min_priority: Some(Priority::Urgent),
            ..Default::default()
        };
        assert!(!urgent_only.matches(&open));
    }

    #[test]
    fn test_rank_hits() {
        let d = doc("t1", "p1", Priority::None, false);
        let mut low = SearchHit::from_document(&d, 0.1);
        low.task_id = "b".into();
        let mut high = SearchHit::from_document(&d, 0.9);
        high.task_id = "a".into();
        let ranked = rank_hits(vec![low, high], 1);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].task_id, "a");
    }
}

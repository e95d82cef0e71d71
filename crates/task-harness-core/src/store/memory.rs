//! In-memory [`VectorIndex`] and [`TaskRepository`] implementations.
//!
//! Both use `BTreeMap`s behind `std::sync::RwLock`. They back the tests,
//! which also use the snapshot accessors to compare store contents across
//! runs. The `--dry-run` planner reads the SQLite repository instead.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embedding::cosine_similarity;
use crate::error::{SyncError, SyncResult};
use crate::models::{EnrichedTask, Project, Task};

use super::{rank_hits, SearchFilters, SearchHit, TaskRepository, VectorDocument, VectorIndex};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory vector index.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    docs: RwLock<BTreeMap<String, VectorDocument>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// All live documents, ordered by `doc_id`.
    pub fn documents(&self) -> Vec<VectorDocument> {
        read(&self.docs).values().cloned().collect()
    }

    /// Live documents belonging to one task.
    pub fn documents_of(&self, task_id: &str) -> Vec<VectorDocument> {
        read(&self.docs)
            .values()
            .filter(|d| d.task_id == task_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn documents_for_task(&self, task_id: &str) -> SyncResult<Vec<String>> {
        Ok(read(&self.docs)
            .values()
            .filter(|d| d.task_id == task_id)
            .map(|d| d.doc_id.clone())
            .collect())
    }

    async fn delete_document(&self, doc_id: &str) -> SyncResult<()> {
        write(&self.docs).remove(doc_id);
        Ok(())
    }

    async fn insert_document(&self, doc: &VectorDocument) -> SyncResult<()> {
        let mut docs = write(&self.docs);
        if docs.values().any(|d| d.task_id == doc.task_id) {
            return Err(SyncError::Index(format!(
                "task {} already has a live vector",
                doc.task_id
            )));
        }
        docs.insert(doc.doc_id.clone(), doc.clone());
        Ok(())
    }

    async fn update_metadata(
        &self,
        doc_id: &str,
        task: &Task,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<bool> {
        match write(&self.docs).get_mut(doc_id) {
            Some(doc) => {
                doc.apply_metadata(task, updated_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> SyncResult<Vec<SearchHit>> {
        let hits = read(&self.docs)
            .values()
            .filter(|d| filters.matches(d))
            .map(|d| SearchHit::from_document(d, cosine_similarity(query, &d.embedding)))
            .collect();
        Ok(rank_hits(hits, k))
    }

    async fn document_count(&self) -> SyncResult<usize> {
        Ok(read(&self.docs).len())
    }
}

/// In-memory task repository.
#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: RwLock<BTreeMap<String, Task>>,
    enriched: RwLock<BTreeMap<String, EnrichedTask>>,
    projects: RwLock<BTreeMap<String, Project>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        read(&self.tasks).get(id).cloned()
    }

    pub fn enriched(&self, id: &str) -> Option<EnrichedTask> {
        read(&self.enriched).get(id).cloned()
    }

    pub fn tasks(&self) -> BTreeMap<String, Task> {
        read(&self.tasks).clone()
    }

    pub fn enriched_tasks(&self) -> BTreeMap<String, EnrichedTask> {
        read(&self.enriched).clone()
    }

    pub fn projects(&self) -> BTreeMap<String, Project> {
        read(&self.projects).clone()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn get_previous_state(&self, task_id: &str) -> SyncResult<Option<EnrichedTask>> {
        Ok(read(&self.enriched).get(task_id).cloned())
    }

    async fn save(&self, enriched: &EnrichedTask) -> SyncResult<()> {
        let mut tasks = write(&self.tasks);
        let mut records = write(&self.enriched);
        tasks.insert(enriched.task.id.clone(), enriched.task.clone());
        records.insert(enriched.task.id.clone(), enriched.clone());
        Ok(())
    }

    async fn save_task(&self, task: &Task) -> SyncResult<bool> {
        let mut tasks = write(&self.tasks);
        if tasks.get(&task.id) == Some(task) {
            return Ok(false);
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(true)
    }

    async fn save_projects(&self, projects: &[Project]) -> SyncResult<()> {
        let mut stored = write(&self.projects);
        for p in projects {
            stored.insert(p.id.clone(), p.clone());
        }
        Ok(())
    }

    async fn get_all_known_ids(&self) -> SyncResult<BTreeSet<String>> {
        let mut ids: BTreeSet<String> = read(&self.tasks).keys().cloned().collect();
        ids.extend(read(&self.enriched).keys().cloned());
        Ok(ids)
    }

    async fn clear_enrichment(&self, task_id: &str) -> SyncResult<()> {
        write(&self.enriched).remove(task_id);
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> SyncResult<()> {
        write(&self.tasks).remove(task_id);
        write(&self.enriched).remove(task_id);
        Ok(())
    }
}

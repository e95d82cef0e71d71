//! Per-task change detection and vector replacement.
//!
//! For each fetched task the processor compares its fingerprint with the
//! stored enrichment record. Matching fingerprints end processing with no
//! enrichment call. If only the index's filter fields moved (project or
//! completion), the live vector's metadata is rewritten in place.
//! Otherwise the task is enriched, its vector is swapped through the
//! [`VectorIndexAdapter`], and a fresh [`EnrichedTask`] is returned for the
//! coordinator to persist.
//!
//! Per task the order is always fingerprint, enrichment, vector upsert; the
//! repository write happens afterwards in the coordinator.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use task_harness_core::models::{EnrichedTask, Project, Task, TaskMetadata};
use task_harness_core::{SyncError, SyncResult};

use crate::enrichment::EnrichmentGateway;
use crate::retry::{with_timeout, RetryPolicy};
use crate::vector_index::VectorIndexAdapter;

/// What happened to one task.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Fingerprint, embedding model, and filter metadata match the stored
    /// record.
    Unchanged,
    /// Content unchanged but the vector's filter metadata was rewritten;
    /// the updated record must be persisted.
    Refreshed(EnrichedTask),
    /// Re-enriched and re-indexed; the record must be persisted.
    Enriched(EnrichedTask),
    /// The enrichment service refused the task; reason attached. Any
    /// previous vector has been removed.
    Rejected(String),
}

/// How a fetched task differs from its stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskChange {
    Unchanged,
    /// Only fields the index filters on changed.
    Metadata,
    /// New task, new content, or a different embedding model.
    Content,
}

pub struct TaskSyncProcessor {
    gateway: Arc<dyn EnrichmentGateway>,
    index: VectorIndexAdapter,
    upsert_retry: RetryPolicy,
    call_timeout: Duration,
}

impl TaskSyncProcessor {
    pub fn new(
        gateway: Arc<dyn EnrichmentGateway>,
        index: VectorIndexAdapter,
        upsert_retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            index,
            upsert_retry,
            call_timeout,
        }
    }

    pub fn index(&self) -> &VectorIndexAdapter {
        &self.index
    }

    pub fn gateway(&self) -> &Arc<dyn EnrichmentGateway> {
        &self.gateway
    }

    pub fn classify(&self, task: &Task, previous: Option<&EnrichedTask>) -> TaskChange {
        let Some(prev) = previous else {
            return TaskChange::Content;
        };
        let same_content = prev.fingerprint == task.fingerprint()
            && prev
                .vector
                .as_ref()
                .is_some_and(|v| v.embedding_model == self.gateway.model_name());
        if !same_content {
            TaskChange::Content
        } else if prev.task.project_id != task.project_id
            || prev.task.is_completed != task.is_completed
        {
            TaskChange::Metadata
        } else {
            TaskChange::Unchanged
        }
    }

    /// True when `previous` already reflects `task` under the current model.
    pub fn is_unchanged(&self, task: &Task, previous: Option<&EnrichedTask>) -> bool {
        self.classify(task, previous) == TaskChange::Unchanged
    }

    /// Returns the new record, or `None` when the task was skipped
    /// (unchanged, or rejected by the enrichment service).
    pub async fn process(
        &self,
        task: &Task,
        previous: Option<&EnrichedTask>,
        project: Option<&Project>,
    ) -> SyncResult<Option<EnrichedTask>> {
        match self.process_task(task, previous, project).await? {
            ProcessOutcome::Enriched(enriched) | ProcessOutcome::Refreshed(enriched) => {
                Ok(Some(enriched))
            }
            ProcessOutcome::Unchanged | ProcessOutcome::Rejected(_) => Ok(None),
        }
    }

    /// Like [`process`](Self::process) but keeps the reason a task produced
    /// no record.
    ///
    /// `EnrichmentUnavailable` and timeouts propagate so the caller can
    /// retry the task. Index failures are retried here with the same
    /// embedding before propagating.
    pub async fn process_task(
        &self,
        task: &Task,
        previous: Option<&EnrichedTask>,
        project: Option<&Project>,
    ) -> SyncResult<ProcessOutcome> {
        match (self.classify(task, previous), previous) {
            (TaskChange::Unchanged, _) => return Ok(ProcessOutcome::Unchanged),
            (TaskChange::Metadata, Some(prev)) => {
                if let Some(refreshed) = self.refresh(task, prev, project).await? {
                    return Ok(ProcessOutcome::Refreshed(refreshed));
                }
                tracing::debug!(task_id = %task.id, "no live vector to refresh; re-enriching");
            }
            _ => {}
        }
        let fingerprint = task.fingerprint();

        let enrichment = match with_timeout("enrich", self.call_timeout, self.gateway.enrich(task))
            .await
        {
            Ok(enrichment) => enrichment,
            Err(SyncError::EnrichmentRejected { reason, .. }) => {
                tracing::warn!(task_id = %task.id, %reason, "enrichment rejected task; leaving it un-enriched");
                let removed = self
                    .upsert_retry
                    .run(
                        || self.index.remove(&task.id),
                        |attempt, err| {
                            tracing::warn!(task_id = %task.id, attempt, error = %err, "retrying stale vector removal");
                        },
                    )
                    .await?;
                if removed > 0 {
                    tracing::info!(task_id = %task.id, removed, "removed stale vector of rejected task");
                }
                return Ok(ProcessOutcome::Rejected(reason));
            }
            Err(e) => return Err(e),
        };

        let record = self
            .upsert_retry
            .run(
                || self.index.upsert(task, &enrichment.embedding, fingerprint),
                |attempt, err| {
                    tracing::warn!(task_id = %task.id, attempt, error = %err, "retrying vector upsert");
                },
            )
            .await?;

        Ok(ProcessOutcome::Enriched(EnrichedTask {
            task: task.clone(),
            fingerprint,
            analysis: enrichment.analysis,
            vector: Some(record),
            metadata: TaskMetadata::derive(task, project),
            processed_at: Utc::now(),
        }))
    }

    /// Rewrite the live vector's filter metadata and carry the stored
    /// enrichment forward. `None` when there is no live vector to update.
    async fn refresh(
        &self,
        task: &Task,
        previous: &EnrichedTask,
        project: Option<&Project>,
    ) -> SyncResult<Option<EnrichedTask>> {
        let Some(vector) = previous.vector.as_ref() else {
            return Ok(None);
        };
        let refreshed = self
            .upsert_retry
            .run(
                || self.index.refresh_metadata(task, vector),
                |attempt, err| {
                    tracing::warn!(task_id = %task.id, attempt, error = %err, "retrying metadata refresh");
                },
            )
            .await?;
        Ok(refreshed.map(|record| EnrichedTask {
            task: task.clone(),
            fingerprint: previous.fingerprint,
            analysis: previous.analysis.clone(),
            vector: Some(record),
            metadata: TaskMetadata::derive(task, project),
            processed_at: previous.processed_at,
        }))
    }
}

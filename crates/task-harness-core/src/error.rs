//! Error taxonomy for the ingestion engine.
//!
//! Every failure that crosses a component boundary during a sync run is a
//! [`SyncError`]. The coordinator uses [`SyncError::is_retryable`] to decide
//! whether a failure gets another attempt (with backoff) or is final for
//! this run.

use std::time::Duration;

use thiserror::Error;

/// Result alias used by the store traits and sync components.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// A failure raised while fetching, enriching, indexing, or storing tasks.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    /// The task source failed in a way that may succeed later
    /// (network error, HTTP 429, HTTP 5xx).
    #[error("task source unavailable: {0}")]
    TransientSource(String),

    /// The task source refused the request or returned an undecodable
    /// payload. Retrying will not help.
    #[error("task source rejected request: {0}")]
    SourceRejected(String),

    /// The enrichment service could not be reached or timed out.
    #[error("enrichment unavailable for task {task_id}: {reason}")]
    EnrichmentUnavailable { task_id: String, reason: String },

    /// The enrichment service refused the task as malformed.
    #[error("enrichment rejected task {task_id}: {reason}")]
    EnrichmentRejected { task_id: String, reason: String },

    /// The old vector was deleted but the replacement could not be inserted.
    /// The task is temporarily unindexed; the whole upsert must be retried.
    #[error("vector upsert for task {task_id} deleted the old entry but insert failed: {reason}")]
    PartialUpsertFailure { task_id: String, reason: String },

    /// A vector index operation failed without changing index state.
    #[error("vector index error: {0}")]
    Index(String),

    /// Writing a task row failed.
    #[error("repository write failed for task {task_id}: {reason}")]
    RepositoryWrite { task_id: String, reason: String },

    /// Reading from the repository failed.
    #[error("repository error: {0}")]
    Repository(String),

    /// An external call did not complete within its deadline.
    #[error("{operation} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Another ingestion run holds the single-flight lock.
    #[error("an ingestion run is already in progress")]
    IngestionAlreadyRunning,

    /// The caller cancelled the run.
    #[error("ingestion cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether a later attempt of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientSource(_)
                | Self::EnrichmentUnavailable { .. }
                | Self::PartialUpsertFailure { .. }
                | Self::Index(_)
                | Self::RepositoryWrite { .. }
                | Self::Repository(_)
                | Self::Timeout { .. }
        )
    }

    /// Short machine-readable label, used in logs and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientSource(_) => "transient_source_error",
            Self::SourceRejected(_) => "source_rejected",
            Self::EnrichmentUnavailable { .. } => "enrichment_unavailable",
            Self::EnrichmentRejected { .. } => "enrichment_rejected",
            Self::PartialUpsertFailure { .. } => "partial_upsert_failure",
            Self::Index(_) => "index_error",
            Self::RepositoryWrite { .. } => "repository_write_error",
            Self::Repository(_) => "repository_error",
            Self::Timeout { .. } => "timeout",
            Self::IngestionAlreadyRunning => "ingestion_already_running",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::TransientSource("503".into()).is_retryable());
        assert!(SyncError::PartialUpsertFailure {
            task_id: "t1".into(),
            reason: "disk full".into()
        }
        .is_retryable());
        assert!(SyncError::Timeout {
            operation: "enrich",
            timeout: Duration::from_secs(1)
        }
        .is_retryable());

        assert!(!SyncError::SourceRejected("401".into()).is_retryable());
        assert!(!SyncError::EnrichmentRejected {
            task_id: "t1".into(),
            reason: "empty".into()
        }
        .is_retryable());
        assert!(!SyncError::IngestionAlreadyRunning.is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn test_timeout_message() {
        let err = SyncError::Timeout {
            operation: "fetch tasks",
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "fetch tasks timed out after 1500ms");
    }
}

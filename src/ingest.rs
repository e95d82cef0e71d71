//! Ingestion run orchestration.
//!
//! The [`IngestionCoordinator`] drives one sync run through the state
//! machine
//!
//! ```text
//! Idle → Fetching → Processing → Storing → Idle
//!            ↘          ↘           ↘
//!                     Error → Idle
//! ```
//!
//! | Phase | Work | Failure policy |
//! |-------|------|----------------|
//! | Fetching | all projects and tasks from the source | retry transient errors with backoff; exhaustion or rejection → `Error` |
//! | Processing | every task through [`TaskSyncProcessor`] on a bounded worker pool | per-task failures are retried, then recorded |
//! | Storing | enrichment records, canonical rows, deletions | each write retried individually, then recorded |
//!
//! Only one run may be active per process; see [`IngestionLock`]. Per-task
//! failures never abort the batch. A run always ends with an
//! [`IngestionSummary`], never a bare error, except for the immediate
//! [`SyncError::IngestionAlreadyRunning`] rejection.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use task_harness_core::models::{EnrichedTask, Project, Task};
use task_harness_core::store::TaskRepository;
use task_harness_core::{SyncError, SyncResult};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, IngestConfig};
use crate::enrichment::{create_gateway, EnrichmentGateway};
use crate::lock::{IngestionGuard, IngestionLock, Phase};
use crate::processor::{ProcessOutcome, TaskChange, TaskSyncProcessor};
use crate::progress::{ProgressReporter, SyncProgressEvent};
use crate::repository::SqliteTaskRepository;
use crate::retry::{with_timeout, RetryPolicy};
use crate::source::{create_source, TaskSource};
use crate::vector_index::{SqliteVectorIndex, VectorIndexAdapter};
use crate::db;

/// Retry, timeout, and concurrency settings for the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub retry: RetryPolicy,
    pub workers: usize,
    pub call_timeout: Duration,
    pub fetch_timeout: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(config),
            workers: config.workers.max(1),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Completed,
    Failed,
    Cancelled,
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestionSummary {
    pub status: RunStatus,
    pub fetched: usize,
    /// Tasks re-enriched, re-indexed, and durably stored.
    pub processed: usize,
    /// Tasks whose fingerprint matched the stored record.
    pub skipped: usize,
    /// Unchanged content whose project or completion moved; vector metadata
    /// rewritten in place without enrichment.
    pub refreshed: usize,
    /// Tasks the enrichment service refused this run.
    pub rejected: usize,
    pub failed: usize,
    pub deleted: usize,
    /// Task id → reason for every rejected or failed task.
    pub errors: BTreeMap<String, String>,
    /// Run-level failure that sent the run to `Error`.
    pub error: Option<String>,
}

impl IngestionSummary {
    fn aborted(status: RunStatus, err: &SyncError) -> Self {
        Self {
            status,
            error: Some(err.to_string()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// What a dry run found, without enriching or writing anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub fetched: usize,
    pub would_process: usize,
    pub would_refresh: usize,
    pub would_skip: usize,
    pub would_delete: Vec<String>,
}

pub struct IngestionCoordinator {
    source: Arc<dyn TaskSource>,
    repository: Arc<dyn TaskRepository>,
    processor: Arc<TaskSyncProcessor>,
    lock: IngestionLock,
    settings: CoordinatorSettings,
}

/// How a fetched task left the processing phase, for canonical-row writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Skipped,
    Rejected,
    Failed,
}

#[derive(Default)]
struct Collected {
    enriched: Vec<EnrichedTask>,
    refreshed: Vec<EnrichedTask>,
    canonical: Vec<(Task, Disposition)>,
    done: u64,
}

impl IngestionCoordinator {
    pub fn new(
        source: Arc<dyn TaskSource>,
        repository: Arc<dyn TaskRepository>,
        processor: Arc<TaskSyncProcessor>,
        lock: IngestionLock,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            source,
            repository,
            processor,
            lock,
            settings,
        }
    }

    pub fn lock(&self) -> &IngestionLock {
        &self.lock
    }

    /// Run one ingestion. Fails only with `IngestionAlreadyRunning`; every
    /// other outcome, including fatal ones, is reported in the summary.
    pub async fn run(
        &self,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> SyncResult<IngestionSummary> {
        let guard = self.lock.try_acquire()?;
        let summary = self.run_locked(&guard, progress, cancel).await;
        if guard.phase() == Phase::Error {
            guard.transition(Phase::Idle);
        }

        tracing::info!(
            status = ?summary.status,
            fetched = summary.fetched,
            processed = summary.processed,
            skipped = summary.skipped,
            refreshed = summary.refreshed,
            rejected = summary.rejected,
            failed = summary.failed,
            deleted = summary.deleted,
            retries = guard.retry_count(),
            "ingestion run finished"
        );
        Ok(summary)
    }

    async fn run_locked(
        &self,
        guard: &IngestionGuard,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> IngestionSummary {
        progress.report(SyncProgressEvent::Fetching);
        let (projects, tasks) = match self.fetch_cancellable(guard, cancel).await {
            Ok(fetched) => fetched,
            Err(err) => {
                tracing::error!(error = %err, "fetch failed; aborting run");
                guard.transition(Phase::Error);
                let status = if err == SyncError::Cancelled {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                };
                return IngestionSummary::aborted(status, &err);
            }
        };

        let mut summary = IngestionSummary {
            fetched: tasks.len(),
            ..Default::default()
        };
        let fetched_ids: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
        tracing::info!(tasks = tasks.len(), projects = projects.len(), "fetched source state");

        guard.transition(Phase::Processing);
        let (collected, cancelled) = self
            .process_all(tasks, &projects, &mut summary, progress, cancel)
            .await;

        guard.transition(Phase::Storing);
        self.store(&projects, collected, &mut summary, progress).await;

        if cancelled {
            tracing::warn!("run cancelled; skipping deletions");
            guard.transition(Phase::Error);
            summary.status = RunStatus::Cancelled;
            summary.error = Some(SyncError::Cancelled.to_string());
            return summary;
        }

        if let Err(err) = self.apply_deletions(&fetched_ids, &mut summary, progress).await {
            tracing::error!(error = %err, "could not compute deletions");
            guard.transition(Phase::Error);
            summary.status = RunStatus::Failed;
            summary.error = Some(err.to_string());
            return summary;
        }

        guard.transition(Phase::Idle);
        summary
    }

    async fn fetch_cancellable(
        &self,
        guard: &IngestionGuard,
        cancel: &CancellationToken,
    ) -> SyncResult<(Vec<Project>, Vec<Task>)> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            fetched = self.fetch(guard) => fetched.map(|(p, t)| (p, dedupe(t))),
        }
    }

    async fn fetch(&self, guard: &IngestionGuard) -> SyncResult<(Vec<Project>, Vec<Task>)> {
        self.settings
            .retry
            .run(
                || {
                    with_timeout("fetch", self.settings.fetch_timeout, async {
                        let projects = self.source.fetch_projects().await?;
                        let tasks = self.source.fetch_tasks().await?;
                        Ok((projects, tasks))
                    })
                },
                |attempt, err| {
                    let retries = guard.record_retry();
                    tracing::warn!(attempt, retries, error = %err, "fetch failed; backing off");
                },
            )
            .await
    }

    /// Fan tasks out to the worker pool. Returns what was collected and
    /// whether the run was cancelled before every task was started.
    async fn process_all(
        &self,
        tasks: Vec<Task>,
        projects: &[Project],
        summary: &mut IngestionSummary,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> (Collected, bool) {
        let total = tasks.len() as u64;
        let projects: HashMap<&str, &Project> =
            projects.iter().map(|p| (p.id.as_str(), p)).collect();
        let semaphore = Arc::new(Semaphore::new(self.settings.workers));
        let mut set: JoinSet<(Task, SyncResult<ProcessOutcome>)> = JoinSet::new();
        let mut in_flight: HashMap<String, Task> = HashMap::new();
        let mut collected = Collected::default();
        let mut cancelled = false;

        for task in tasks {
            let permit = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break None,
                    Some(joined) = set.join_next(), if !set.is_empty() => {
                        absorb(joined, &mut in_flight, &mut collected, summary, progress, total);
                    }
                    permit = semaphore.clone().acquire_owned() => break permit.ok(),
                }
            };
            let Some(permit) = permit else {
                cancelled = true;
                break;
            };

            let project = projects.get(task.project_id.as_str()).map(|p| (*p).clone());
            let worker = Worker {
                processor: self.processor.clone(),
                repository: self.repository.clone(),
                retry: self.settings.retry,
                call_timeout: self.settings.call_timeout,
            };
            in_flight.insert(task.id.clone(), task.clone());
            set.spawn(async move {
                let _permit = permit;
                let result = worker.process(&task, project.as_ref()).await;
                (task, result)
            });
        }

        if cancelled {
            tracing::warn!(in_flight = set.len(), "cancellation requested; draining in-flight tasks");
        }
        while let Some(joined) = set.join_next().await {
            absorb(joined, &mut in_flight, &mut collected, summary, progress, total);
        }

        // Anything still in flight belonged to a worker that panicked.
        for (id, task) in in_flight {
            tracing::error!(task_id = %id, "worker panicked");
            summary.failed += 1;
            summary.errors.insert(id, "worker panicked".to_string());
            collected.canonical.push((task, Disposition::Failed));
        }

        (collected, cancelled)
    }

    async fn store(
        &self,
        projects: &[Project],
        collected: Collected,
        summary: &mut IngestionSummary,
        progress: &dyn ProgressReporter,
    ) {
        let retry = self.settings.retry;
        let timeout = self.settings.call_timeout;

        if let Err(err) = retry
            .run(
                || with_timeout("save projects", timeout, self.repository.save_projects(projects)),
                |attempt, err| tracing::warn!(attempt, error = %err, "retrying project write"),
            )
            .await
        {
            tracing::error!(error = %err, "failed to store projects");
            summary.errors.insert("projects".to_string(), err.to_string());
        }

        let total = (collected.enriched.len()
            + collected.refreshed.len()
            + collected.canonical.len()) as u64;
        let mut n = 0u64;

        let records = collected
            .enriched
            .iter()
            .map(|e| (e, false))
            .chain(collected.refreshed.iter().map(|e| (e, true)));
        for (enriched, refreshed) in records {
            let task_id = enriched.task.id.as_str();
            let saved = retry
                .run(
                    || with_timeout("save task", timeout, self.repository.save(enriched)),
                    |attempt, err| {
                        tracing::warn!(%task_id, attempt, error = %err, "retrying repository write")
                    },
                )
                .await;
            match saved {
                Ok(()) if refreshed => summary.refreshed += 1,
                Ok(()) => summary.processed += 1,
                Err(err) => {
                    tracing::error!(%task_id, error = %err, "repository write failed");
                    summary.failed += 1;
                    summary.errors.insert(task_id.to_string(), err.to_string());
                }
            }
            n += 1;
            progress.report(SyncProgressEvent::Storing { n, total });
        }

        for (task, disposition) in &collected.canonical {
            if let Err(err) = self.write_canonical(task, *disposition).await {
                tracing::error!(task_id = %task.id, error = %err, "repository write failed");
                match disposition {
                    Disposition::Skipped => {
                        summary.skipped -= 1;
                        summary.failed += 1;
                        summary.errors.insert(task.id.clone(), err.to_string());
                    }
                    Disposition::Rejected => {
                        summary.rejected -= 1;
                        summary.failed += 1;
                        summary.errors.insert(task.id.clone(), err.to_string());
                    }
                    // Already counted; keep the processing error.
                    Disposition::Failed => {
                        summary
                            .errors
                            .entry(task.id.clone())
                            .or_insert_with(|| err.to_string());
                    }
                }
            }
            n += 1;
            progress.report(SyncProgressEvent::Storing { n, total });
        }
    }

    /// Upsert the canonical row. A rejected task also loses its enrichment
    /// record so the stale fingerprint cannot outlive its removed vector.
    async fn write_canonical(&self, task: &Task, disposition: Disposition) -> SyncResult<()> {
        let retry = self.settings.retry;
        let timeout = self.settings.call_timeout;
        let log_retry = |attempt: u32, err: &SyncError| {
            tracing::warn!(task_id = %task.id, attempt, error = %err, "retrying repository write")
        };

        if disposition == Disposition::Rejected {
            retry
                .run(
                    || {
                        with_timeout(
                            "clear enrichment",
                            timeout,
                            self.repository.clear_enrichment(&task.id),
                        )
                    },
                    log_retry,
                )
                .await?;
        }
        retry
            .run(
                || with_timeout("save task", timeout, self.repository.save_task(task)),
                log_retry,
            )
            .await?;
        Ok(())
    }

    /// Remove every known task that the source no longer returns: vector
    /// first, then repository rows. An error here means the deletion set
    /// itself could not be computed.
    async fn apply_deletions(
        &self,
        fetched_ids: &HashSet<String>,
        summary: &mut IngestionSummary,
        progress: &dyn ProgressReporter,
    ) -> SyncResult<()> {
        let retry = self.settings.retry;
        let timeout = self.settings.call_timeout;

        let known = retry
            .run(
                || with_timeout("load known ids", timeout, self.repository.get_all_known_ids()),
                |attempt, err| tracing::warn!(attempt, error = %err, "retrying known-id lookup"),
            )
            .await?;
        let stale: Vec<&String> = known.iter().filter(|id| !fetched_ids.contains(*id)).collect();
        if stale.is_empty() {
            return Ok(());
        }
        progress.report(SyncProgressEvent::Deleting {
            n: stale.len() as u64,
        });

        for task_id in stale {
            let index = self.processor.index();
            let removed = retry
                .run(
                    || index.remove(task_id),
                    |attempt, err| {
                        tracing::warn!(%task_id, attempt, error = %err, "retrying vector removal")
                    },
                )
                .await;
            let result = match removed {
                Ok(_) => {
                    retry
                        .run(
                            || with_timeout("delete task", timeout, self.repository.delete(task_id)),
                            |attempt, err| {
                                tracing::warn!(%task_id, attempt, error = %err, "retrying task deletion")
                            },
                        )
                        .await
                }
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {
                    tracing::info!(%task_id, "deleted task missing from source");
                    summary.deleted += 1;
                }
                Err(err) => {
                    tracing::error!(%task_id, error = %err, "deletion failed");
                    summary.failed += 1;
                    summary.errors.insert(task_id.clone(), err.to_string());
                }
            }
        }
        Ok(())
    }

    /// Fetch and compare fingerprints without enriching or writing.
    pub async fn plan(&self) -> SyncResult<SyncPlan> {
        let guard = self.lock.try_acquire()?;
        let (_projects, tasks) = self.fetch(&guard).await?;
        let tasks = dedupe(tasks);
        let timeout = self.settings.call_timeout;

        let mut plan = SyncPlan {
            fetched: tasks.len(),
            ..Default::default()
        };
        for task in &tasks {
            let previous = with_timeout(
                "load previous state",
                timeout,
                self.repository.get_previous_state(&task.id),
            )
            .await?;
            match self.processor.classify(task, previous.as_ref()) {
                TaskChange::Unchanged => plan.would_skip += 1,
                TaskChange::Metadata => plan.would_refresh += 1,
                TaskChange::Content => plan.would_process += 1,
            }
        }

        let fetched_ids: BTreeSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        let known = with_timeout(
            "load known ids",
            timeout,
            self.repository.get_all_known_ids(),
        )
        .await?;
        plan.would_delete = known
            .into_iter()
            .filter(|id| !fetched_ids.contains(id.as_str()))
            .collect();
        Ok(plan)
    }
}

/// The owned state one spawned worker needs.
struct Worker {
    processor: Arc<TaskSyncProcessor>,
    repository: Arc<dyn TaskRepository>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl Worker {
    async fn process(&self, task: &Task, project: Option<&Project>) -> SyncResult<ProcessOutcome> {
        let previous = self
            .retry
            .run(
                || {
                    with_timeout(
                        "load previous state",
                        self.call_timeout,
                        self.repository.get_previous_state(&task.id),
                    )
                },
                |attempt, err| {
                    tracing::warn!(task_id = %task.id, attempt, error = %err, "retrying previous-state lookup")
                },
            )
            .await?;

        self.retry
            .run(
                || self.processor.process_task(task, previous.as_ref(), project),
                |attempt, err| {
                    tracing::warn!(task_id = %task.id, attempt, error = %err, "retrying task")
                },
            )
            .await
    }
}

fn absorb(
    joined: std::result::Result<(Task, SyncResult<ProcessOutcome>), JoinError>,
    in_flight: &mut HashMap<String, Task>,
    collected: &mut Collected,
    summary: &mut IngestionSummary,
    progress: &dyn ProgressReporter,
    total: u64,
) {
    let (task, result) = match joined {
        Ok(done) => done,
        // Panicked workers are accounted for once the pool is drained.
        Err(_) => return,
    };
    in_flight.remove(&task.id);

    match result {
        Ok(ProcessOutcome::Unchanged) => {
            summary.skipped += 1;
            collected.canonical.push((task, Disposition::Skipped));
        }
        Ok(ProcessOutcome::Enriched(enriched)) => {
            tracing::debug!(task_id = %task.id, "task enriched and indexed");
            collected.enriched.push(enriched);
        }
        Ok(ProcessOutcome::Refreshed(enriched)) => {
            tracing::debug!(task_id = %task.id, "vector metadata refreshed");
            collected.refreshed.push(enriched);
        }
        Ok(ProcessOutcome::Rejected(reason)) => {
            summary.rejected += 1;
            summary.errors.insert(task.id.clone(), reason);
            collected.canonical.push((task, Disposition::Rejected));
        }
        Err(err) => {
            tracing::error!(task_id = %task.id, error = %err, "task failed after retries");
            summary.failed += 1;
            summary.errors.insert(task.id.clone(), err.to_string());
            collected.canonical.push((task, Disposition::Failed));
        }
    }

    collected.done += 1;
    progress.report(SyncProgressEvent::Processing {
        n: collected.done,
        total,
    });
}

/// Drop repeated task ids, keeping the last occurrence, so no two workers
/// ever touch the same task.
fn dedupe(tasks: Vec<Task>) -> Vec<Task> {
    let mut position: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Task> = Vec::with_capacity(tasks.len());
    for task in tasks {
        match position.get(&task.id) {
            Some(&i) => {
                tracing::warn!(task_id = %task.id, "source returned a task twice; keeping the last copy");
                out[i] = task;
            }
            None => {
                position.insert(task.id.clone(), out.len());
                out.push(task);
            }
        }
    }
    out
}

/// Wire a coordinator from configuration over an open database.
pub fn build_coordinator(
    config: &Config,
    pool: SqlitePool,
    lock: IngestionLock,
) -> Result<IngestionCoordinator> {
    let settings = CoordinatorSettings::from_config(&config.ingest);
    let source: Arc<dyn TaskSource> = Arc::from(create_source(&config.source)?);
    let gateway: Arc<dyn EnrichmentGateway> = Arc::from(create_gateway(&config.enrichment)?);
    let index = VectorIndexAdapter::new(
        Arc::new(SqliteVectorIndex::new(pool.clone())),
        settings.call_timeout,
    );
    let processor = TaskSyncProcessor::new(gateway, index, settings.retry, settings.call_timeout);
    Ok(IngestionCoordinator::new(
        source,
        Arc::new(SqliteTaskRepository::new(pool)),
        Arc::new(processor),
        lock,
        settings,
    ))
}

/// `taskh sync`: run one ingestion (or a dry run) and print the result.
///
/// Ctrl-C cancels the run: in-flight tasks finish, nothing new starts.
pub async fn run_sync(
    config: &Config,
    dry_run: bool,
    progress: &dyn ProgressReporter,
) -> Result<IngestionSummary> {
    let pool = db::connect(config).await?;
    let coordinator = build_coordinator(config, pool, IngestionLock::new())?;
    let source_name = config.source.provider.as_str();

    if dry_run {
        let plan = coordinator.plan().await?;
        println!("sync {} (dry-run)", source_name);
        println!("  fetched: {} tasks", plan.fetched);
        println!("  would process: {}", plan.would_process);
        println!("  would refresh: {}", plan.would_refresh);
        println!("  would skip: {}", plan.would_skip);
        println!("  would delete: {}", plan.would_delete.len());
        return Ok(IngestionSummary {
            fetched: plan.fetched,
            ..Default::default()
        });
    }

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; cancelling ingestion");
                cancel.cancel();
            }
        })
    };
    let summary = coordinator.run(progress, &cancel).await?;
    ctrl_c.abort();

    print_summary(source_name, &summary);
    Ok(summary)
}

pub fn print_summary(source_name: &str, summary: &IngestionSummary) {
    println!("sync {}", source_name);
    println!("  fetched: {} tasks", summary.fetched);
    println!("  processed: {}", summary.processed);
    println!("  skipped: {}", summary.skipped);
    println!("  refreshed: {}", summary.refreshed);
    println!("  rejected: {}", summary.rejected);
    println!("  failed: {}", summary.failed);
    println!("  deleted: {}", summary.deleted);
    if !summary.errors.is_empty() {
        println!("  errors:");
        for (task_id, reason) in &summary.errors {
            println!("    {}: {}", task_id, reason);
        }
    }
    match (&summary.status, &summary.error) {
        (RunStatus::Completed, _) => println!("ok"),
        (RunStatus::Cancelled, _) => println!("cancelled"),
        (RunStatus::Failed, Some(err)) => println!("failed: {}", err),
        (RunStatus::Failed, None) => println!("failed"),
    }
}

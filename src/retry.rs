//! Bounded exponential backoff and call deadlines.
//!
//! Attempt `n` (1-based) of a retry waits `min(base * 2^(n-1), max)`.
//! Only errors for which [`SyncError::is_retryable`] holds are retried.

use std::future::Future;
use std::time::Duration;
use task_harness_core::{SyncError, SyncResult};

use crate::config::IngestConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// No retries, no waiting.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// `max_retries` retries are spent. `on_retry` is called with the
    /// attempt number and error before each backoff sleep.
    pub async fn run<T, F, Fut>(
        &self,
        mut op: F,
        mut on_retry: impl FnMut(u32, &SyncError),
    ) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    on_retry(attempt, &err);
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Await `fut`, converting an elapsed deadline into [`SyncError::Timeout`].
pub async fn with_timeout<T>(
    operation: &'static str,
    limit: Duration,
    fut: impl Future<Output = SyncResult<T>>,
) -> SyncResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout {
            operation,
            timeout: limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base: Duration::from_millis(500),
            max: Duration::from_millis(1500),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(500));
        assert_eq!(p.backoff(2), Duration::from_millis(1000));
        assert_eq!(p.backoff(3), Duration::from_millis(1500));
        assert_eq!(p.backoff(40), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let started = tokio::time::Instant::now();

        let result = policy()
            .run(
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SyncError::TransientSource("503".into()))
                    } else {
                        Ok("done")
                    }
                },
                |attempt, _| retries.push(attempt),
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: SyncResult<()> = policy()
            .run(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::Index("locked".into()))
                },
                |_, _| {},
            )
            .await;
        assert!(matches!(result, Err(SyncError::Index(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: SyncResult<()> = policy()
            .run(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::SourceRejected("401".into()))
                },
                |_, _| {},
            )
            .await;
        assert!(matches!(result, Err(SyncError::SourceRejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_elapses() {
        let result: SyncResult<()> = with_timeout("enrich", Duration::from_secs(2), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert_eq!(
            result,
            Err(SyncError::Timeout {
                operation: "enrich",
                timeout: Duration::from_secs(2)
            })
        );
    }
}

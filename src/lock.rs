//! Process-wide single-flight lock and run state.
//!
//! [`IngestionLock`] holds the ephemeral [`IngestionRun`] state shared by
//! every caller in the process (CLI, HTTP server). Acquiring it yields an
//! [`IngestionGuard`]; dropping the guard resets the run to `Idle` with the
//! lock released and the retry count cleared, on every exit path including
//! panics and early `?` returns. Nothing is persisted, so a crashed process
//! leaves no stale lock behind.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use task_harness_core::{SyncError, SyncResult};

/// Coordinator state machine phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Fetching,
    Processing,
    Storing,
    Error,
}

impl Phase {
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Idle, Fetching)
                | (Fetching, Processing)
                | (Processing, Storing)
                | (Storing, Idle)
                | (Fetching, Error)
                | (Processing, Error)
                | (Storing, Error)
                | (Error, Idle)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Fetching => "fetching",
            Phase::Processing => "processing",
            Phase::Storing => "storing",
            Phase::Error => "error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ephemeral state of the current (or absent) ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestionRun {
    pub held: bool,
    pub retry_count: u32,
    pub phase: Phase,
}

#[derive(Debug, Clone, Default)]
pub struct IngestionLock {
    state: Arc<Mutex<IngestionRun>>,
}

impl IngestionLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IngestionRun> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lock and enter `Fetching`, or fail immediately when another
    /// run holds it.
    pub fn try_acquire(&self) -> SyncResult<IngestionGuard> {
        let mut run = self.lock();
        if run.held {
            return Err(SyncError::IngestionAlreadyRunning);
        }
        *run = IngestionRun {
            held: true,
            retry_count: 0,
            phase: Phase::Fetching,
        };
        tracing::info!(from = %Phase::Idle, to = %Phase::Fetching, "phase transition");
        Ok(IngestionGuard { lock: self.clone() })
    }

    pub fn snapshot(&self) -> IngestionRun {
        *self.lock()
    }

    pub fn is_held(&self) -> bool {
        self.lock().held
    }
}

/// Proof of holding the ingestion lock. Releases it on drop.
#[derive(Debug)]
pub struct IngestionGuard {
    lock: IngestionLock,
}

impl IngestionGuard {
    pub fn phase(&self) -> Phase {
        self.lock.lock().phase
    }

    /// Move to `next`. Illegal transitions are refused and logged.
    pub fn transition(&self, next: Phase) -> bool {
        let mut run = self.lock.lock();
        let from = run.phase;
        if !from.can_transition_to(next) {
            tracing::error!(%from, to = %next, "illegal phase transition refused");
            return false;
        }
        run.phase = next;
        tracing::info!(%from, to = %next, "phase transition");
        true
    }

    /// Count one top-level retry and return the new total.
    pub fn record_retry(&self) -> u32 {
        let mut run = self.lock.lock();
        run.retry_count += 1;
        run.retry_count
    }

    pub fn retry_count(&self) -> u32 {
        self.lock.lock().retry_count
    }
}

impl Drop for IngestionGuard {
    fn drop(&mut self) {
        let mut run = self.lock.lock();
        if run.phase != Phase::Idle {
            tracing::debug!(from = %run.phase, "resetting ingestion run on release");
        }
        *run = IngestionRun::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_rejected() {
        let lock = IngestionLock::new();
        let guard = lock.try_acquire().unwrap();
        assert!(lock.is_held());
        assert_eq!(guard.phase(), Phase::Fetching);
        assert_eq!(
            lock.clone().try_acquire().unwrap_err(),
            SyncError::IngestionAlreadyRunning
        );
    }

    #[test]
    fn test_drop_resets_state() {
        let lock = IngestionLock::new();
        {
            let guard = lock.try_acquire().unwrap();
            guard.record_retry();
            guard.record_retry();
            assert!(guard.transition(Phase::Error));
            assert_eq!(lock.snapshot().retry_count, 2);
        }
        assert_eq!(lock.snapshot(), IngestionRun::default());
        assert!(lock.try_acquire().is_ok());
    }

    #[test]
    fn test_release_on_panic() {
        let lock = IngestionLock::new();
        let cloned = lock.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.try_acquire().unwrap();
            panic!("worker blew up");
        });
        assert!(result.is_err());
        assert!(!lock.is_held());
    }

    #[test]
    fn test_transition_table() {
        use Phase::*;
        assert!(Idle.can_transition_to(Fetching));
        assert!(Fetching.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Storing));
        assert!(Storing.can_transition_to(Idle));
        assert!(Error.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Error));
        assert!(!Fetching.can_transition_to(Storing));
        assert!(!Error.can_transition_to(Fetching));
    }

    #[test]
    fn test_illegal_transition_is_refused() {
        let lock = IngestionLock::new();
        let guard = lock.try_acquire().unwrap();
        assert!(!guard.transition(Phase::Storing));
        assert_eq!(guard.phase(), Phase::Fetching);
    }
}

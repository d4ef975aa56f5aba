//! Error taxonomy.
//!
//! Three layers, matching who sees them:
//! - [`EngineError`]: returned to callers of the client facade.
//! - [`StoreError`]: returned by the job store; insert paths surface it,
//!   claim/report paths log it and retry on the next poll tick.
//! - [`JobError`]: returned by workers to steer the dispatcher (fail,
//!   snooze, cancel).

use std::time::Duration;

use thiserror::Error;

use crate::domain::{JobId, JobState};

/// Client-facing errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no worker registered for kind '{0}'")]
    UnknownKind(String),

    #[error("worker already registered for kind '{0}'")]
    DuplicateKind(String),

    #[error("invalid job: {0}")]
    Validation(String),

    #[error("client is not stopped")]
    NotStopped,

    #[error("client is not running")]
    NotRunning,

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),

    /// The row is not `Running` under the caller's claim. Raised when a
    /// transition races a lease reclaim or a duplicate report; the caller
    /// logs it and leaves the row to its current owner.
    #[error("job {id} is not owned by this claim (state: {state:?})")]
    Conflict { id: JobId, state: JobState },

    /// Transient storage failure; the store is assumed eventually available.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors a worker returns from `execute` to steer the dispatcher.
#[derive(Debug, Error)]
pub enum JobError {
    /// The attempt failed. Retried with backoff while attempts remain,
    /// then discarded.
    #[error("{0}")]
    Failure(String),

    /// Re-run later without consuming the attempt.
    #[error("snoozed for {0:?}")]
    Snooze(Duration),

    /// Discard immediately, skipping remaining retries.
    #[error("cancelled: {0}")]
    Cancel(String),
}

impl JobError {
    pub fn failure(msg: impl Into<String>) -> Self {
        JobError::Failure(msg.into())
    }

    pub fn snooze(delay: Duration) -> Self {
        JobError::Snooze(delay)
    }

    pub fn cancel(reason: impl Into<String>) -> Self {
        JobError::Cancel(reason.into())
    }
}

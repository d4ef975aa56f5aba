//! Lifecycle events.
//!
//! Events are ephemeral values describing a job transition, published to the
//! event bus as they happen. They are never persisted.

use serde::{Deserialize, Serialize};

use super::job::JobRow;

/// The kind of transition an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The job finished successfully.
    Completed,

    /// An attempt failed; the job was rescheduled for retry.
    Failed,

    /// The worker asked to be re-run later without consuming the attempt.
    Snoozed,

    /// The job failed permanently (retries exhausted, decode failure, or
    /// cancellation).
    Discarded,
}

/// An immutable snapshot of a job transition.
///
/// `job` is the row as it looked right after the transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: EventKind,
    pub job: JobRow,
}

impl JobEvent {
    pub fn new(kind: EventKind, job: JobRow) -> Self {
        Self { kind, job }
    }

    pub fn completed(job: JobRow) -> Self {
        Self::new(EventKind::Completed, job)
    }

    pub fn failed(job: JobRow) -> Self {
        Self::new(EventKind::Failed, job)
    }

    pub fn snoozed(job: JobRow) -> Self {
        Self::new(EventKind::Snoozed, job)
    }

    pub fn discarded(job: JobRow) -> Self {
        Self::new(EventKind::Discarded, job)
    }
}

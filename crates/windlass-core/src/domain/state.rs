//! Job state machine.

use serde::{Deserialize, Serialize};

/// Job state.
///
/// State transitions:
/// - Available -> Running -> Completed
/// - Available -> Running -> Available (retry with backoff, or snooze)
/// - Available -> Running -> Discarded (max_attempts exhausted, decode
///   failure, or cancellation)
/// - Running -> Available (lease expired, reclaimed by the reaper)
///
/// `Completed` and `Discarded` are terminal; the store refuses any further
/// transition on a finalized row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed (initial state; also where retries return to).
    Available,

    /// Claimed by a worker and executing under a lease.
    Running,

    /// Finished successfully.
    Completed,

    /// Failed permanently. The row is kept for audit, never deleted.
    Discarded,
}

impl JobState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Discarded)
    }

    /// Is this row eligible for a claim (given its `scheduled_at` has passed)?
    pub fn is_claimable(self) -> bool {
        matches!(self, JobState::Available)
    }
}

//! Job row and insert specs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::JobId;
use super::state::JobState;

/// Queue used when insert options don't name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Default attempt budget for new jobs.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default priority. Smaller values are claimed first.
pub const DEFAULT_PRIORITY: i16 = 1;

/// A job row as persisted in the store.
///
/// Design:
/// - This is the single source of truth for one job's state.
/// - Mutation goes through the transition methods below; the store performs
///   the ownership checks before calling them, so an invalid transition is
///   rejected before any field changes.
/// - Rows are never deleted by the engine; finalized rows stay for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub id: JobId,

    /// Kind discriminator; selects the worker and the args schema.
    pub kind: String,

    /// Serialized arguments. Opaque to the engine, decoded by the worker.
    pub args: serde_json::Value,

    pub queue: String,
    pub state: JobState,

    /// Smaller values are claimed first.
    pub priority: i16,

    /// Earliest time the row may be claimed.
    pub scheduled_at: DateTime<Utc>,

    /// Number of claims so far (incremented when a worker claims the row).
    pub attempt: u32,

    /// Total attempt budget, including the first attempt.
    pub max_attempts: u32,

    pub last_error: Option<String>,

    /// Lease expiry while `Running`; a row past this is reclaimable.
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    /// Set when the row reaches a terminal state.
    pub finalized_at: Option<DateTime<Utc>>,
}

impl JobRow {
    /// Claim the row: Available -> Running with a lease stamp.
    pub fn claim(&mut self, lease_expires_at: DateTime<Utc>) {
        self.state = JobState::Running;
        self.attempt += 1;
        self.lease_expires_at = Some(lease_expires_at);
    }

    /// Running -> Completed.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.lease_expires_at = None;
        self.finalized_at = Some(now);
    }

    /// Running -> Available at a future time, recording the error.
    pub fn retry(&mut self, next_at: DateTime<Utc>, error: String) {
        self.state = JobState::Available;
        self.scheduled_at = next_at;
        self.last_error = Some(error);
        self.lease_expires_at = None;
    }

    /// Running -> Discarded, recording the final error.
    pub fn discard(&mut self, now: DateTime<Utc>, error: String) {
        self.state = JobState::Discarded;
        self.last_error = Some(error);
        self.lease_expires_at = None;
        self.finalized_at = Some(now);
    }

    /// Running -> Available at a future time without consuming the attempt.
    ///
    /// A snooze is a reschedule, not a failure: the claim's attempt
    /// increment is undone and `last_error` is left untouched.
    pub fn snooze(&mut self, next_at: DateTime<Utc>) {
        self.state = JobState::Available;
        self.scheduled_at = next_at;
        self.attempt = self.attempt.saturating_sub(1);
        self.lease_expires_at = None;
    }

    /// Running -> Available after lease expiry.
    ///
    /// The attempt counter keeps the crashed attempt's increment.
    pub fn release_expired(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Available;
        self.scheduled_at = now;
        self.lease_expires_at = None;
    }

    /// Has the lease expired as of `now`?
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Running
            && self.lease_expires_at.is_some_and(|at| at <= now)
    }
}

/// Options recognized at insert time.
///
/// Unset fields fall back to the defaults above.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsertOpts {
    pub queue: Option<String>,
    pub priority: Option<i16>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
}

impl InsertOpts {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }
}

/// A job to be inserted: kind, serialized args, options.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: String,
    pub args: serde_json::Value,
    pub opts: InsertOpts,
}

impl NewJob {
    pub fn new(kind: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            args,
            opts: InsertOpts::default(),
        }
    }

    pub fn with_opts(mut self, opts: InsertOpts) -> Self {
        self.opts = opts;
        self
    }

    /// Materialize a fresh `Available` row, resolving option defaults.
    pub fn into_row(self, id: JobId, now: DateTime<Utc>) -> JobRow {
        JobRow {
            id,
            kind: self.kind,
            args: self.args,
            queue: self.opts.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            state: JobState::Available,
            priority: self.opts.priority.unwrap_or(DEFAULT_PRIORITY),
            scheduled_at: self.opts.scheduled_at.unwrap_or(now),
            attempt: 0,
            max_attempts: self.opts.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            last_error: None,
            lease_expires_at: None,
            created_at: now,
            finalized_at: None,
        }
    }
}

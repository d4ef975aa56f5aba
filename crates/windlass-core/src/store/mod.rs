//! Job record store: the storage contract and the in-memory implementation.

mod memory;
mod retry;

pub use memory::MemoryStore;
pub use retry::RetryPolicy;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::domain::{JobId, JobRow, NewJob};
use crate::error::StoreError;
use crate::observability::JobCounts;

/// An open insert transaction.
///
/// Rows staged with [`StoreTx::insert`] are invisible to claimers until
/// [`StoreTx::commit`]; dropping the transaction (or calling
/// [`StoreTx::rollback`]) discards them without a trace.
#[async_trait]
pub trait StoreTx: Send {
    /// Stage a row. The returned snapshot carries the assigned ID, but the
    /// row does not exist for anyone else until commit.
    fn insert(&mut self, new: NewJob) -> Result<JobRow, StoreError>;

    /// Publish all staged rows atomically.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard all staged rows.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// The storage contract the engine requires.
///
/// Any store offering atomic commit visibility and mutually-exclusive claims
/// qualifies. A SQL-backed implementation would claim with
/// `SELECT ... FOR UPDATE SKIP LOCKED` so concurrent claimers never block on
/// each other's candidate rows; [`MemoryStore`] gets the same exclusion from
/// a single state lock.
///
/// Transition methods (`complete`, `retry`, `discard`, `snooze`) take the
/// claimer's `attempt` as an ownership token: they fail with
/// [`StoreError::Conflict`] unless the row is `Running` at exactly that
/// attempt, so a report arriving after a lease reclaim can never clobber
/// another claimer's work.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Open an insert transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    /// Insert one row in an implicit transaction (visible immediately).
    async fn insert(&self, new: NewJob) -> Result<JobRow, StoreError>;

    /// Atomically claim up to `limit` ready rows from `queue`.
    ///
    /// Ready means `Available` with `scheduled_at <= now`. Claim order is
    /// `(priority, scheduled_at, insertion sequence)`, with a strict
    /// insertion-order tie-break. Claimed rows transition to `Running` with
    /// a lease of `lease` from now.
    async fn claim_batch(
        &self,
        queue: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<JobRow>, StoreError>;

    /// Running -> Completed.
    async fn complete(&self, id: JobId, attempt: u32) -> Result<JobRow, StoreError>;

    /// Running -> Available at `next_at`, recording the attempt's error.
    async fn retry(
        &self,
        id: JobId,
        attempt: u32,
        next_at: DateTime<Utc>,
        error: &str,
    ) -> Result<JobRow, StoreError>;

    /// Running -> Discarded, recording the final error.
    async fn discard(&self, id: JobId, attempt: u32, error: &str) -> Result<JobRow, StoreError>;

    /// Running -> Available at `next_at` without consuming the attempt.
    async fn snooze(
        &self,
        id: JobId,
        attempt: u32,
        next_at: DateTime<Utc>,
    ) -> Result<JobRow, StoreError>;

    /// Requeue every `Running` row whose lease expired at or before `now`.
    /// Returns the reclaimed rows.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobRow>, StoreError>;

    /// Fetch a row snapshot.
    async fn get(&self, id: JobId) -> Result<JobRow, StoreError>;

    /// Row counts by state.
    async fn counts(&self) -> Result<JobCounts, StoreError>;

    /// Notified whenever rows become visible (insert commit, retry,
    /// snooze, reclaim). Dispatchers wait on this to pick up work without
    /// spinning; the poll interval is the fallback for missed signals.
    fn ready_notify(&self) -> Arc<Notify>;
}

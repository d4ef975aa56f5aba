//! In-memory store implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use super::{JobStore, StoreTx};
use crate::domain::{JobId, JobRow, JobState, NewJob};
use crate::error::StoreError;
use crate::observability::JobCounts;

/// A stored row plus its visibility sequence number.
///
/// `seq` is assigned when the row becomes visible (commit time), so the
/// claim tie-break reflects arrival order as observed by claimers, not the
/// order transactions were opened.
#[derive(Debug, Clone)]
struct StoredJob {
    row: JobRow,
    seq: u64,
}

/// In-memory store state.
struct MemoryState {
    /// All rows (single source of truth).
    jobs: HashMap<JobId, StoredJob>,

    /// Next visibility sequence number.
    next_seq: u64,
}

impl MemoryState {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            next_seq: 0,
        }
    }

    fn publish(&mut self, row: JobRow) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.insert(row.id, StoredJob { row, seq });
    }

    /// Get the row mutably, enforcing the claim-ownership token.
    fn owned_running(&mut self, id: JobId, attempt: u32) -> Result<&mut JobRow, StoreError> {
        let stored = self.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if stored.row.state != JobState::Running || stored.row.attempt != attempt {
            return Err(StoreError::Conflict {
                id,
                state: stored.row.state,
            });
        }
        Ok(&mut stored.row)
    }
}

/// In-memory transactional job store.
///
/// All state lives behind a single async mutex; a claim holds the lock for
/// the whole select-and-transition, which gives the same mutual exclusion a
/// SQL store would get from `FOR UPDATE SKIP LOCKED`. Nothing awaits while
/// holding the lock, and notifications go out after it is released.
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::new())),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(lease)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(Box::new(MemoryTx {
            staged: Vec::new(),
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
        }))
    }

    async fn insert(&self, new: NewJob) -> Result<JobRow, StoreError> {
        let row = new.into_row(JobId::generate(), Utc::now());
        let snapshot = row.clone();
        {
            let mut state = self.state.lock().await;
            state.publish(row);
        }
        self.notify.notify_waiters();
        Ok(snapshot)
    }

    async fn claim_batch(
        &self,
        queue: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<JobRow>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let mut state = self.state.lock().await;

        // Ready rows for this queue, in claim order: priority, then
        // scheduled_at, then visibility sequence (strict insertion-order
        // tie-break).
        let mut ready: Vec<(i16, DateTime<Utc>, u64, JobId)> = state
            .jobs
            .values()
            .filter(|s| {
                s.row.queue == queue && s.row.state.is_claimable() && s.row.scheduled_at <= now
            })
            .map(|s| (s.row.priority, s.row.scheduled_at, s.seq, s.row.id))
            .collect();
        ready.sort_unstable();

        let expires = lease_expiry(now, lease);
        let mut claimed = Vec::with_capacity(limit.min(ready.len()));
        for (_, _, _, id) in ready.into_iter().take(limit) {
            if let Some(stored) = state.jobs.get_mut(&id) {
                stored.row.claim(expires);
                claimed.push(stored.row.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: JobId, attempt: u32) -> Result<JobRow, StoreError> {
        let mut state = self.state.lock().await;
        let row = state.owned_running(id, attempt)?;
        row.complete(Utc::now());
        Ok(row.clone())
    }

    async fn retry(
        &self,
        id: JobId,
        attempt: u32,
        next_at: DateTime<Utc>,
        error: &str,
    ) -> Result<JobRow, StoreError> {
        let snapshot = {
            let mut state = self.state.lock().await;
            let row = state.owned_running(id, attempt)?;
            row.retry(next_at, error.to_string());
            row.clone()
        };
        self.notify.notify_waiters();
        Ok(snapshot)
    }

    async fn discard(&self, id: JobId, attempt: u32, error: &str) -> Result<JobRow, StoreError> {
        let mut state = self.state.lock().await;
        let row = state.owned_running(id, attempt)?;
        row.discard(Utc::now(), error.to_string());
        Ok(row.clone())
    }

    async fn snooze(
        &self,
        id: JobId,
        attempt: u32,
        next_at: DateTime<Utc>,
    ) -> Result<JobRow, StoreError> {
        let snapshot = {
            let mut state = self.state.lock().await;
            let row = state.owned_running(id, attempt)?;
            row.snooze(next_at);
            row.clone()
        };
        self.notify.notify_waiters();
        Ok(snapshot)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobRow>, StoreError> {
        let reclaimed = {
            let mut state = self.state.lock().await;
            let ids: Vec<JobId> = state
                .jobs
                .values()
                .filter(|s| s.row.lease_expired(now))
                .map(|s| s.row.id)
                .collect();

            let mut reclaimed = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(stored) = state.jobs.get_mut(&id) {
                    stored.row.release_expired(now);
                    reclaimed.push(stored.row.clone());
                }
            }
            reclaimed
        };

        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed expired leases");
            self.notify.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn get(&self, id: JobId) -> Result<JobRow, StoreError> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&id)
            .map(|s| s.row.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn counts(&self) -> Result<JobCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = JobCounts::default();
        for stored in state.jobs.values() {
            match stored.row.state {
                JobState::Available => counts.available += 1,
                JobState::Running => counts.running += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Discarded => counts.discarded += 1,
            }
        }
        Ok(counts)
    }

    fn ready_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}

/// Insert transaction for [`MemoryStore`].
///
/// Staged rows live only in this struct until commit; dropping it without
/// committing is a rollback.
struct MemoryTx {
    staged: Vec<JobRow>,
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<Notify>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    fn insert(&mut self, new: NewJob) -> Result<JobRow, StoreError> {
        let row = new.into_row(JobId::generate(), Utc::now());
        self.staged.push(row.clone());
        Ok(row)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let published = !self.staged.is_empty();
        {
            let mut state = self.state.lock().await;
            for row in self.staged {
                state.publish(row);
            }
        }
        if published {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(30);

    fn store() -> MemoryStore {
        MemoryStore::new()
    }

    fn job(kind: &str) -> NewJob {
        NewJob::new(kind, json!({}))
    }

    #[tokio::test]
    async fn insert_is_visible_immediately() {
        let store = store();
        let row = store.insert(job("a")).await.unwrap();

        let claimed = store.claim_batch("default", 10, LEASE).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, row.id);
        assert_eq!(claimed[0].state, JobState::Running);
        assert_eq!(claimed[0].attempt, 1);
    }

    #[tokio::test]
    async fn rolled_back_rows_are_never_claimable() {
        let store = store();

        let mut tx = store.begin().await.unwrap();
        tx.insert(job("a")).unwrap();
        tx.insert(job("b")).unwrap();
        tx.rollback().await.unwrap();

        let claimed = store.claim_batch("default", 10, LEASE).await.unwrap();
        assert!(claimed.is_empty());
        assert_eq!(store.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn committed_rows_become_visible_atomically() {
        let store = store();

        let mut tx = store.begin().await.unwrap();
        tx.insert(job("a")).unwrap();
        tx.insert(job("b")).unwrap();

        // Still invisible while the transaction is open.
        assert!(store.claim_batch("default", 10, LEASE).await.unwrap().is_empty());

        tx.commit().await.unwrap();

        let claimed = store.claim_batch("default", 10, LEASE).await.unwrap();
        assert_eq!(claimed.len(), 2);
    }

    #[tokio::test]
    async fn dropping_a_transaction_is_a_rollback() {
        let store = store();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert(job("a")).unwrap();
        }
        assert_eq!(store.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn claim_respects_priority_then_schedule_then_insertion() {
        let store = store();
        let now = Utc::now();
        let earlier = now - TimeDelta::seconds(60);

        let low = store
            .insert(job("low").with_opts(crate::domain::InsertOpts::default().priority(5)))
            .await
            .unwrap();
        let first = store.insert(job("first")).await.unwrap();
        let second = store.insert(job("second")).await.unwrap();
        let early = store
            .insert(job("early").with_opts(crate::domain::InsertOpts::default().scheduled_at(earlier)))
            .await
            .unwrap();

        let claimed = store.claim_batch("default", 10, LEASE).await.unwrap();
        let ids: Vec<JobId> = claimed.iter().map(|r| r.id).collect();

        // Priority 1 first (earliest scheduled_at leads, then insertion
        // order), priority 5 last.
        assert_eq!(ids, vec![early.id, first.id, second.id, low.id]);
    }

    #[tokio::test]
    async fn claim_skips_future_scheduled_rows() {
        let store = store();
        let future = Utc::now() + TimeDelta::minutes(5);
        store
            .insert(job("later").with_opts(crate::domain::InsertOpts::default().scheduled_at(future)))
            .await
            .unwrap();

        assert!(store.claim_batch("default", 10, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_is_mutually_exclusive() {
        let store = Arc::new(store());
        for _ in 0..20 {
            store.insert(job("a")).await.unwrap();
        }

        let (a, b) = tokio::join!(
            store.claim_batch("default", 20, LEASE),
            store.claim_batch("default", 20, LEASE),
        );
        let a = a.unwrap();
        let b = b.unwrap();

        assert_eq!(a.len() + b.len(), 20);
        for row in &a {
            assert!(!b.iter().any(|other| other.id == row.id));
        }
    }

    #[tokio::test]
    async fn complete_requires_the_claims_attempt() {
        let store = store();
        store.insert(job("a")).await.unwrap();
        let claimed = store.claim_batch("default", 1, LEASE).await.unwrap();
        let row = &claimed[0];

        // Wrong attempt token: conflict.
        let err = store.complete(row.id, row.attempt + 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        // Right token: completes.
        let done = store.complete(row.id, row.attempt).await.unwrap();
        assert_eq!(done.state, JobState::Completed);

        // Terminal rows stay terminal.
        let err = store.complete(row.id, row.attempt).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn reclaim_requeues_expired_leases_only() {
        let store = store();
        store.insert(job("a")).await.unwrap();
        store.insert(job("b")).await.unwrap();

        let claimed = store
            .claim_batch("default", 1, Duration::from_secs(0))
            .await
            .unwrap();
        let expired = claimed[0].id;
        store.claim_batch("default", 1, LEASE).await.unwrap();

        let reclaimed = store.reclaim_expired(Utc::now()).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, expired);
        assert_eq!(reclaimed[0].state, JobState::Available);
        // The crashed attempt stays counted.
        assert_eq!(reclaimed[0].attempt, 1);
    }

    #[tokio::test]
    async fn stale_report_after_reclaim_is_a_conflict() {
        let store = store();
        store.insert(job("a")).await.unwrap();

        let claimed = store
            .claim_batch("default", 1, Duration::from_secs(0))
            .await
            .unwrap();
        let row = &claimed[0];

        store.reclaim_expired(Utc::now()).await.unwrap();

        // The original claimer comes back after losing its lease.
        let err = store.complete(row.id, row.attempt).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn retry_reschedules_with_error() {
        let store = store();
        store.insert(job("a")).await.unwrap();
        let claimed = store.claim_batch("default", 1, LEASE).await.unwrap();
        let row = &claimed[0];

        let next_at = Utc::now() + TimeDelta::seconds(10);
        let retried = store
            .retry(row.id, row.attempt, next_at, "boom")
            .await
            .unwrap();

        assert_eq!(retried.state, JobState::Available);
        assert_eq!(retried.scheduled_at, next_at);
        assert_eq!(retried.last_error.as_deref(), Some("boom"));
        assert_eq!(retried.attempt, 1);

        // Not claimable until next_at.
        assert!(store.claim_batch("default", 1, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snooze_does_not_consume_the_attempt() {
        let store = store();
        store.insert(job("a")).await.unwrap();
        let claimed = store.claim_batch("default", 1, LEASE).await.unwrap();
        let row = &claimed[0];

        let snoozed = store
            .snooze(row.id, row.attempt, Utc::now() + TimeDelta::seconds(10))
            .await
            .unwrap();

        assert_eq!(snoozed.state, JobState::Available);
        assert_eq!(snoozed.attempt, 0);
        assert!(snoozed.last_error.is_none());
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let store = store();
        store.insert(job("a")).await.unwrap();
        store
            .insert(job("b").with_opts(crate::domain::InsertOpts::default().queue("mail")))
            .await
            .unwrap();

        let mail = store.claim_batch("mail", 10, LEASE).await.unwrap();
        assert_eq!(mail.len(), 1);
        assert_eq!(mail[0].kind, "b");

        let default = store.claim_batch("default", 10, LEASE).await.unwrap();
        assert_eq!(default.len(), 1);
        assert_eq!(default[0].kind, "a");
    }

    #[tokio::test]
    async fn insert_notifies_waiting_claimers() {
        let store = Arc::new(store());
        let notify = store.ready_notify();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                loop {
                    // Created before the claim so a notify_waiters() racing
                    // the empty claim is not lost.
                    let notified = notify.notified();
                    let claimed = store.claim_batch("default", 1, LEASE).await.unwrap();
                    if let Some(row) = claimed.into_iter().next() {
                        return row;
                    }
                    notified.await;
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.insert(job("a")).await.unwrap();

        let row = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.kind, "a");
    }
}

//! Per-queue dispatcher: claims ready jobs and runs them.
//!
//! One dispatcher loop per configured queue. A `Semaphore` permit is an
//! execution slot; the loop holds one permit before it polls, so a
//! saturated queue pauses claiming until a worker finishes. That is the
//! whole admission-control story: rows already wait durably in the store,
//! so there is no second in-memory queue here.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::domain::{JobEvent, JobRow};
use crate::error::{JobError, StoreError};
use crate::store::{JobStore, RetryPolicy};
use crate::worker::{JobContext, RunError, WorkerRegistry};

/// Knobs shared by every queue loop.
pub(crate) struct DispatchConfig {
    pub poll_interval: Duration,
    pub lease_timeout: Duration,
    pub job_timeout: Duration,
    pub retry: RetryPolicy,
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Claims and executes jobs for one queue.
pub(crate) struct QueueDispatcher {
    pub queue: String,
    pub max_workers: usize,
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<WorkerRegistry>,
    pub bus: Arc<EventBus>,
    pub config: Arc<DispatchConfig>,
}

impl QueueDispatcher {
    pub(crate) fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.max_workers.max(1)));
        let notify = self.store.ready_notify();
        let mut inflight: JoinSet<()> = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Backpressure: hold one slot before polling.
            let first = tokio::select! {
                _ = shutdown.changed() => continue,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Armed before the claim so an insert landing right after an
            // empty result is not lost (notify_waiters reaches futures
            // that already exist).
            let ready = notify.notified();

            let batch_limit = 1 + semaphore.available_permits();
            let claimed = match self
                .store
                .claim_batch(&self.queue, batch_limit, self.config.lease_timeout)
                .await
            {
                Ok(claimed) => claimed,
                Err(err) => {
                    // Transient storage failure: back off one tick and retry.
                    warn!(queue = %self.queue, %err, "claim failed, backing off");
                    drop(first);
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                    continue;
                }
            };

            if claimed.is_empty() {
                drop(first);
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = ready => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            let mut slot = Some(first);
            for job in claimed {
                // The first job rides the already-held permit; the rest
                // each take one. Permits only come back as workers finish
                // and only this loop takes them, so try_acquire matches
                // the batch size we just claimed.
                let permit = match slot
                    .take()
                    .map(Ok)
                    .unwrap_or_else(|| Arc::clone(&semaphore).try_acquire_owned())
                {
                    Ok(permit) => permit,
                    Err(_) => {
                        // No slot after all; leave the row to the lease
                        // reaper rather than block the loop.
                        warn!(queue = %self.queue, job_id = %job.id, "no free slot for claimed job");
                        break;
                    }
                };

                let store = Arc::clone(&self.store);
                let registry = Arc::clone(&self.registry);
                let bus = Arc::clone(&self.bus);
                let config = Arc::clone(&self.config);
                let job_shutdown = shutdown.clone();
                inflight.spawn(async move {
                    let _permit = permit;
                    let outcome = run_attempt(&job, &registry, &config, job_shutdown).await;
                    report_outcome(outcome, job, store, bus, config).await;
                });
            }

            // Reap finished workers so the set does not grow unbounded.
            while inflight.try_join_next().is_some() {}
        }

        // Let in-flight executions finish; the client bounds the overall
        // wait with its shutdown grace period.
        while inflight.join_next().await.is_some() {}
    }
}

/// One execution attempt: resolve, decode, run under deadline.
///
/// The handler runs in its own task so a panic is caught at the slot
/// boundary (as a `JoinError`) instead of unwinding the dispatcher.
async fn run_attempt(
    job: &JobRow,
    registry: &WorkerRegistry,
    config: &DispatchConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<(), RunError> {
    let worker = match registry.resolve(&job.kind) {
        Ok(worker) => worker,
        Err(_) => return Err(RunError::UnknownKind(job.kind.clone())),
    };

    let ctx = JobContext::new(job, shutdown);
    let args = job.args.clone();
    let handle = tokio::spawn(async move { worker.run(&ctx, args).await });
    let abort = handle.abort_handle();

    match tokio::time::timeout(config.job_timeout, handle).await {
        Err(_elapsed) => {
            // Cancels the handler task at its next await point; the engine
            // never blocks on a non-cooperating handler.
            abort.abort();
            Err(RunError::Timeout(config.job_timeout))
        }
        // We never abort a task we then await, so a join error is a panic.
        Ok(Err(_join_err)) => Err(RunError::Panicked),
        Ok(Ok(result)) => result,
    }
}

/// Record the attempt's outcome in the store and publish the event.
async fn report_outcome(
    outcome: Result<(), RunError>,
    job: JobRow,
    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
    config: Arc<DispatchConfig>,
) {
    let now = Utc::now();
    let result = match outcome {
        Ok(()) => match store.complete(job.id, job.attempt).await {
            Ok(row) => {
                debug!(job_id = %row.id, kind = %row.kind, "job completed");
                bus.publish(&JobEvent::completed(row));
                Ok(())
            }
            Err(err) => Err(err),
        },

        Err(RunError::Job(JobError::Snooze(delay))) => {
            match store.snooze(job.id, job.attempt, after(now, delay)).await {
                Ok(row) => {
                    debug!(job_id = %row.id, ?delay, "job snoozed");
                    bus.publish(&JobEvent::snoozed(row));
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }

        Err(err @ RunError::Job(JobError::Cancel(_))) => {
            discard_job(&store, &bus, &job, &err.to_string()).await
        }

        // Decode failures and unknown kinds: retrying cannot change a
        // malformed payload, so the row is discarded on first sight.
        Err(err) if err.is_unretryable() => {
            discard_job(&store, &bus, &job, &err.to_string()).await
        }

        // Execution failure, timeout, or panic: retry while the attempt
        // budget lasts, then discard.
        Err(err) => {
            if job.attempt < job.max_attempts {
                let next_at = after(now, config.retry.next_delay(job.attempt));
                match store.retry(job.id, job.attempt, next_at, &err.to_string()).await {
                    Ok(row) => {
                        debug!(
                            job_id = %row.id,
                            attempt = job.attempt,
                            %next_at,
                            "job failed, retry scheduled"
                        );
                        bus.publish(&JobEvent::failed(row));
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            } else {
                discard_job(&store, &bus, &job, &err.to_string()).await
            }
        }
    };

    if let Err(err) = result {
        // Typically a Conflict: the lease expired mid-flight and the reaper
        // (or a new claimer) took the row. Leave it to its current owner.
        warn!(job_id = %job.id, %err, "could not record job outcome");
    }
}

async fn discard_job(
    store: &Arc<dyn JobStore>,
    bus: &Arc<EventBus>,
    job: &JobRow,
    error: &str,
) -> Result<(), StoreError> {
    let row = store.discard(job.id, job.attempt, error).await?;
    warn!(job_id = %row.id, kind = %row.kind, error, "job discarded");
    bus.publish(&JobEvent::discarded(row));
    Ok(())
}

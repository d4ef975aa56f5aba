//! Execution context handed to workers.

use tokio::sync::watch;

use crate::domain::{JobId, JobRow};

/// Per-execution context: job metadata plus the cooperative cancellation
/// signal.
///
/// Cancellation is advisory. The engine never force-kills a handler; a
/// long-running worker should check [`JobContext::is_cancelled`] or await
/// [`JobContext::cancelled`] at natural suspension points and return early.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    kind: String,
    queue: String,
    attempt: u32,
    max_attempts: u32,
    shutdown: watch::Receiver<bool>,
}

impl JobContext {
    pub(crate) fn new(job: &JobRow, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind.clone(),
            queue: job.queue.clone(),
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            shutdown,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The attempt currently executing (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Is this the final attempt before discard?
    pub fn final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Has shutdown been requested?
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves when shutdown is requested (or immediately if it already
    /// was).
    pub async fn cancelled(&self) {
        let mut rx = self.shutdown.clone();
        while !*rx.borrow() {
            // Sender dropped means the engine is gone; treat as cancelled.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

//! Worker trait and type erasure.
//!
//! `Worker<A>` is the typed API integrators implement; `TypedWorker<A, W>`
//! erases it to the object-safe `DynWorker` the dispatcher stores and
//! invokes. Decoding happens inside the erased wrapper but fails with its
//! own [`RunError::Decode`] variant, so the dispatcher can tell a malformed
//! payload (discard immediately, retrying cannot fix it) from an execution
//! failure (retry with backoff).

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::args::JobArgs;
use super::context::JobContext;
use crate::error::JobError;

/// How one execution attempt ended, as classified by the dispatcher.
#[derive(Debug, Error)]
pub enum RunError {
    /// The payload did not decode into the worker's args type. Never
    /// retried.
    #[error("args decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    /// No worker is registered for the row's kind. Never retried.
    #[error("no worker registered for kind '{0}'")]
    UnknownKind(String),

    /// The worker returned an error (fail, snooze, or cancel).
    #[error(transparent)]
    Job(#[from] JobError),

    /// The attempt exceeded the execution deadline.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// The worker panicked; caught at the slot boundary.
    #[error("worker panicked")]
    Panicked,
}

impl RunError {
    /// Errors that retrying can never fix; the row is discarded on the
    /// first occurrence.
    pub fn is_unretryable(&self) -> bool {
        matches!(self, RunError::Decode(_) | RunError::UnknownKind(_))
    }
}

/// A worker executes jobs of one argument type.
///
/// # Example
/// ```ignore
/// struct SendEmailWorker;
///
/// #[async_trait]
/// impl Worker<SendEmail> for SendEmailWorker {
///     async fn execute(&self, _ctx: &JobContext, args: SendEmail) -> Result<(), JobError> {
///         mailer::send(&args.to).await.map_err(|e| JobError::failure(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait Worker<A: JobArgs>: Send + Sync {
    async fn execute(&self, ctx: &JobContext, args: A) -> Result<(), JobError>;
}

/// Object-safe worker abstraction.
///
/// Wrapping `Worker<A>` in [`TypedWorker`] produces this, which the
/// registry can hold in a `HashMap<String, Arc<dyn DynWorker>>`.
#[async_trait]
pub trait DynWorker: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Decode the payload and execute the worker against it.
    async fn run(&self, ctx: &JobContext, args: serde_json::Value) -> Result<(), RunError>;
}

/// Bridges a typed `Worker<A>` into `DynWorker`.
pub struct TypedWorker<A: JobArgs, W: Worker<A>> {
    worker: W,
    _marker: PhantomData<fn() -> A>,
}

impl<A: JobArgs, W: Worker<A>> TypedWorker<A, W> {
    pub fn new(worker: W) -> Self {
        Self {
            worker,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<A: JobArgs, W: Worker<A>> DynWorker for TypedWorker<A, W> {
    fn kind(&self) -> &'static str {
        A::KIND
    }

    async fn run(&self, ctx: &JobContext, args: serde_json::Value) -> Result<(), RunError> {
        let args: A = serde_json::from_value(args)?;
        self.worker.execute(ctx, args).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, NewJob};
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tokio::sync::watch;

    #[derive(Debug, Serialize, Deserialize)]
    struct Echo {
        value: i32,
    }

    impl JobArgs for Echo {
        const KIND: &'static str = "echo";
    }

    struct EchoWorker;

    #[async_trait]
    impl Worker<Echo> for EchoWorker {
        async fn execute(&self, _ctx: &JobContext, args: Echo) -> Result<(), JobError> {
            if args.value < 0 {
                return Err(JobError::failure("negative"));
            }
            Ok(())
        }
    }

    fn ctx() -> (JobContext, watch::Sender<bool>) {
        let (tx, _rx) = watch::channel(false);
        let row = NewJob::new("echo", json!({})).into_row(JobId::generate(), Utc::now());
        let ctx = JobContext::new(&row, tx.subscribe());
        (ctx, tx)
    }

    #[tokio::test]
    async fn typed_worker_decodes_and_executes() {
        let worker = TypedWorker::new(EchoWorker);
        assert_eq!(worker.kind(), "echo");

        let (ctx, _tx) = ctx();
        let result = worker.run(&ctx, json!({ "value": 1 })).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn execution_failure_is_a_job_error() {
        let worker = TypedWorker::new(EchoWorker);

        let (ctx, _tx) = ctx();
        let err = worker.run(&ctx, json!({ "value": -1 })).await.unwrap_err();
        assert!(matches!(err, RunError::Job(JobError::Failure(_))));
        assert!(!err.is_unretryable());
    }

    #[tokio::test]
    async fn malformed_payload_is_a_decode_error() {
        let worker = TypedWorker::new(EchoWorker);

        let (ctx, _tx) = ctx();
        let err = worker
            .run(&ctx, json!({ "value": "not a number" }))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Decode(_)));
        assert!(err.is_unretryable());
    }
}

//! Demo binary: drives the engine end to end.
//!
//! Registers a `sort` worker, starts a client over the in-memory store,
//! inserts two jobs, registers a periodic tick, waits for the completions
//! via the event bus, and shuts down gracefully.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use windlass_core::{
    Client, EventKind, InsertOpts, JobArgs, JobContext, JobError, NewJob, PeriodicSpec,
    QueueConfig, Worker, WorkerRegistry,
};

#[derive(Debug, Serialize, Deserialize)]
struct SortArgs {
    strings: Vec<String>,
}

impl JobArgs for SortArgs {
    const KIND: &'static str = "sort";
}

struct SortWorker;

#[async_trait]
impl Worker<SortArgs> for SortWorker {
    async fn execute(&self, ctx: &JobContext, args: SortArgs) -> Result<(), JobError> {
        let mut strings = args.strings;
        strings.sort();
        info!(job_id = %ctx.job_id(), ?strings, "sorted strings");
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TickArgs;

impl JobArgs for TickArgs {
    const KIND: &'static str = "tick";
}

struct TickWorker;

#[async_trait]
impl Worker<TickArgs> for TickWorker {
    async fn execute(&self, ctx: &JobContext, _args: TickArgs) -> Result<(), JobError> {
        info!(job_id = %ctx.job_id(), "tick");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,windlass_core=debug".into()),
        )
        .init();

    // Workers are registered up front; the registry is immutable from here.
    let mut registry = WorkerRegistry::new();
    registry.register::<SortArgs, _>(SortWorker)?;
    registry.register::<TickArgs, _>(TickWorker)?;

    let client = Client::builder()
        .registry(registry)
        .queue("default", QueueConfig { max_workers: 4 })
        .poll_interval(Duration::from_millis(50))
        .build();

    // Watch completions before inserting so none are missed.
    let (mut events, _subscription) = client.subscribe(&[EventKind::Completed]);

    client.start().await?;

    client
        .insert(
            SortArgs {
                strings: ["whale", "tiger", "bear"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            InsertOpts::default(),
        )
        .await?;
    client
        .insert(
            SortArgs {
                strings: ["goat", "whale", "cat", "dog", "mouse", "horse"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            InsertOpts::default(),
        )
        .await?;

    // A periodic tick that also fires immediately on registration.
    let tick = client.add_periodic(
        PeriodicSpec::new(Duration::from_secs(10), || {
            NewJob::new(TickArgs::KIND, serde_json::Value::Null)
        })
        .run_on_start(),
    );

    // Two sorts plus the first tick.
    let mut remaining = 3;
    while remaining > 0 {
        match events.recv().await {
            Some(event) => {
                info!(
                    job_id = %event.job.id,
                    kind = %event.job.kind,
                    "job completed"
                );
                remaining -= 1;
            }
            None => break,
        }
    }

    client.remove_periodic(tick);
    let counts = client.counts().await?;
    info!(?counts, "draining");
    client.stop().await?;
    Ok(())
}

//! windlass-core
//!
//! A durable background-job engine: a persistent job queue with
//! exactly-once-claim semantics, per-queue bounded worker pools, a
//! periodic-job scheduler, transactional insert visibility, and a
//! lifecycle event bus.
//!
//! # Module map
//! - **domain**: job rows, states, IDs, lifecycle events
//! - **store**: the storage contract ([`JobStore`]/[`StoreTx`]) and the
//!   in-memory transactional implementation ([`MemoryStore`])
//! - **worker**: typed worker API ([`JobArgs`], [`Worker`]) and the
//!   registry the dispatcher resolves kinds against
//! - **bus**: non-blocking lifecycle event fan-out
//! - **periodic**: recurring job specs and their timer loop
//! - **client**: the facade that wires everything together
//!
//! # Quick start
//! ```ignore
//! let mut registry = WorkerRegistry::new();
//! registry.register::<SendEmail, _>(SendEmailWorker)?;
//!
//! let client = Client::builder()
//!     .registry(registry)
//!     .queue("default", QueueConfig { max_workers: 10 })
//!     .build();
//!
//! client.start().await?;
//! client.insert(SendEmail { to: "a@b.c".into() }, InsertOpts::default()).await?;
//! client.stop().await?;
//! ```

pub mod bus;
pub mod client;
pub mod domain;
pub mod error;
pub mod observability;
pub mod periodic;
pub mod store;
pub mod worker;

mod dispatch;
mod reaper;

pub use bus::{EventBus, Subscription, SubscriptionHandle};
pub use client::{Client, ClientBuilder, QueueConfig};
pub use domain::{
    EventKind, InsertOpts, JobEvent, JobId, JobRow, JobState, NewJob, PeriodicJobId,
};
pub use error::{EngineError, JobError, StoreError};
pub use observability::JobCounts;
pub use periodic::{PeriodicScheduler, PeriodicSpec};
pub use store::{JobStore, MemoryStore, RetryPolicy, StoreTx};
pub use worker::{JobArgs, JobContext, Worker, WorkerRegistry};

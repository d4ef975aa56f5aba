//! Client facade: lifecycle, insert APIs, periodic control, subscriptions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::{EventBus, Subscription, SubscriptionHandle};
use crate::dispatch::{DispatchConfig, QueueDispatcher};
use crate::domain::{EventKind, InsertOpts, JobRow, NewJob, PeriodicJobId};
use crate::error::EngineError;
use crate::observability::JobCounts;
use crate::periodic::{PeriodicScheduler, PeriodicSpec};
use crate::reaper::spawn_reaper;
use crate::store::{JobStore, MemoryStore, RetryPolicy, StoreTx};
use crate::worker::{JobArgs, WorkerRegistry};

/// Per-queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum jobs executing concurrently for this queue.
    pub max_workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_workers: 10 }
    }
}

/// Lifecycle of the client.
///
/// stopped -> starting -> running -> stopping -> stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Builds a [`Client`].
pub struct ClientBuilder {
    store: Option<Arc<dyn JobStore>>,
    registry: WorkerRegistry,
    queues: HashMap<String, QueueConfig>,
    poll_interval: Duration,
    lease_timeout: Duration,
    reap_interval: Duration,
    job_timeout: Duration,
    shutdown_grace: Duration,
    retry: RetryPolicy,
    event_buffer: usize,
}

impl ClientBuilder {
    fn new() -> Self {
        Self {
            store: None,
            registry: WorkerRegistry::new(),
            queues: HashMap::new(),
            poll_interval: Duration::from_millis(100),
            lease_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(5),
            job_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            event_buffer: 128,
        }
    }

    /// Use a specific store. Defaults to a fresh [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The worker registry. Build it first, then hand it over; the client
    /// owns it from here and shares it read-only with the dispatcher.
    pub fn registry(mut self, registry: WorkerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Configure a queue. Without any, a "default" queue is created.
    pub fn queue(mut self, name: impl Into<String>, config: QueueConfig) -> Self {
        self.queues.insert(name.into(), config);
        self
    }

    /// Dispatcher poll cadence (the fallback when no insert wakes it).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How long a claim owns a row before the reaper may take it back.
    pub fn lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    /// How often the reaper sweeps for expired leases.
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Execution deadline per attempt.
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// How long `stop` waits for in-flight jobs.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Event buffer capacity per subscriber.
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn build(mut self) -> Client {
        if self.queues.is_empty() {
            self.queues
                .insert(crate::domain::DEFAULT_QUEUE.to_string(), QueueConfig::default());
        }
        Client {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryStore::new())),
            registry: Arc::new(self.registry),
            bus: Arc::new(EventBus::new(self.event_buffer)),
            periodic: PeriodicScheduler::new(),
            queues: self.queues,
            dispatch: Arc::new(DispatchConfig {
                poll_interval: self.poll_interval,
                lease_timeout: self.lease_timeout,
                job_timeout: self.job_timeout,
                retry: self.retry,
            }),
            reap_interval: self.reap_interval,
            shutdown_grace: self.shutdown_grace,
            lifecycle: Mutex::new(Lifecycle::Stopped),
            shutdown_tx: Mutex::new(None),
            loops: Mutex::new(Vec::new()),
        }
    }
}

/// The job engine client.
///
/// Owns the store handle, the worker registry, the event bus, and the
/// periodic scheduler; `start` wires them together and spins up the
/// background loops.
pub struct Client {
    store: Arc<dyn JobStore>,
    registry: Arc<WorkerRegistry>,
    bus: Arc<EventBus>,
    periodic: PeriodicScheduler,
    queues: HashMap<String, QueueConfig>,
    dispatch: Arc<DispatchConfig>,
    reap_interval: Duration,
    shutdown_grace: Duration,
    lifecycle: Mutex<Lifecycle>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Start the dispatcher, periodic scheduler, and lease reaper.
    ///
    /// Fails with [`EngineError::NotStopped`] unless the client is
    /// stopped. A storage probe runs first so an unreachable store aborts
    /// the start synchronously.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.transition(Lifecycle::Stopped, Lifecycle::Starting)
            .map_err(|_| EngineError::NotStopped)?;

        // Fail fast if storage is unreachable.
        if let Err(err) = self.store.counts().await {
            self.set_lifecycle(Lifecycle::Stopped);
            return Err(err.into());
        }

        let (tx, rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(self.queues.len() + 2);

        for (queue, config) in &self.queues {
            let dispatcher = QueueDispatcher {
                queue: queue.clone(),
                max_workers: config.max_workers,
                store: Arc::clone(&self.store),
                registry: Arc::clone(&self.registry),
                bus: Arc::clone(&self.bus),
                config: Arc::clone(&self.dispatch),
            };
            handles.push(dispatcher.spawn(rx.clone()));
        }
        handles.push(
            self.periodic
                .spawn_loop(Arc::clone(&self.store), rx.clone()),
        );
        handles.push(spawn_reaper(
            Arc::clone(&self.store),
            self.reap_interval,
            rx,
        ));

        *self.lock(&self.shutdown_tx) = Some(tx);
        *self.lock(&self.loops) = handles;
        self.set_lifecycle(Lifecycle::Running);
        info!(queues = self.queues.len(), "client started");
        Ok(())
    }

    /// Signal shutdown and wait for in-flight work, bounded by the grace
    /// period. Fails with [`EngineError::NotRunning`] unless running.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.transition(Lifecycle::Running, Lifecycle::Stopping)
            .map_err(|_| EngineError::NotRunning)?;

        if let Some(tx) = self.lock(&self.shutdown_tx).take() {
            let _ = tx.send(true);
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.lock(&self.loops));

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            warn!(
                grace = ?self.shutdown_grace,
                "shutdown grace elapsed; abandoning in-flight jobs"
            );
        }

        self.set_lifecycle(Lifecycle::Stopped);
        info!("client stopped");
        Ok(())
    }

    /// Insert one job, visible to workers immediately.
    ///
    /// The kind must resolve in the registry; inserting a row no worker
    /// can ever execute is rejected here rather than discovered at claim
    /// time.
    pub async fn insert<A: JobArgs>(
        &self,
        args: A,
        opts: InsertOpts,
    ) -> Result<JobRow, EngineError> {
        let new = self.validated::<A>(args, opts)?;
        Ok(self.store.insert(new).await?)
    }

    /// Open an insert transaction on the store.
    ///
    /// Jobs staged with [`Client::insert_tx`] become visible only when the
    /// transaction commits; a rollback leaves no trace of them.
    pub async fn begin(&self) -> Result<Box<dyn StoreTx>, EngineError> {
        Ok(self.store.begin().await?)
    }

    /// Stage a job inside a transaction.
    pub fn insert_tx<A: JobArgs>(
        &self,
        tx: &mut dyn StoreTx,
        args: A,
        opts: InsertOpts,
    ) -> Result<JobRow, EngineError> {
        let new = self.validated::<A>(args, opts)?;
        Ok(tx.insert(new)?)
    }

    fn validated<A: JobArgs>(&self, args: A, opts: InsertOpts) -> Result<NewJob, EngineError> {
        if !self.registry.contains(A::KIND) {
            return Err(EngineError::UnknownKind(A::KIND.to_string()));
        }
        if opts.max_attempts == Some(0) {
            return Err(EngineError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        let args = serde_json::to_value(args)
            .map_err(|err| EngineError::Validation(format!("args serialize failed: {err}")))?;
        Ok(NewJob::new(A::KIND, args).with_opts(opts))
    }

    /// Subscribe to lifecycle events (empty slice = every kind).
    pub fn subscribe(&self, kinds: &[EventKind]) -> (Subscription, SubscriptionHandle) {
        self.bus.subscribe(kinds)
    }

    /// Register a periodic job. Takes effect immediately, even while the
    /// scheduler loop sleeps.
    pub fn add_periodic(&self, spec: PeriodicSpec) -> PeriodicJobId {
        self.periodic.add(spec)
    }

    /// Deregister a periodic job. Returns whether it existed.
    pub fn remove_periodic(&self, id: PeriodicJobId) -> bool {
        self.periodic.remove(id)
    }

    /// Deregister every periodic job.
    pub fn clear_periodic(&self) {
        self.periodic.clear()
    }

    /// Fetch a job row snapshot.
    pub async fn job(&self, id: crate::domain::JobId) -> Result<JobRow, EngineError> {
        Ok(self.store.get(id).await?)
    }

    /// Row counts by state.
    pub async fn counts(&self) -> Result<JobCounts, EngineError> {
        Ok(self.store.counts().await?)
    }

    fn transition(&self, from: Lifecycle, to: Lifecycle) -> Result<(), Lifecycle> {
        let mut lifecycle = self.lock(&self.lifecycle);
        if *lifecycle != from {
            return Err(*lifecycle);
        }
        *lifecycle = to;
        Ok(())
    }

    fn set_lifecycle(&self, to: Lifecycle) {
        *self.lock(&self.lifecycle) = to;
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobState;
    use crate::error::JobError;
    use crate::worker::{JobContext, Worker};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Sort {
        strings: Vec<String>,
    }

    impl JobArgs for Sort {
        const KIND: &'static str = "sort";
    }

    struct SortWorker;

    #[async_trait]
    impl Worker<Sort> for SortWorker {
        async fn execute(&self, _ctx: &JobContext, args: Sort) -> Result<(), JobError> {
            let mut strings = args.strings;
            strings.sort();
            tracing::info!(?strings, "sorted");
            Ok(())
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Tick;

    impl JobArgs for Tick {
        const KIND: &'static str = "tick";
    }

    struct TickWorker;

    #[async_trait]
    impl Worker<Tick> for TickWorker {
        async fn execute(&self, _ctx: &JobContext, _args: Tick) -> Result<(), JobError> {
            Ok(())
        }
    }

    fn sort_client() -> Client {
        let mut registry = WorkerRegistry::new();
        registry.register::<Sort, _>(SortWorker).unwrap();
        registry.register::<Tick, _>(TickWorker).unwrap();
        Client::builder()
            .registry(registry)
            .poll_interval(Duration::from_millis(10))
            .build()
    }

    #[tokio::test]
    async fn start_is_not_idempotent() {
        let client = sort_client();

        client.start().await.unwrap();
        let err = client.start().await.unwrap_err();
        assert!(matches!(err, EngineError::NotStopped));

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_requires_running() {
        let client = sort_client();

        let err = client.stop().await.unwrap_err();
        assert!(matches!(err, EngineError::NotRunning));
    }

    #[tokio::test]
    async fn restart_after_stop_works() {
        let client = sort_client();

        client.start().await.unwrap();
        client.stop().await.unwrap();
        client.start().await.unwrap();
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn insert_rejects_unknown_kinds() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Unregistered;

        impl JobArgs for Unregistered {
            const KIND: &'static str = "unregistered";
        }

        let client = sort_client();
        let err = client
            .insert(Unregistered, InsertOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownKind(kind) if kind == "unregistered"));

        // Nothing was written.
        assert_eq!(client.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn insert_rejects_zero_max_attempts() {
        let client = sort_client();
        let err = client
            .insert(
                Sort { strings: vec![] },
                InsertOpts::default().max_attempts(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn sort_scenario_completes_both_jobs() {
        let client = sort_client();
        let (mut events, _handle) = client.subscribe(&[EventKind::Completed]);

        client.start().await.unwrap();

        let a = client
            .insert(
                Sort {
                    strings: ["whale", "tiger", "bear"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                },
                InsertOpts::default(),
            )
            .await
            .unwrap();
        let b = client
            .insert(
                Sort {
                    strings: ["goat", "whale", "cat", "dog", "mouse", "horse"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                },
                InsertOpts::default(),
            )
            .await
            .unwrap();

        let mut completed = Vec::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            completed.push(event.job.id);
        }
        assert!(completed.contains(&a.id));
        assert!(completed.contains(&b.id));

        assert_eq!(client.job(a.id).await.unwrap().state, JobState::Completed);
        assert_eq!(client.job(b.id).await.unwrap().state, JobState::Completed);

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn transactional_insert_is_invisible_until_commit() {
        let client = sort_client();
        client.start().await.unwrap();

        // Rolled back: never executed.
        let mut tx = client.begin().await.unwrap();
        client
            .insert_tx(tx.as_mut(), Sort { strings: vec![] }, InsertOpts::default())
            .unwrap();
        tx.rollback().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.counts().await.unwrap().total(), 0);

        // Committed: executed.
        let (mut events, _handle) = client.subscribe(&[EventKind::Completed]);
        let mut tx = client.begin().await.unwrap();
        let staged = client
            .insert_tx(tx.as_mut(), Sort { strings: vec![] }, InsertOpts::default())
            .unwrap();
        tx.commit().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.job.id, staged.id);

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn periodic_job_runs_through_the_engine() {
        let client = sort_client();
        let (mut events, _handle) = client.subscribe(&[EventKind::Completed]);

        client.start().await.unwrap();

        let id = client.add_periodic(
            PeriodicSpec::new(Duration::from_secs(3600), || {
                NewJob::new("tick", json!(null))
            })
            .run_on_start(),
        );

        // run_on_start fires well before the hour-long interval.
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.job.kind, "tick");

        assert!(client.remove_periodic(id));
        client.stop().await.unwrap();
    }
}

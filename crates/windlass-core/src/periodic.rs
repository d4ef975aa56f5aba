//! Periodic job scheduler.
//!
//! A single timer loop sleeps until the nearest next-fire time across all
//! registered specs, inserts a fresh job row for each spec that is due,
//! and re-sleeps. `add`/`remove`/`clear` are safe to call from any task
//! while the loop sleeps: every mutation wakes the loop so it recomputes
//! its wait immediately instead of finishing the stale sleep.
//!
//! Fires for one spec are serialized by construction (one loop, one insert
//! at a time), so a spec never has two overlapping insertions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::{NewJob, PeriodicJobId};
use crate::store::JobStore;

/// A recurring job template.
///
/// The factory is invoked at each fire to produce the row to insert, so
/// args can vary per fire (timestamps, counters, ...).
pub struct PeriodicSpec {
    interval: Duration,
    factory: Box<dyn Fn() -> NewJob + Send + Sync>,
    run_on_start: bool,
}

impl PeriodicSpec {
    pub fn new<F>(interval: Duration, factory: F) -> Self
    where
        F: Fn() -> NewJob + Send + Sync + 'static,
    {
        Self {
            interval,
            factory: Box::new(factory),
            run_on_start: false,
        }
    }

    /// Fire once immediately after the scheduler starts (or, for specs
    /// added at runtime, immediately after `add`) instead of waiting a
    /// full interval first.
    pub fn run_on_start(mut self) -> Self {
        self.run_on_start = true;
        self
    }
}

struct Entry {
    spec: PeriodicSpec,
    next_at: DateTime<Utc>,
}

#[derive(Default)]
struct SpecMap {
    entries: HashMap<PeriodicJobId, Entry>,
}

/// Handle for mutating the periodic spec set.
///
/// Cloneable; all mutations wake the timer loop.
#[derive(Clone)]
pub struct PeriodicScheduler {
    specs: Arc<Mutex<SpecMap>>,
    notify: Arc<Notify>,
}

impl PeriodicScheduler {
    pub fn new() -> Self {
        Self {
            specs: Arc::new(Mutex::new(SpecMap::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Register a spec. Returns the ID to `remove` it with.
    pub fn add(&self, spec: PeriodicSpec) -> PeriodicJobId {
        let id = PeriodicJobId::generate();
        let now = Utc::now();
        let next_at = if spec.run_on_start {
            now
        } else {
            next_fire(now, spec.interval)
        };
        self.lock().entries.insert(id, Entry { spec, next_at });
        self.notify.notify_one();
        id
    }

    /// Deregister a spec. Returns whether it existed. No further
    /// insertions happen for a removed spec, even mid-sleep.
    pub fn remove(&self, id: PeriodicJobId) -> bool {
        let existed = self.lock().entries.remove(&id).is_some();
        self.notify.notify_one();
        existed
    }

    /// Deregister every spec.
    pub fn clear(&self) {
        self.lock().entries.clear();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SpecMap> {
        self.specs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Nearest next-fire time across all specs.
    fn nearest(&self) -> Option<DateTime<Utc>> {
        self.lock().entries.values().map(|e| e.next_at).min()
    }

    /// Pop the jobs due at `now`, rescheduling each spec from the fire
    /// time. The factory runs under the lock (it is a sync closure); the
    /// inserts happen afterwards, one at a time.
    fn collect_due(&self, now: DateTime<Utc>) -> Vec<NewJob> {
        let mut map = self.lock();
        let mut due = Vec::new();
        for entry in map.entries.values_mut() {
            if entry.next_at <= now {
                due.push((entry.spec.factory)());
                entry.next_at = next_fire(now, entry.spec.interval);
            }
        }
        due
    }

    /// Run the timer loop until shutdown.
    pub(crate) fn spawn_loop(
        &self,
        store: Arc<dyn JobStore>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }

                // Armed before reading the spec set so an add/remove racing
                // the read still wakes us.
                let changed = scheduler.notify.notified();

                let now = Utc::now();
                match scheduler.nearest() {
                    None => {
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = changed => {}
                        }
                    }
                    Some(at) if at <= now => {
                        for new in scheduler.collect_due(now) {
                            let kind = new.kind.clone();
                            match store.insert(new).await {
                                Ok(row) => {
                                    debug!(job_id = %row.id, %kind, "periodic job inserted");
                                }
                                Err(err) => {
                                    // Skip this fire; the spec stays
                                    // scheduled for the next one.
                                    warn!(%kind, %err, "periodic insert failed");
                                }
                            }
                        }
                    }
                    Some(at) => {
                        let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = changed => {}
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }
        })
    }
}

impl Default for PeriodicScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn next_fire(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(interval)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

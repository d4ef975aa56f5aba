//! Worker registry: kind -> worker.

use std::collections::HashMap;
use std::sync::Arc;

use super::args::JobArgs;
use super::handler::{DynWorker, TypedWorker, Worker};
use crate::error::EngineError;

/// Registry of workers, keyed by kind.
///
/// Design:
/// - Built during initialization (mutable).
/// - Used during runtime (immutable, behind `Arc`).
/// This keeps lookups lock-free: registration is confined to startup, so
/// the dispatcher reads the map without synchronization.
///
/// There is deliberately no global registry; the client owns one instance
/// and hands it to the dispatcher by reference.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn DynWorker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    /// Register a worker for `A::KIND`.
    ///
    /// Fails with [`EngineError::DuplicateKind`] when the kind is taken.
    pub fn register<A, W>(&mut self, worker: W) -> Result<(), EngineError>
    where
        A: JobArgs,
        W: Worker<A> + 'static,
    {
        if self.workers.contains_key(A::KIND) {
            return Err(EngineError::DuplicateKind(A::KIND.to_string()));
        }
        self.workers
            .insert(A::KIND.to_string(), Arc::new(TypedWorker::new(worker)));
        Ok(())
    }

    /// Look up the worker for a kind.
    ///
    /// Fails with [`EngineError::UnknownKind`] when absent.
    pub fn resolve(&self, kind: &str) -> Result<Arc<dyn DynWorker>, EngineError> {
        self.workers
            .get(kind)
            .cloned()
            .ok_or_else(|| EngineError::UnknownKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.workers.contains_key(kind)
    }

    /// Registered kinds, unordered.
    pub fn kinds(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

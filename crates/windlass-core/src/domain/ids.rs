//! Domain identifiers (strongly-typed IDs).
//!
//! IDs are ULIDs (Universally Unique Lexicographically Sortable Identifiers)
//! wrapped in a phantom-typed `Id<T>` so the compiler keeps `JobId` and
//! `PeriodicJobId` apart while the implementation is shared.
//!
//! ULID properties we rely on:
//! - **Sortable**: the timestamp prefix makes IDs sort by creation order.
//! - **Coordination-free**: safe to generate from any task or process.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for ID namespaces.
///
/// Provides the display prefix ("job-", "periodic-").
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ID type.
///
/// `T` is a zero-sized marker: it costs nothing at runtime but prevents
/// mixing IDs from different namespaces at compile time.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Generate a fresh ID.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Marker for job rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

/// Marker for periodic job specs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Periodic {}

impl IdMarker for Periodic {
    fn prefix() -> &'static str {
        "periodic-"
    }
}

/// Identifier of a job row in the store.
pub type JobId = Id<Job>;

/// Identifier of a registered periodic job spec.
pub type PeriodicJobId = Id<Periodic>;

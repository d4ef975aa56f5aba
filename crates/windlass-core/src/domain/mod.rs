//! Domain model (IDs, job rows, states, events).

pub mod events;
pub mod ids;
pub mod job;
pub mod state;

pub use events::{EventKind, JobEvent};
pub use ids::{JobId, PeriodicJobId};
pub use job::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, DEFAULT_QUEUE, InsertOpts, JobRow, NewJob,
};
pub use state::JobState;

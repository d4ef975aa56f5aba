//! Status views over the store.

use serde::{Deserialize, Serialize};

/// Row counts by state, snapshotted from the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub available: usize,
    pub running: usize,
    pub completed: usize,
    pub discarded: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.available + self.running + self.completed + self.discarded
    }
}

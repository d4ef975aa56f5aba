//! Lease reaper: requeues jobs whose claimer went away.
//!
//! A `Running` row whose lease has expired belongs to a worker that
//! crashed, hung past its deadline, or lost its process. The reaper
//! periodically sweeps those rows back to `Available` so another worker
//! can pick them up. The attempt the crashed worker consumed stays
//! counted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::store::JobStore;

pub(crate) fn spawn_reaper(
    store: Arc<dyn JobStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }

            match store.reclaim_expired(Utc::now()).await {
                Ok(reclaimed) => {
                    for row in &reclaimed {
                        info!(
                            job_id = %row.id,
                            kind = %row.kind,
                            attempt = row.attempt,
                            "reclaimed expired lease"
                        );
                    }
                }
                Err(err) => {
                    // Transient; the next sweep retries.
                    warn!(%err, "lease reclaim sweep failed");
                }
            }
        }
    })
}

//! Background sweep for job runs past their expected completion.
//!
//! Detection only: stale runs are logged and surfaced as events, never
//! transitioned.

use std::sync::Arc;
use std::time::Duration;

use crate::core::clock::{now_rounded, Clock};
use crate::events::{Event, EventBus};
use crate::storage::Storage;

/// Default interval between sweeps.
pub const DEFAULT_STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
/// Default age after which a waiting run counts as stale.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(300);

/// Observability sweep over runs still waiting past the stale threshold.
pub struct StaleRunDetector<S: Storage> {
    storage: Arc<S>,
    event_bus: Arc<EventBus>,
    clock: Clock,
    threshold: chrono::Duration,
}

impl<S: Storage> StaleRunDetector<S> {
    /// Create a detector with the given stale threshold.
    pub fn new(
        storage: Arc<S>,
        event_bus: Arc<EventBus>,
        clock: Clock,
        threshold: Duration,
    ) -> Self {
        Self {
            storage,
            event_bus,
            clock,
            threshold: chrono::Duration::from_std(threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        }
    }

    /// Run one sweep. Returns how many stale runs were surfaced.
    pub async fn sweep_once(&self) -> usize {
        let now = now_rounded(&self.clock);
        let cutoff = now - self.threshold;

        let stale = match self.storage.get_stale_job_runs(cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                tracing::error!(error = %e, "stale run sweep failed");
                return 0;
            }
        };

        for run in &stale {
            tracing::warn!(
                schedule_id = %run.schedule_id,
                job_run_id = %run.id,
                start_date = %run.start_date,
                "job run waiting past stale threshold"
            );
            self.event_bus
                .emit(Event::StaleRunDetected {
                    schedule_id: run.schedule_id,
                    job_run_id: run.id,
                    waiting_since: run.start_date,
                    timestamp: now,
                })
                .await;
        }

        stale.len()
    }

    /// Sweep forever at the given interval.
    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }
}

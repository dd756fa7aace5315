//! Scheduler background worker.
//!
//! Drives one admission cycle per interval tick against the live plane.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::plane::ExecutionPlane;

/// Periodic driver of admission cycles.
pub struct SchedulerWorker {
    plane: Arc<ExecutionPlane>,
    interval: Duration,
}

impl SchedulerWorker {
    pub fn new(plane: Arc<ExecutionPlane>, interval: Duration) -> Self {
        Self { plane, interval }
    }

    /// Runs admission cycles until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis(),
            "starting scheduler worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.plane.run_cycle().await {
                        Ok(stats) => {
                            if stats.admitted > 0 || stats.preempted > 0 {
                                info!(
                                    admitted = stats.admitted,
                                    preempted = stats.preempted,
                                    unplaced = stats.unplaced,
                                    "admission cycle applied"
                                );
                            }
                        }
                        // A rejected cycle is dropped wholesale; the next
                        // tick sees a fresh snapshot.
                        Err(e) => error!(error = %e, "admission cycle failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

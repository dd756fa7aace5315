//! Reconciliation feed - orders the substrate's event stream for the actors.
//!
//! A single label-scoped watch observes every resource this plane created.
//! Events are appended to a shared buffer and flushed on a fixed cooldown
//! interval rather than per event, bounding message volume during bursts
//! (batch admissions, node drains). Delivery is at-least-once and
//! order-preserving within a flush; the actors' transition table absorbs
//! re-delivery.
//!
//! A lost watch is re-established with exponential backoff. Scheduling
//! cannot safely proceed blind, so repeated failures escalate as a
//! process-level fault instead of retrying forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::actors::{ActorHandle, BackoffPolicy, TaskMessage};
use crate::substrate::{Substrate, SubstrateEvent, PLANE_LABEL};

/// Errors terminating the feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The watch could not be re-established; the plane has lost substrate
    /// visibility and must be restarted.
    #[error("substrate watch failed {attempts} consecutive times: {last_error}")]
    Escalated { attempts: u32, last_error: String },
}

/// Tuning for the feed loop.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Flush interval for the event buffer.
    pub cooldown: Duration,

    /// Consecutive watch failures tolerated before escalation.
    pub max_consecutive_failures: u32,

    pub backoff: BackoffPolicy,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(500),
            max_consecutive_failures: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Watches the substrate and routes ordered status updates to task actors.
pub struct ReconciliationFeed {
    substrate: Arc<dyn Substrate>,
    config: FeedConfig,

    /// Workload resource name -> owning actor.
    routes: Mutex<HashMap<String, ActorHandle<TaskMessage>>>,

    /// Burst buffer. Appended from the watch context, drained by the flush
    /// tick; the mutex keeps the two exclusive.
    buffer: Mutex<Vec<SubstrateEvent>>,
}

impl ReconciliationFeed {
    pub fn new(substrate: Arc<dyn Substrate>, config: FeedConfig) -> Self {
        Self {
            substrate,
            config,
            routes: Mutex::new(HashMap::new()),
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Routes events for `workload_name` to `handle`.
    pub fn register(&self, workload_name: String, handle: ActorHandle<TaskMessage>) {
        self.routes.lock().unwrap().insert(workload_name, handle);
    }

    pub fn unregister(&self, workload_name: &str) {
        self.routes.lock().unwrap().remove(workload_name);
    }

    /// Runs the watch-buffer-flush loop until shutdown or escalation.
    #[instrument(skip_all)]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), FeedError> {
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let mut stream = match self.substrate.watch(PLANE_LABEL).await {
                Ok(stream) => stream,
                Err(e) => {
                    failures += 1;
                    if failures >= self.config.max_consecutive_failures {
                        error!(
                            attempts = failures,
                            error = %e,
                            "substrate watch cannot be re-established, escalating"
                        );
                        return Err(FeedError::Escalated {
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = self.config.backoff.delay(failures);
                    warn!(
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "substrate watch failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            info!(label = PLANE_LABEL, "substrate watch established");
            failures = 0;

            let mut flush = tokio::time::interval(self.config.cooldown);
            flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            self.flush().await;
                            return Ok(());
                        }
                    }

                    event = stream.next() => match event {
                        Some(event) => self.buffer.lock().unwrap().push(event),
                        None => {
                            warn!("substrate watch lost, resynchronizing");
                            break;
                        }
                    },

                    _ = flush.tick() => self.flush().await,
                }
            }

            // Deliver what the dying watch produced before reconnecting.
            self.flush().await;
        }
    }

    /// Drains the buffer and dispatches, preserving arrival order.
    async fn flush(&self) {
        let drained: Vec<SubstrateEvent> = {
            let mut buffer = self.buffer.lock().unwrap();
            std::mem::take(&mut *buffer)
        };
        if drained.is_empty() {
            return;
        }
        debug!(count = drained.len(), "flushing buffered substrate events");

        for event in drained {
            let handle = {
                let routes = self.routes.lock().unwrap();
                routes.get(event.workload_name()).cloned()
            };
            let Some(handle) = handle else {
                debug!(workload = event.workload_name(), "no route for event, dropping");
                continue;
            };

            let message = match event {
                SubstrateEvent::Status(status) => TaskMessage::Status(status),
                SubstrateEvent::Note { at, message, .. } => TaskMessage::Note { at, message },
            };
            if handle.send(message).await.is_err() {
                debug!("routed actor already stopped");
            }
        }
    }
}

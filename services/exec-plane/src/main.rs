//! mlgrid Execution Plane
//!
//! Schedules priority-ranked training workloads onto a shared agent pool
//! and drives the container substrate to run them.
//!
//! ## Architecture
//!
//! - **Scheduler Worker**: runs one admission cycle per interval
//! - **Reconciliation Feed**: watches the substrate and routes ordered
//!   status updates to task actors
//! - **Event Pump**: folds actor reports into capacity accounting
//! - **Port Rendezvous**: HTTP surface for dynamic port discovery

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mlgrid_exec_plane::config::Config;
use mlgrid_exec_plane::feed::{FeedConfig, ReconciliationFeed};
use mlgrid_exec_plane::plane::{ExecutionPlane, PlaneConfig};
use mlgrid_exec_plane::rendezvous::{self, PortRendezvous};
use mlgrid_exec_plane::scheduler::SchedulerWorker;
use mlgrid_exec_plane::substrate::{MockSubstrate, Substrate};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting mlgrid execution plane");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        schedule_interval_ms = config.schedule_interval.as_millis() as u64,
        admission_tokens = config.admission_tokens,
        preemption = config.preemption_enabled,
        rendezvous_addr = %config.rendezvous_addr,
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create the substrate (mock for now)
    let substrate: Arc<dyn Substrate> = Arc::new(MockSubstrate::new());

    let feed = Arc::new(ReconciliationFeed::new(
        Arc::clone(&substrate),
        FeedConfig {
            cooldown: config.feed_cooldown,
            max_consecutive_failures: config.feed_max_failures,
            ..FeedConfig::default()
        },
    ));

    // Upward events: consumed by the job/trial layer in production; logged
    // at the binary edge here.
    let (upward_tx, mut upward_rx) = mpsc::unbounded_channel::<mlgrid_events::ExecPlaneEvent>();
    tokio::spawn(async move {
        while let Some(event) = upward_rx.recv().await {
            info!(task_id = %event.task_id(), ?event, "upward event");
        }
    });

    let (plane, events_rx) = ExecutionPlane::new(
        Arc::clone(&substrate),
        Arc::clone(&feed),
        PlaneConfig {
            admission_tokens: config.admission_tokens,
            preemption_enabled: config.preemption_enabled,
            keep_resources: config.keep_resources,
        },
        upward_tx,
    );
    let plane = Arc::new(plane);

    // Start the event pump
    let pump_handle = tokio::spawn({
        let plane = Arc::clone(&plane);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            plane.run_event_pump(events_rx, shutdown_rx).await;
        }
    });

    // Start the reconciliation feed
    let feed_handle = tokio::spawn({
        let feed = Arc::clone(&feed);
        let shutdown_rx = shutdown_rx.clone();
        async move { feed.run(shutdown_rx).await }
    });

    // Start the scheduler worker
    let worker = SchedulerWorker::new(Arc::clone(&plane), config.schedule_interval);
    let worker_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            worker.run(shutdown_rx).await;
        }
    });

    // Start the port rendezvous surface
    let rendezvous_state = Arc::new(PortRendezvous::new());
    let rendezvous_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        let addr = config.rendezvous_addr;
        async move { rendezvous::serve(rendezvous_state, addr, shutdown_rx).await }
    });

    // Wait for shutdown signal or a fatal worker exit
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = feed_handle => {
            // Losing substrate visibility is a process-level fault;
            // scheduling cannot safely continue blind.
            match result {
                Ok(Ok(())) => info!("Reconciliation feed exited normally"),
                Ok(Err(e)) => error!(error = %e, "Reconciliation feed escalated"),
                Err(e) => error!(error = %e, "Reconciliation feed panicked"),
            }
        }
        result = rendezvous_handle => {
            match result {
                Ok(Ok(())) => info!("Rendezvous surface exited"),
                Ok(Err(e)) => error!(error = %e, "Rendezvous surface error"),
                Err(e) => error!(error = %e, "Rendezvous task panicked"),
            }
        }
        _ = worker_handle => {
            info!("Scheduler worker exited");
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Tear task actors down before the runtime goes away
    plane.stop_all(std::time::Duration::from_secs(5)).await;
    let _ = pump_handle.await;

    info!("Execution plane shutdown complete");
    Ok(())
}

//! Configuration for the execution plane.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Execution plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Admission cycle interval.
    pub schedule_interval: Duration,

    /// Concurrent substrate create operations allowed.
    pub admission_tokens: usize,

    /// Whether higher-priority pending tasks may preempt running ones.
    pub preemption_enabled: bool,

    /// Skip resource deletion on teardown, for post-mortem inspection.
    pub keep_resources: bool,

    /// Reconciliation feed flush interval.
    pub feed_cooldown: Duration,

    /// Consecutive watch failures tolerated before the plane gives up.
    pub feed_max_failures: u32,

    /// Listen address of the port rendezvous surface.
    pub rendezvous_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let schedule_interval = Duration::from_millis(
            std::env::var("MLGRID_SCHEDULE_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
        );

        let admission_tokens = std::env::var("MLGRID_ADMISSION_TOKENS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8);

        let preemption_enabled = std::env::var("MLGRID_PREEMPTION")
            .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let keep_resources = std::env::var("MLGRID_KEEP_RESOURCES")
            .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let feed_cooldown = Duration::from_millis(
            std::env::var("MLGRID_FEED_COOLDOWN_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(500),
        );

        let feed_max_failures = std::env::var("MLGRID_FEED_MAX_FAILURES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let rendezvous_addr = std::env::var("MLGRID_RENDEZVOUS_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:29400".to_string())
            .parse()
            .context("MLGRID_RENDEZVOUS_ADDR is not a valid socket address")?;

        let log_level = std::env::var("MLGRID_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            schedule_interval,
            admission_tokens,
            preemption_enabled,
            keep_resources,
            feed_cooldown,
            feed_max_failures,
            rendezvous_addr,
            log_level,
        })
    }
}

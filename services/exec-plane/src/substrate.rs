//! Container-orchestration substrate interface and mock implementation.
//!
//! The substrate runs each task as a pair of namespaced resources: a config
//! object carrying the rendered task manifest, and a compute workload that
//! mounts it. The plane only ever creates, deletes, and observes these; the
//! substrate's own scheduler decides node binding.
//!
//! A mock implementation is provided for testing and development.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use mlgrid_id::TaskId;

/// Label attached to every resource the plane creates; the watch is scoped
/// to it.
pub const PLANE_LABEL: &str = "mlgrid";

/// Errors from substrate operations.
#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("failed to create {kind} '{name}': {reason}")]
    CreateFailed {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("failed to delete resources for '{name}': {reason}")]
    DeleteFailed { name: String, reason: String },

    #[error("watch failed: {0}")]
    WatchFailed(String),

    #[error("log stream for '{name}' failed: {reason}")]
    LogStreamFailed { name: String, reason: String },
}

// =============================================================================
// Resource Specs
// =============================================================================

/// The auxiliary config resource; must exist before the workload that
/// mounts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSpec {
    /// Task-unique name shared with the workload resource.
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub data: serde_json::Value,
}

/// The compute workload resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Task-unique name shared with the config resource.
    pub name: String,
    pub task_id: TaskId,
    pub slots: u32,
    pub labels: BTreeMap<String, String>,
    pub manifest: serde_json::Value,
}

/// Builds the task-unique name both resources share.
///
/// The rank keeps gang members distinguishable in substrate listings.
pub fn unique_resource_name(task_id: TaskId, rank: i32) -> String {
    format!("mlgrid-{}-{rank}", task_id.ulid().to_string().to_lowercase())
}

// =============================================================================
// Observed Status
// =============================================================================

/// Coarse workload phase as reported by the substrate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Any phase this plane does not understand; task-fatal for the owner.
    Unknown(String),
}

/// Terminated-container record carried in a status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationStatus {
    pub exit_code: i32,
    pub message: String,
}

/// One observed status of a workload resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub name: String,
    pub phase: WorkloadPhase,

    /// Scheduled condition: the substrate bound the workload to a node.
    pub scheduled: bool,

    /// Ready condition: all containers passed readiness.
    pub ready: bool,

    /// Set when the resource carries a deletion timestamp.
    pub deletion_requested: bool,

    pub node_name: Option<String>,
    pub ip: Option<String>,
    pub ports: Vec<u16>,

    /// Terminated status of the init container, when present.
    pub init_termination: Option<TerminationStatus>,

    /// Terminated status of the main container, when present.
    pub main_termination: Option<TerminationStatus>,
}

impl WorkloadStatus {
    /// A bare pending status for `name`, useful as a builder base.
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: WorkloadPhase::Pending,
            scheduled: false,
            ready: false,
            deletion_requested: false,
            node_name: None,
            ip: None,
            ports: Vec::new(),
            init_termination: None,
            main_termination: None,
        }
    }
}

/// Events yielded by the label-scoped watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstrateEvent {
    /// A status add/update for a workload resource.
    Status(WorkloadStatus),

    /// An informational substrate event attributed to a workload.
    Note {
        workload: String,
        at: DateTime<Utc>,
        message: String,
    },
}

impl SubstrateEvent {
    /// The workload resource name this event concerns.
    pub fn workload_name(&self) -> &str {
        match self {
            Self::Status(s) => &s.name,
            Self::Note { workload, .. } => workload,
        }
    }
}

// =============================================================================
// Substrate Trait
// =============================================================================

/// The external container-orchestration capability.
///
/// Creation order matters: the config resource must exist before the
/// workload that mounts it. Deletion of the pair is keyed by the shared
/// name and must be idempotent on the substrate side.
#[async_trait]
pub trait Substrate: Send + Sync {
    async fn create_config(&self, spec: &ConfigSpec) -> Result<(), SubstrateError>;

    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<(), SubstrateError>;

    /// Deletes both resources sharing `name`.
    async fn delete_resources(&self, name: &str) -> Result<(), SubstrateError>;

    /// Opens a watch over all resources carrying `label`.
    async fn watch(
        &self,
        label: &str,
    ) -> Result<BoxStream<'static, SubstrateEvent>, SubstrateError>;

    /// Streams log lines from the workload's main container.
    async fn stream_logs(&self, name: &str) -> Result<BoxStream<'static, String>, SubstrateError>;
}

// =============================================================================
// Mock Substrate
// =============================================================================

/// In-memory substrate for tests and local development.
///
/// Tests inject observations with [`MockSubstrate::push_event`] and inspect
/// the create/delete calls the plane issued.
pub struct MockSubstrate {
    configs_created: Mutex<Vec<ConfigSpec>>,
    workloads_created: Mutex<Vec<WorkloadSpec>>,
    deletes: Mutex<Vec<String>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<SubstrateEvent>>>,
    log_lines: Mutex<Vec<String>>,
    fail_config_create: AtomicBool,
    fail_workload_create: AtomicBool,
    fail_watch: AtomicBool,
}

impl MockSubstrate {
    pub fn new() -> Self {
        Self {
            configs_created: Mutex::new(Vec::new()),
            workloads_created: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            log_lines: Mutex::new(Vec::new()),
            fail_config_create: AtomicBool::new(false),
            fail_workload_create: AtomicBool::new(false),
            fail_watch: AtomicBool::new(false),
        }
    }

    /// Makes subsequent config creates fail.
    pub fn fail_config_creates(&self) {
        self.fail_config_create.store(true, Ordering::SeqCst);
    }

    /// Makes subsequent workload creates fail.
    pub fn fail_workload_creates(&self) {
        self.fail_workload_create.store(true, Ordering::SeqCst);
    }

    /// Makes subsequent watch opens fail.
    pub fn set_watch_failing(&self, failing: bool) {
        self.fail_watch.store(failing, Ordering::SeqCst);
    }

    /// Seeds lines returned by `stream_logs`.
    pub fn set_log_lines(&self, lines: Vec<String>) {
        *self.log_lines.lock().unwrap() = lines;
    }

    /// Fans an observation out to every open watch.
    pub fn push_event(&self, event: SubstrateEvent) {
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drops all open watches, simulating a lost connection.
    pub fn drop_watchers(&self) {
        self.watchers.lock().unwrap().clear();
    }

    pub fn created_configs(&self) -> Vec<ConfigSpec> {
        self.configs_created.lock().unwrap().clone()
    }

    pub fn created_workloads(&self) -> Vec<WorkloadSpec> {
        self.workloads_created.lock().unwrap().clone()
    }

    /// Names passed to `delete_resources`, in call order.
    pub fn delete_calls(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }
}

impl Default for MockSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Substrate for MockSubstrate {
    async fn create_config(&self, spec: &ConfigSpec) -> Result<(), SubstrateError> {
        if self.fail_config_create.load(Ordering::SeqCst) {
            return Err(SubstrateError::CreateFailed {
                kind: "config",
                name: spec.name.clone(),
                reason: "mock configured to fail".to_string(),
            });
        }
        debug!(name = %spec.name, "[MOCK] created config resource");
        self.configs_created.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<(), SubstrateError> {
        if self.fail_workload_create.load(Ordering::SeqCst) {
            return Err(SubstrateError::CreateFailed {
                kind: "workload",
                name: spec.name.clone(),
                reason: "mock configured to fail".to_string(),
            });
        }
        debug!(name = %spec.name, "[MOCK] created workload resource");
        self.workloads_created.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn delete_resources(&self, name: &str) -> Result<(), SubstrateError> {
        debug!(name = %name, "[MOCK] deleted resource pair");
        self.deletes.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn watch(
        &self,
        _label: &str,
    ) -> Result<BoxStream<'static, SubstrateEvent>, SubstrateError> {
        if self.fail_watch.load(Ordering::SeqCst) {
            return Err(SubstrateError::WatchFailed(
                "mock configured to fail".to_string(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().unwrap().push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn stream_logs(&self, _name: &str) -> Result<BoxStream<'static, String>, SubstrateError> {
        let lines = self.log_lines.lock().unwrap().clone();
        Ok(futures_util::stream::iter(lines).boxed())
    }
}

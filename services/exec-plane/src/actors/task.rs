//! Task execution actor - drives one task's resource pair on the substrate.
//!
//! The actor owns the full lifecycle of one task: it waits for an admission
//! token, creates the config and workload resources, folds the substrate's
//! bursty status stream into the forward-only [`ContainerState`] lifecycle,
//! and tears the resource pair down exactly once. Messages are processed
//! sequentially; no field needs synchronization.
//!
//! ## State Machine
//!
//! ```text
//! waiting_for_admission -> waiting_for_token -> resources_launching
//!     -> assigned -> pulling -> starting -> running -> terminated
//! ```
//!
//! Status observations may skip forward (a deletion can terminate a workload
//! straight from `assigned`) but never regress; duplicate deliveries from
//! the reconciliation feed are dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use mlgrid_events::{
    ContainerState, ExecPlaneEvent, FailureDetail, PlacementReport, TaskLifecycleEvent,
    TaskLogEvent,
};
use mlgrid_id::{GroupId, TaskId};

use super::framework::{Actor, ActorContext, ActorError, ActorHandle};
use crate::substrate::{
    unique_resource_name, ConfigSpec, Substrate, WorkloadPhase, WorkloadSpec, WorkloadStatus,
    PLANE_LABEL,
};
use crate::tokens::{AdmissionTokenPool, TokenGrant};

// =============================================================================
// Messages
// =============================================================================

/// Messages handled by TaskExecutionActor.
#[derive(Debug)]
pub enum TaskMessage {
    /// The scheduler admitted the task; begin the launch sequence.
    Launch {
        /// The actor's own handle, for token grant delivery.
        handle: ActorHandle<TaskMessage>,
    },

    /// One admission token was granted to this actor.
    TokenGranted,

    /// A status observation for this task's workload resource.
    Status(WorkloadStatus),

    /// An informational substrate note attributed to this workload.
    Note {
        at: DateTime<Utc>,
        message: String,
    },

    /// Stop the task and tear its resources down. Idempotent.
    Stop,

    /// Placement query for capacity accounting.
    Placement {
        reply: oneshot::Sender<PlacementSnapshot>,
    },
}

impl From<TokenGrant> for TaskMessage {
    fn from(_: TokenGrant) -> Self {
        TaskMessage::TokenGranted
    }
}

/// Answer to a placement query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementSnapshot {
    pub task_id: TaskId,
    pub slots: u32,
    pub node_name: Option<String>,
    pub ip: Option<String>,
    pub ports: Vec<u16>,

    /// Container lifecycle state, once one has been observed.
    pub state: Option<ContainerState>,
}

// =============================================================================
// Actor State
// =============================================================================

/// Execution phase before the first container state is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecPhase {
    WaitingForAdmission,
    WaitingForToken,
    ResourcesLaunching,
    Container(ContainerState),
}

/// What a task launches with.
#[derive(Debug, Clone)]
pub struct TaskLaunchSpec {
    pub task_id: TaskId,
    pub group_id: GroupId,

    /// Rank within the owning group's gang.
    pub rank: i32,
    pub slots: u32,
}

/// Actor owning one task's substrate resource pair.
pub struct TaskExecutionActor {
    spec: TaskLaunchSpec,
    substrate: Arc<dyn Substrate>,
    tokens: Arc<AdmissionTokenPool<TaskMessage>>,
    events: tokio::sync::mpsc::UnboundedSender<ExecPlaneEvent>,

    /// Skip resource deletion on teardown, for post-mortem inspection.
    keep_resources: bool,

    /// Name shared by both substrate resources.
    resource_name: String,

    phase: ExecPhase,

    /// Set once deletion has been requested (or is known unnecessary);
    /// repeated teardown requests are then no-ops.
    resources_deleted: bool,

    /// True when this actor issued the deletion itself, as opposed to the
    /// substrate deleting the workload behind our back.
    deleted_by_us: bool,

    node_name: Option<String>,
    ip: Option<String>,
    ports: Vec<u16>,

    log_worker: Option<tokio::task::JoinHandle<()>>,
}

impl TaskExecutionActor {
    pub fn new(
        spec: TaskLaunchSpec,
        substrate: Arc<dyn Substrate>,
        tokens: Arc<AdmissionTokenPool<TaskMessage>>,
        events: tokio::sync::mpsc::UnboundedSender<ExecPlaneEvent>,
        keep_resources: bool,
    ) -> Self {
        let resource_name = unique_resource_name(spec.task_id, spec.rank);
        Self {
            spec,
            substrate,
            tokens,
            events,
            keep_resources,
            resource_name,
            phase: ExecPhase::WaitingForAdmission,
            resources_deleted: false,
            deleted_by_us: false,
            node_name: None,
            ip: None,
            ports: Vec::new(),
            log_worker: None,
        }
    }

    /// The name both substrate resources share.
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    fn container_state(&self) -> Option<ContainerState> {
        match self.phase {
            ExecPhase::Container(state) => Some(state),
            _ => None,
        }
    }

    fn is_terminal(&self) -> bool {
        self.container_state().is_some_and(|s| s.is_terminal())
    }

    fn send_event(&self, event: ExecPlaneEvent) {
        if self.events.send(event).is_err() {
            warn!(task_id = %self.spec.task_id, "event consumer gone, dropping event");
        }
    }

    fn send_log(&self, message: String) {
        self.send_event(ExecPlaneEvent::Log(TaskLogEvent {
            task_id: self.spec.task_id,
            timestamp: Utc::now(),
            message,
        }));
    }

    // -------------------------------------------------------------------------
    // Launch
    // -------------------------------------------------------------------------

    fn handle_launch(&mut self, handle: ActorHandle<TaskMessage>) {
        if self.phase != ExecPhase::WaitingForAdmission {
            warn!(task_id = %self.spec.task_id, phase = ?self.phase, "duplicate launch ignored");
            return;
        }
        self.phase = ExecPhase::WaitingForToken;
        // No substrate call happens before the grant arrives.
        self.tokens.request(self.spec.task_id, handle);
    }

    async fn handle_token_granted(&mut self) -> Result<bool, ActorError> {
        if self.phase != ExecPhase::WaitingForToken {
            // A grant can race a stop; the slot was already returned.
            debug!(task_id = %self.spec.task_id, phase = ?self.phase, "late token grant ignored");
            return Ok(true);
        }
        self.phase = ExecPhase::ResourcesLaunching;

        let result = self.create_resources().await;
        // The token covers the create calls only, whatever their outcome.
        self.tokens.release(self.spec.task_id);

        if let Err(e) = result {
            // Surface the error text to the owner before failing the task.
            self.send_log(format!("failed to launch task resources: {e}"));
            error!(task_id = %self.spec.task_id, error = %e, "resource creation failed");
            self.terminate(Some(FailureDetail {
                exit_code: None,
                message: e.to_string(),
            }))
            .await;
            return Ok(false);
        }

        info!(
            task_id = %self.spec.task_id,
            resource = %self.resource_name,
            slots = self.spec.slots,
            "task resources launched"
        );
        Ok(true)
    }

    async fn create_resources(&mut self) -> Result<(), crate::substrate::SubstrateError> {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), PLANE_LABEL.to_string());
        labels.insert("task-id".to_string(), self.spec.task_id.to_string());

        // The workload mounts the config object, so the config goes first.
        let config = ConfigSpec {
            name: self.resource_name.clone(),
            labels: labels.clone(),
            data: serde_json::json!({
                "task_id": self.spec.task_id,
                "group_id": self.spec.group_id,
                "rank": self.spec.rank,
            }),
        };
        self.substrate.create_config(&config).await?;

        let workload = WorkloadSpec {
            name: self.resource_name.clone(),
            task_id: self.spec.task_id,
            slots: self.spec.slots,
            labels,
            manifest: serde_json::json!({
                "rank": self.spec.rank,
                "slots": self.spec.slots,
            }),
        };
        self.substrate.create_workload(&workload).await
    }

    // -------------------------------------------------------------------------
    // Status Reconciliation
    // -------------------------------------------------------------------------

    async fn handle_status(&mut self, status: WorkloadStatus) -> Result<bool, ActorError> {
        if self.is_terminal() {
            // Terminal re-delivery; nothing follows Terminated.
            return Ok(false);
        }

        if status.node_name.is_some() {
            self.node_name = status.node_name.clone();
        }
        if status.ip.is_some() {
            self.ip = status.ip.clone();
        }
        if !status.ports.is_empty() {
            self.ports = status.ports.clone();
        }

        // The substrate sometimes omits a terminal phase when a workload is
        // deleted; a deletion timestamp on a non-terminal workload is folded
        // into a synthetic kill.
        if status.deletion_requested {
            if !self.deleted_by_us {
                error!(
                    task_id = %self.spec.task_id,
                    resource = %self.resource_name,
                    "workload deleted by the substrate, not by this plane"
                );
            }
            self.resources_deleted = true;
            self.terminate(Some(FailureDetail::killed())).await;
            return Ok(false);
        }

        match status.phase {
            WorkloadPhase::Pending if !status.scheduled => {
                self.advance(ContainerState::Assigned);
                Ok(true)
            }
            WorkloadPhase::Pending => {
                // Scheduled but not ready: the image is being pulled. The
                // substrate never reports the pull itself, so it is
                // synthesized between Assigned and Starting.
                if self.container_state() == Some(ContainerState::Assigned) {
                    self.advance(ContainerState::Pulling);
                }
                self.advance(ContainerState::Starting);
                Ok(true)
            }
            WorkloadPhase::Running => {
                if self.advance(ContainerState::Running) {
                    self.report_placement();
                    self.spawn_log_worker();
                }
                Ok(true)
            }
            WorkloadPhase::Succeeded => {
                self.terminate(None).await;
                Ok(false)
            }
            WorkloadPhase::Failed => {
                let failure = match exit_detail(&status) {
                    Ok(detail) => detail,
                    Err(message) => {
                        error!(task_id = %self.spec.task_id, "malformed terminal status: {message}");
                        FailureDetail {
                            exit_code: None,
                            message,
                        }
                    }
                };
                self.terminate(Some(failure)).await;
                Ok(false)
            }
            WorkloadPhase::Unknown(ref phase) => {
                error!(task_id = %self.spec.task_id, phase = %phase, "unexpected workload phase");
                self.terminate(Some(FailureDetail {
                    exit_code: None,
                    message: format!("unexpected workload phase: {phase}"),
                }))
                .await;
                Ok(false)
            }
        }
    }

    /// Advances the container lifecycle, returning true when the state
    /// changed. Duplicates and regressions from re-delivered statuses are
    /// dropped.
    fn advance(&mut self, next: ContainerState) -> bool {
        let new = match self.container_state() {
            None => next,
            Some(current) => match current.transition(next) {
                Ok(state) => state,
                Err(_) => {
                    debug!(
                        task_id = %self.spec.task_id,
                        current = %current,
                        observed = %next,
                        "dropping non-advancing status"
                    );
                    return false;
                }
            },
        };

        info!(task_id = %self.spec.task_id, state = %new, "container state advanced");
        self.phase = ExecPhase::Container(new);
        self.send_event(ExecPlaneEvent::Lifecycle(TaskLifecycleEvent {
            task_id: self.spec.task_id,
            state: new,
            failure: None,
        }));
        true
    }

    fn handle_note(&mut self, at: DateTime<Utc>, message: String) {
        // Notes only matter while the workload is still starting.
        let starting = match self.container_state() {
            None => !matches!(self.phase, ExecPhase::WaitingForAdmission),
            Some(state) => state < ContainerState::Running,
        };
        if !starting {
            return;
        }
        self.send_event(ExecPlaneEvent::Log(TaskLogEvent {
            task_id: self.spec.task_id,
            timestamp: at,
            message,
        }));
    }

    fn report_placement(&self) {
        let (Some(node_name), Some(ip)) = (self.node_name.clone(), self.ip.clone()) else {
            warn!(task_id = %self.spec.task_id, "placement report skipped, node unknown");
            return;
        };
        self.send_event(ExecPlaneEvent::Placement(PlacementReport {
            task_id: self.spec.task_id,
            rank: self.spec.rank,
            node_name,
            ip,
            ports: self.ports.clone(),
        }));
    }

    fn spawn_log_worker(&mut self) {
        let substrate = Arc::clone(&self.substrate);
        let events = self.events.clone();
        let task_id = self.spec.task_id;
        let name = self.resource_name.clone();

        self.log_worker = Some(tokio::spawn(async move {
            let mut stream = match substrate.stream_logs(&name).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "log stream unavailable");
                    return;
                }
            };
            while let Some(line) = stream.next().await {
                let event = ExecPlaneEvent::Log(TaskLogEvent {
                    task_id,
                    timestamp: Utc::now(),
                    message: line,
                });
                if events.send(event).is_err() {
                    return;
                }
            }
            debug!(task_id = %task_id, "log stream ended");
        }));
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    async fn handle_stop(&mut self) -> Result<bool, ActorError> {
        if self.is_terminal() {
            // Duplicate stop; resources are already handled.
            debug!(task_id = %self.spec.task_id, "stop on terminated task is a no-op");
            return Ok(false);
        }

        match self.phase {
            ExecPhase::WaitingForAdmission | ExecPhase::WaitingForToken => {
                // Nothing was created; leave the token wait set and mark the
                // resources deleted so no delete is ever issued.
                self.tokens.release(self.spec.task_id);
                self.resources_deleted = true;
            }
            _ => {}
        }

        self.terminate(Some(FailureDetail {
            exit_code: None,
            message: "task stopped".to_string(),
        }))
        .await;
        Ok(false)
    }

    /// Moves the lifecycle to Terminated, reports upward, and tears the
    /// resource pair down. Safe to call at most once per actor; callers
    /// guard on `is_terminal`.
    async fn terminate(&mut self, failure: Option<FailureDetail>) {
        if let Some(worker) = self.log_worker.take() {
            worker.abort();
        }

        self.phase = ExecPhase::Container(ContainerState::Terminated);

        if self.node_name.is_some() {
            self.report_placement();
        }
        info!(
            task_id = %self.spec.task_id,
            failed = failure.is_some(),
            "task terminated"
        );
        self.send_event(ExecPlaneEvent::Lifecycle(TaskLifecycleEvent {
            task_id: self.spec.task_id,
            state: ContainerState::Terminated,
            failure,
        }));

        self.teardown().await;
    }

    /// Issues the resource-pair deletion exactly once.
    async fn teardown(&mut self) {
        if self.resources_deleted {
            return;
        }
        self.resources_deleted = true;

        if self.keep_resources {
            info!(
                task_id = %self.spec.task_id,
                resource = %self.resource_name,
                "keeping substrate resources for inspection"
            );
            return;
        }

        self.deleted_by_us = true;
        // Deletion is idempotent on the substrate side; a failure here is
        // logged, not retried.
        if let Err(e) = self.substrate.delete_resources(&self.resource_name).await {
            warn!(
                task_id = %self.spec.task_id,
                resource = %self.resource_name,
                error = %e,
                "resource deletion failed"
            );
        }
    }
}

#[async_trait]
impl Actor for TaskExecutionActor {
    type Message = TaskMessage;

    fn name(&self) -> &str {
        "task_execution"
    }

    async fn handle(
        &mut self,
        msg: TaskMessage,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        match msg {
            TaskMessage::Launch { handle } => {
                self.handle_launch(handle);
                Ok(true)
            }
            TaskMessage::TokenGranted => self.handle_token_granted().await,
            TaskMessage::Status(status) => self.handle_status(status).await,
            TaskMessage::Note { at, message } => {
                self.handle_note(at, message);
                Ok(true)
            }
            TaskMessage::Stop => self.handle_stop().await,
            TaskMessage::Placement { reply } => {
                let _ = reply.send(PlacementSnapshot {
                    task_id: self.spec.task_id,
                    slots: self.spec.slots,
                    node_name: self.node_name.clone(),
                    ip: self.ip.clone(),
                    ports: self.ports.clone(),
                    state: self.container_state(),
                });
                Ok(true)
            }
        }
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        // The owner and tracker must never be left waiting: an exit on any
        // path synthesizes a terminal transition first.
        if !self.is_terminal() {
            self.tokens.release(self.spec.task_id);
            if matches!(
                self.phase,
                ExecPhase::WaitingForAdmission | ExecPhase::WaitingForToken
            ) {
                // Nothing was created; there is nothing to delete.
                self.resources_deleted = true;
            }
            self.terminate(Some(FailureDetail {
                exit_code: None,
                message: "task actor exited unexpectedly".to_string(),
            }))
            .await;
        }
    }
}

/// Extracts the failure detail of a Failed status.
///
/// The init resource's terminated record wins when its exit code is
/// non-zero; otherwise the main resource's record is used. A status with no
/// terminated record at all is malformed.
fn exit_detail(status: &WorkloadStatus) -> Result<FailureDetail, String> {
    if let Some(init) = &status.init_termination {
        if init.exit_code != 0 {
            return Ok(FailureDetail {
                exit_code: Some(init.exit_code),
                message: init.message.clone(),
            });
        }
    }
    match &status.main_termination {
        Some(main) => Ok(FailureDetail {
            exit_code: Some(main.exit_code),
            message: main.message.clone(),
        }),
        None => Err(format!(
            "workload '{}' failed without a terminated container status",
            status.name
        )),
    }
}

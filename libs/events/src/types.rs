//! Event payloads and the container lifecycle state machine.

use chrono::{DateTime, Utc};
use mlgrid_id::TaskId;
use serde::{Deserialize, Serialize};

use crate::StateError;

/// Exit code reported when the substrate deletes a workload without emitting
/// a terminal phase. Matches the conventional SIGKILL code.
pub const KILLED_EXIT_CODE: i32 = 137;

/// Exit code of a successful container.
pub const SUCCESS_EXIT_CODE: i32 = 0;

// =============================================================================
// Container State
// =============================================================================

/// Lifecycle state of a task's container on the substrate.
///
/// States are strictly ordered and forward-only: a transition may skip
/// intermediate states but never regress, and nothing follows `Terminated`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Admitted; no substrate placement observed yet.
    Assigned,
    /// Placed on a node; the image is being pulled.
    Pulling,
    /// Image present; the container is starting.
    Starting,
    /// The container is running.
    Running,
    /// The container has exited, successfully or not.
    Terminated,
}

impl ContainerState {
    /// Returns true once the lifecycle has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Validates a transition to `next`, returning the new state.
    ///
    /// A transition to the current state is rejected as a regression; callers
    /// are expected to drop duplicate observations before transitioning.
    pub fn transition(self, next: ContainerState) -> Result<ContainerState, StateError> {
        if self.is_terminal() {
            return Err(StateError::AfterTerminal { to: next });
        }
        if next <= self {
            return Err(StateError::Regression {
                from: self,
                to: next,
            });
        }
        Ok(next)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Assigned => "assigned",
            Self::Pulling => "pulling",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Event Payloads
// =============================================================================

/// Why a terminated task failed, if it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// Container exit code, when one was reported or synthesized.
    pub exit_code: Option<i32>,

    /// Human-readable failure message.
    pub message: String,
}

impl FailureDetail {
    /// A failure synthesized for a workload the substrate deleted without a
    /// terminal phase.
    pub fn killed() -> Self {
        Self {
            exit_code: Some(KILLED_EXIT_CODE),
            message: "workload deleted before reporting a terminal phase".to_string(),
        }
    }
}

/// A container lifecycle transition for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLifecycleEvent {
    pub task_id: TaskId,
    pub state: ContainerState,

    /// Present only for failed terminations.
    pub failure: Option<FailureDetail>,
}

/// An auxiliary log line attributed to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogEvent {
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Where a task landed, reported on start and on termination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementReport {
    pub task_id: TaskId,

    /// Rank of this task within its group's gang.
    pub rank: i32,
    pub node_name: String,
    pub ip: String,
    pub ports: Vec<u16>,
}

/// Envelope for everything the execution plane reports upward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecPlaneEvent {
    Lifecycle(TaskLifecycleEvent),
    Log(TaskLogEvent),
    Placement(PlacementReport),
}

impl ExecPlaneEvent {
    /// The task this event concerns.
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Lifecycle(e) => e.task_id,
            Self::Log(e) => e.task_id,
            Self::Placement(e) => e.task_id,
        }
    }
}

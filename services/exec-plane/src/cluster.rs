//! Cluster data model and capacity accounting.
//!
//! The scheduler never sees live state: each admission cycle operates on an
//! immutable [`ClusterSnapshot`] produced here, and its decisions are applied
//! back through [`ClusterState`]. Capacity moves in two independent
//! dimensions per agent: slot capacity for positive-demand tasks and a
//! container-count quota for zero-slot tasks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use mlgrid_id::{AgentId, AllocationId, GroupId, TaskId};

/// Errors from live cluster-state mutations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),

    #[error("task {0} already holds an allocation")]
    AlreadyAllocated(TaskId),
}

// =============================================================================
// Records
// =============================================================================

/// A priority group owning tasks. Lower priority value is served first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub priority: i32,
}

/// Binds a task to an agent for the lifetime of one admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: AllocationId,
    pub agent: AgentId,
    pub created_at: DateTime<Utc>,
}

/// A schedulable workload process.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub group: GroupId,

    /// Slot demand; zero-slot tasks are metered against the container quota.
    pub slots_needed: u32,

    /// Rank of this process within its group's gang.
    pub rank: i32,

    /// Submission time, the tie-break within a priority level.
    pub submitted_at: DateTime<Utc>,

    /// Restricts the task to agents carrying the same pool label.
    pub pool_label: Option<String>,

    pub allocation: Option<Allocation>,

    /// Set once the substrate reports the container running.
    pub container_started: bool,
}

impl Task {
    /// Pending tasks are those awaiting an allocation.
    pub fn is_pending(&self) -> bool {
        self.allocation.is_none()
    }

    pub fn is_zero_slot(&self) -> bool {
        self.slots_needed == 0
    }
}

/// A compute node in the shared pool.
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: AgentId,
    pub slots: u32,
    pub zero_slot_capacity: u32,
    pub used_slots: u32,
    pub zero_slot_containers: u32,
    pub pool_label: Option<String>,
}

impl Agent {
    pub fn remaining_slots(&self) -> u32 {
        self.slots.saturating_sub(self.used_slots)
    }

    pub fn remaining_zero_slot_quota(&self) -> u32 {
        self.zero_slot_capacity.saturating_sub(self.zero_slot_containers)
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable view of tasks, groups and agents for one admission cycle.
///
/// Agent order is stable (registration order); the fitting policy's
/// tie-break depends on it.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub tasks: Vec<Task>,
    pub groups: HashMap<GroupId, Group>,
    pub agents: Vec<Agent>,
}

// =============================================================================
// Live State
// =============================================================================

/// Live cluster state, mutated by admissions and lifecycle reports.
///
/// Allocation consumes agent capacity immediately; waiting for the container
/// to start would let consecutive cycles double-book the launch window.
#[derive(Debug, Default)]
pub struct ClusterState {
    tasks: HashMap<TaskId, Task>,
    groups: HashMap<GroupId, Group>,
    agents: Vec<Agent>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&mut self, group: Group) {
        self.groups.insert(group.id, group);
    }

    pub fn add_agent(&mut self, agent: Agent) {
        self.agents.push(agent);
    }

    pub fn submit_task(&mut self, task: Task) {
        self.tasks.insert(task.id, task);
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Produces the immutable snapshot for one scheduler cycle.
    ///
    /// Tasks are ordered by submission time so the scheduler's in-level walk
    /// is deterministic.
    pub fn snapshot(&self) -> ClusterSnapshot {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        ClusterSnapshot {
            tasks,
            groups: self.groups.clone(),
            agents: self.agents.clone(),
        }
    }

    /// Applies an admission: binds the task to the agent and reserves
    /// capacity.
    pub fn allocate(&mut self, task_id: TaskId, agent_id: AgentId) -> Result<Allocation, ClusterError> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(ClusterError::UnknownTask(task_id))?;
        if task.allocation.is_some() {
            return Err(ClusterError::AlreadyAllocated(task_id));
        }
        let agent = self
            .agents
            .iter_mut()
            .find(|a| a.id == agent_id)
            .ok_or(ClusterError::UnknownAgent(agent_id))?;

        if task.slots_needed == 0 {
            agent.zero_slot_containers += 1;
        } else {
            agent.used_slots += task.slots_needed;
        }

        let allocation = Allocation {
            id: AllocationId::new(),
            agent: agent_id,
            created_at: Utc::now(),
        };
        task.allocation = Some(allocation.clone());
        Ok(allocation)
    }

    /// Records that the substrate reported the task's container running.
    pub fn mark_started(&mut self, task_id: TaskId) -> Result<(), ClusterError> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(ClusterError::UnknownTask(task_id))?;
        task.container_started = true;
        Ok(())
    }

    /// Removes a terminated task and returns its capacity to the agent.
    ///
    /// Unknown tasks are tolerated: terminal events can be re-delivered.
    pub fn remove_task(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.remove(&task_id) else {
            return;
        };
        let Some(allocation) = task.allocation else {
            return;
        };
        match self.agents.iter_mut().find(|a| a.id == allocation.agent) {
            Some(agent) => {
                if task.slots_needed == 0 {
                    agent.zero_slot_containers = agent.zero_slot_containers.saturating_sub(1);
                } else {
                    agent.used_slots = agent.used_slots.saturating_sub(task.slots_needed);
                }
            }
            None => {
                warn!(task_id = %task_id, agent_id = %allocation.agent, "terminated task referenced an unknown agent");
            }
        }
    }

    pub fn pending_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(|t| t.is_pending())
    }
}

//! mlgrid Execution Plane
//!
//! The execution control plane of the mlgrid training platform: it places
//! priority-ranked, multi-process training workloads onto a shared pool of
//! compute agents and drives a container-orchestration substrate to run and
//! tear down the resulting processes.
//!
//! ## Architecture
//!
//! - **PriorityScheduler**: cycle-based placement over an immutable
//!   snapshot; proposes admissions and preemptions
//! - **TaskExecutionActor**: per-task state machine owning one substrate
//!   resource pair
//! - **AdmissionTokenPool**: bounds concurrent substrate create calls
//! - **ReconciliationFeed**: label-scoped watch, cooldown-flushed delivery
//! - **PortRendezvous**: dynamic port discovery among a group's tasks
//! - **ExecutionPlane**: the glue applying scheduler outcomes and
//!   consuming actor events
//!
//! ## Modules
//!
//! - `actors`: actor framework and the task execution actor
//! - `cluster`: tasks, groups, agents, allocations, capacity accounting
//! - `scheduler`: the placement algorithm, fitting policy and worker
//! - `substrate`: the orchestration substrate as an async capability

pub mod actors;
pub mod cluster;
pub mod config;
pub mod feed;
pub mod plane;
pub mod rendezvous;
pub mod scheduler;
pub mod substrate;
pub mod tokens;

// Re-export commonly used types
pub use cluster::{Agent, Allocation, ClusterSnapshot, ClusterState, Group, Task};
pub use plane::{ExecutionPlane, PlaneConfig};
pub use scheduler::{BestFit, PriorityScheduler, ScheduleOutcome, SchedulerWorker};
pub use substrate::{MockSubstrate, Substrate};

//! Priority scheduling for the execution plane.
//!
//! The scheduler is a pure function over an immutable cluster snapshot: it
//! proposes admissions and preemptions but mutates nothing. The worker runs
//! it on a periodic interval; concurrent admissions and terminations become
//! visible on the next cycle.

mod fitting;
mod priority;
mod worker;

pub use fitting::{AgentCapacity, BestFit, FittingPolicy};
pub use priority::{
    Admission, CycleStats, PriorityScheduler, ScheduleOutcome, SchedulerError, SchedulerResult,
};
pub use worker::SchedulerWorker;

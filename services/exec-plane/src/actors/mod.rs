//! Actor framework and per-task execution actors.

mod framework;
mod task;

pub use framework::{
    spawn_actor, Actor, ActorContext, ActorError, ActorHandle, ActorRef, BackoffPolicy, Message,
};
pub use task::{PlacementSnapshot, TaskExecutionActor, TaskLaunchSpec, TaskMessage};

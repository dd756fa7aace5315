//! # mlgrid-events
//!
//! Event types flowing upward from the execution plane to job owners and the
//! cluster capacity tracker: container lifecycle transitions, auxiliary log
//! lines, and placement reports.
//!
//! The central type is [`ContainerState`], a forward-only lifecycle enum.
//! Transitions are checked: a state never regresses and nothing follows
//! `Terminated`. Consumers may therefore apply events idempotently without
//! tracking their own history.

mod error;
mod types;

pub use error::StateError;
pub use types::*;

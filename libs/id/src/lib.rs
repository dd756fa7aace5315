//! # mlgrid-id
//!
//! Typed resource identifiers for the mlgrid execution plane.
//!
//! Every scheduling entity (task, group, agent, allocation) is identified by
//! a prefixed ULID: `{prefix}_{ulid}`. Examples:
//!
//! - `task_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `grp_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! The format gives us type safety (a `TaskId` never parses as an
//! `AgentId`), time-ordered sortability, and readable log output. Parsing is
//! strict: round-trips (`parse` → `Display` → `parse`) are guaranteed.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

//! Errors for lifecycle state handling.

use thiserror::Error;

use crate::ContainerState;

/// Errors that can occur when transitioning container state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    /// The requested transition would move the lifecycle backwards.
    #[error("container state cannot regress from {from} to {to}")]
    Regression {
        from: ContainerState,
        to: ContainerState,
    },

    /// The container has already terminated; no further transitions exist.
    #[error("container state is terminal, cannot transition to {to}")]
    AfterTerminal { to: ContainerState },
}

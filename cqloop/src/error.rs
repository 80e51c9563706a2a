use std::any::Any;
use std::fmt;

use thiserror::Error;

/// Errors reported by engine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The engine is tearing down and no longer accepts external
    /// completions.
    #[error("engine is shutting down")]
    Shutdown,

    /// The alarm already has an outstanding wait.
    #[error("alarm already has a pending wait")]
    AlarmPending,
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a spawned task did not produce its output.
#[derive(Error)]
pub enum JoinError {
    /// The task was aborted, or the engine was torn down before it
    /// finished.
    #[error("task was cancelled")]
    Cancelled,

    /// The task's future panicked. Carries the panic payload.
    #[error("task panicked")]
    Panicked(Box<dyn Any + Send + 'static>),
}

impl JoinError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JoinError::Cancelled)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, JoinError::Panicked(_))
    }

    /// Returns the panic payload, if the task panicked.
    pub fn into_panic(self) -> Option<Box<dyn Any + Send + 'static>> {
        match self {
            JoinError::Panicked(payload) => Some(payload),
            JoinError::Cancelled => None,
        }
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Cancelled => f.write_str("Cancelled"),
            JoinError::Panicked(_) => f.write_str("Panicked(..)"),
        }
    }
}

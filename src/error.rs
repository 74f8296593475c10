//! Error types for the delegation core.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Message bus errors. Raised synchronously to the immediate caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Receiver '{id}' is not registered")]
    UnknownReceiver { id: String },

    #[error("Worker '{id}' is not registered")]
    UnknownWorker { id: String },

    #[error("Worker '{id}' is already registered")]
    AlreadyRegistered { id: String },

    #[error("No answer received within {timeout:?}")]
    Timeout { timeout: Duration },
}

/// Task manager errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {task_id} not found")]
    NotFound { task_id: String },

    #[error("Task {task_id} already exists")]
    AlreadyExists { task_id: String },

    #[error("Task {task_id} is {status}, expected {expected}")]
    InvalidState {
        task_id: String,
        status: String,
        expected: String,
    },

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Errors surfaced by the dispatch layer.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown worker '{name}'. Available: {available}")]
    UnknownWorker { name: String, available: String },

    #[error("Worker {worker} failed: {reason}")]
    WorkerFailed { worker: String, reason: String },

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Errors a worker sees through its [`WorkerContext`](crate::worker::WorkerContext).
///
/// Runners may return these (wrapped in `anyhow::Error`); `Cancelled` is
/// recognised and recorded as a cancelled task rather than a failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("Task was cancelled")]
    Cancelled,

    #[error("Cannot ask parent: no communication channel available")]
    NoParentChannel,

    #[error("Parent did not respond within {timeout:?}")]
    ParentTimeout { timeout: Duration },

    #[error("Parent is not available: {reason}")]
    ParentUnavailable { reason: String },
}

impl From<BusError> for WorkerError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Timeout { timeout } => Self::ParentTimeout { timeout },
            other => Self::ParentUnavailable {
                reason: other.to_string(),
            },
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for forkpool.

use crate::pool::WorkerId;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Setup error: {0}")]
    Setup(#[from] SetupError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while constructing a pool.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("A pool needs at least one queue")]
    NoQueues,
}

/// Errors raised before a worker's computation gets to run.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Input for task {key} failed to materialize: {reason}")]
    Input { key: String, reason: String },

    #[error("Could not encode {what} for worker {worker_id}: {reason}")]
    Encode {
        worker_id: WorkerId,
        what: &'static str,
        reason: String,
    },

    #[error("Could not spawn execution context for worker {worker_id}: {reason}")]
    Spawn { worker_id: WorkerId, reason: String },

    #[error("Could not build runtime for worker {worker_id}: {reason}")]
    Runtime { worker_id: WorkerId, reason: String },
}

/// Errors raised by reconstructing or running a computation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Operator {name} is not registered")]
    UnknownOperator { name: String },

    #[error("Capability version mismatch: runtime offers {expected}, computation needs {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Malformed computation: {reason}")]
    MalformedComputation { reason: String },

    #[error("Invalid parameters for operator {operator}: {reason}")]
    InvalidParams { operator: String, reason: String },

    #[error("Invalid input for operator {operator}: {reason}")]
    InvalidInput { operator: String, reason: String },

    #[error("Operator {operator} failed: {reason}")]
    Failed { operator: String, reason: String },

    #[error("Worker panicked: {reason}")]
    Panicked { reason: String },

    #[error("Child task {key} failed: {reason}")]
    Child { key: String, reason: String },

    #[error("Cancelled")]
    Cancelled,
}

impl ExecutionError {
    /// Shorthand for an operator failure.
    pub fn failed(operator: impl Into<String>, reason: impl ToString) -> Self {
        Self::Failed {
            operator: operator.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for an undecodable input item.
    pub fn invalid_input(operator: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidInput {
            operator: operator.into(),
            reason: reason.to_string(),
        }
    }
}

/// Violations of the worker wire protocol, detected on the orchestrating side.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Worker {worker_id} exited without a terminal message")]
    MissingTerminal { worker_id: WorkerId },

    #[error("Worker {worker_id} sent a malformed message: {reason}")]
    Malformed { worker_id: WorkerId, reason: String },

    #[error("Worker {worker_id} sent a message tagged for worker {found}")]
    WorkerIdMismatch { worker_id: WorkerId, found: WorkerId },
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Result type alias for forkpool.
pub type Result<T> = std::result::Result<T, Error>;

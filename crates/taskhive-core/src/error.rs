//! Unified error types for TaskHive.

use thiserror::Error;

/// Result type alias using TaskhiveError.
pub type Result<T> = std::result::Result<T, TaskhiveError>;

#[derive(Error, Debug)]
pub enum TaskhiveError {
    // Submission errors, surfaced synchronously to the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Dependency cycle: {0}")]
    DependencyCycle(String),

    // Execution errors, captured onto the task record
    #[error("Safety check failed: {0}")]
    SafetyRejected(String),

    #[error("Not approved: {0}")]
    NotApproved(String),

    #[error("Action error: {0}")]
    Action(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // Scheduling errors
    #[error("Schedule error: {0}")]
    Schedule(String),

    // Persistence errors are non-fatal, logged and retried on the next cycle
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TaskhiveError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn schedule(msg: impl Into<String>) -> Self {
        Self::Schedule(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

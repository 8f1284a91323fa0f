//! Error types for batch scheduling operations.
//!
//! Subsystem errors (`PoolError`, `ConfigError`, `ExecutorError`) live next to
//! their subsystems; this module holds progress-tracking errors and the
//! crate-level [`SchedulerError`] they convert into.
//!
//! Task and worker failures never appear here: they are contained in the
//! worker pool and reported through events and batch reports.

use thiserror::Error;

use crate::config::ConfigError;
use crate::scheduler::worker_pool::PoolError;

/// Errors that can occur while tracking batch progress.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProgressError {
    #[error("Batch '{0}' is not registered")]
    UnknownBatch(String),

    #[error("Batch '{0}' is already registered")]
    DuplicateBatch(String),

    #[error("Task '{task_id}' is not part of batch '{batch_id}'")]
    UnknownTask { batch_id: String, task_id: String },

    #[error("Task '{task_id}' already belongs to batch '{batch_id}'")]
    DuplicateTask { batch_id: String, task_id: String },

    #[error("Invalid status transition for task '{task_id}' from '{from}' to '{to}'")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },
}

/// Top-level error type for the batch processing system.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Progress tracking error: {0}")]
    Progress(#[from] ProgressError),

    #[error("Task '{0}' is already queued or running")]
    DuplicateTask(String),

    #[error("Batch '{0}' was already submitted")]
    DuplicateBatch(String),

    #[error("Batch system has shut down")]
    ShutDown,

    #[error("Scheduler control loop is gone: {0}")]
    ChannelClosed(String),
}

/// Result type alias for scheduler operations.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_error_display() {
        let err = ProgressError::InvalidTransition {
            task_id: "t-1".to_string(),
            from: "completed".to_string(),
            to: "active".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("t-1"));
        assert!(message.contains("completed"));
        assert!(message.contains("active"));
    }

    #[test]
    fn test_scheduler_error_from_progress() {
        let err: SchedulerError = ProgressError::UnknownBatch("b-9".to_string()).into();
        assert!(matches!(err, SchedulerError::Progress(_)));
        assert!(err.to_string().contains("b-9"));
    }

    #[test]
    fn test_scheduler_error_display() {
        assert!(SchedulerError::ShutDown.to_string().contains("shut down"));
        assert!(SchedulerError::DuplicateTask("dup".to_string())
            .to_string()
            .contains("dup"));
    }
}

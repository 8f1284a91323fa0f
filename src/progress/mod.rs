//! Batch and task progress tracking.
//!
//! [`ProgressTracker`] is the authoritative source of per-batch and global
//! task counts. Each status change moves exactly one task from one counter to
//! another in a single call, and batch completion is detected in the same
//! call that records the last terminal transition.

mod tracker;

pub use tracker::{GlobalProgress, ProgressTracker};

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scheduler::task::duration_millis;

/// Status of a task inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker (initially, or while waiting out a retry).
    Queued,
    /// Bound to a worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Exhausted its retries.
    Failed,
}

impl TaskStatus {
    /// Returns whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Returns whether a task may move from `self` to `next`.
    ///
    /// Allowed: `queued -> active`, `active -> completed|failed`, and
    /// `active -> queued` when a failed attempt is scheduled for retry.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Active)
                | (TaskStatus::Active, TaskStatus::Completed)
                | (TaskStatus::Active, TaskStatus::Failed)
                | (TaskStatus::Active, TaskStatus::Queued)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Active => write!(f, "active"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Aggregate status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Some tasks have not reached a terminal state.
    Active,
    /// Every task completed.
    Completed,
    /// Every task is terminal, some failed and some completed.
    CompletedWithErrors,
    /// Every task failed.
    Failed,
}

impl BatchStatus {
    /// Terminal status for a batch with the given outcome counts.
    pub fn from_outcome(completed: usize, failed: usize) -> Self {
        match (completed, failed) {
            (_, 0) => BatchStatus::Completed,
            (0, _) => BatchStatus::Failed,
            _ => BatchStatus::CompletedWithErrors,
        }
    }

    /// Returns whether the batch is finished.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Active)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::Active => write!(f, "active"),
            BatchStatus::Completed => write!(f, "completed"),
            BatchStatus::CompletedWithErrors => write!(f, "completed_with_errors"),
            BatchStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of one batch's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    /// Batch id.
    pub batch_id: String,
    /// Number of tasks registered for the batch.
    pub total_tasks: usize,
    /// Tasks waiting for a worker.
    pub queued_tasks: usize,
    /// Tasks bound to a worker.
    pub active_tasks: usize,
    /// Tasks finished successfully.
    pub completed_tasks: usize,
    /// Tasks that exhausted their retries.
    pub failed_tasks: usize,
    /// Aggregate status.
    pub status: BatchStatus,
    /// When the batch was registered.
    pub started_at: DateTime<Utc>,
    /// Time since registration, or until completion once finished.
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    /// Estimated time to completion; `None` until a task has completed.
    pub eta_ms: Option<u64>,
}

impl BatchProgress {
    /// Sum of all per-status counters. Always equals `total_tasks`.
    pub fn accounted(&self) -> usize {
        self.queued_tasks + self.active_tasks + self.completed_tasks + self.failed_tasks
    }

    /// Tasks that have not reached a terminal state.
    pub fn remaining(&self) -> usize {
        self.total_tasks - self.completed_tasks - self.failed_tasks
    }

    /// Share of terminal tasks in percent.
    pub fn percent_complete(&self) -> f64 {
        if self.total_tasks == 0 {
            return 100.0;
        }
        (self.completed_tasks + self.failed_tasks) as f64 / self.total_tasks as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Active));
        assert!(TaskStatus::Active.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Active.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Active.can_transition_to(TaskStatus::Queued));

        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Active));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Queued));
    }

    #[test]
    fn test_batch_status_from_outcome() {
        assert_eq!(BatchStatus::from_outcome(5, 0), BatchStatus::Completed);
        assert_eq!(BatchStatus::from_outcome(0, 0), BatchStatus::Completed);
        assert_eq!(BatchStatus::from_outcome(3, 2), BatchStatus::CompletedWithErrors);
        assert_eq!(BatchStatus::from_outcome(0, 4), BatchStatus::Failed);
        assert!(!BatchStatus::Active.is_terminal());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_value(BatchStatus::CompletedWithErrors).expect("serializable"),
            serde_json::json!("completed_with_errors")
        );
        assert_eq!(BatchStatus::CompletedWithErrors.to_string(), "completed_with_errors");
        assert_eq!(TaskStatus::Active.to_string(), "active");
    }
}

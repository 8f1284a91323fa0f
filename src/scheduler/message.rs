//! Closed message protocol between the orchestrator and its workers.
//!
//! Commands flow to a worker as [`WorkerMessage`]; everything a worker has
//! to say flows back as a [`WorkerReport`]. Both are matched exhaustively.

use std::time::Duration;

use super::task::Task;

/// Identifier of a worker slot. Stable across restarts.
pub type WorkerId = usize;

/// A task bound to a specific dispatch.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Monotonic id of this dispatch, used to fence stale reports.
    pub dispatch_id: u64,
    /// The task to execute.
    pub task: Task,
}

/// Command sent from the orchestrator to a worker.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Execute a task.
    TaskAssignment(Assignment),
    /// Finish the current task (if any) and exit.
    ShutdownSignal,
}

/// Report sent from a worker back to the orchestrator.
///
/// Every variant carries the worker `generation` so reports from an
/// incarnation that has since been restarted can be discarded.
#[derive(Debug, Clone)]
pub enum WorkerReport {
    /// The worker finished setup and can accept tasks.
    Ready { worker_id: WorkerId, generation: u64 },
    /// The worker failed setup and exited.
    SetupFailed {
        worker_id: WorkerId,
        generation: u64,
        error: String,
    },
    /// Intermediate progress of the running task.
    ProgressUpdate {
        worker_id: WorkerId,
        generation: u64,
        dispatch_id: u64,
        percent: f64,
        message: Option<String>,
    },
    /// Resource usage observed by the executor.
    ResourceReport {
        worker_id: WorkerId,
        generation: u64,
        memory_bytes: u64,
        cpu_percent: f64,
    },
    /// The task finished successfully.
    TaskCompleted {
        worker_id: WorkerId,
        generation: u64,
        dispatch_id: u64,
        output: serde_json::Value,
        duration: Duration,
    },
    /// The executor returned an error.
    TaskFailed {
        worker_id: WorkerId,
        generation: u64,
        dispatch_id: u64,
        error: String,
    },
    /// The executor panicked; the worker has exited.
    Crashed {
        worker_id: WorkerId,
        generation: u64,
        dispatch_id: Option<u64>,
        reason: String,
    },
}

impl WorkerReport {
    /// Returns the ID of the reporting worker.
    pub fn worker_id(&self) -> WorkerId {
        match self {
            WorkerReport::Ready { worker_id, .. }
            | WorkerReport::SetupFailed { worker_id, .. }
            | WorkerReport::ProgressUpdate { worker_id, .. }
            | WorkerReport::ResourceReport { worker_id, .. }
            | WorkerReport::TaskCompleted { worker_id, .. }
            | WorkerReport::TaskFailed { worker_id, .. }
            | WorkerReport::Crashed { worker_id, .. } => *worker_id,
        }
    }

    /// Returns the generation of the reporting worker incarnation.
    pub fn generation(&self) -> u64 {
        match self {
            WorkerReport::Ready { generation, .. }
            | WorkerReport::SetupFailed { generation, .. }
            | WorkerReport::ProgressUpdate { generation, .. }
            | WorkerReport::ResourceReport { generation, .. }
            | WorkerReport::TaskCompleted { generation, .. }
            | WorkerReport::TaskFailed { generation, .. }
            | WorkerReport::Crashed { generation, .. } => *generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_accessors() {
        let report = WorkerReport::TaskFailed {
            worker_id: 3,
            generation: 2,
            dispatch_id: 17,
            error: "boom".to_string(),
        };
        assert_eq!(report.worker_id(), 3);
        assert_eq!(report.generation(), 2);

        let report = WorkerReport::Crashed {
            worker_id: 1,
            generation: 0,
            dispatch_id: None,
            reason: "panic".to_string(),
        };
        assert_eq!(report.worker_id(), 1);
        assert_eq!(report.generation(), 0);
    }
}

//! Typed event stream emitted by the scheduler.
//!
//! Events are fanned out over a `tokio::sync::broadcast` channel. Emitting is
//! synchronous, so an event is observable by subscribers as soon as the call
//! that produced it returns.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::monitor::{ResourceAlert, ResourceRecommendations};
use crate::progress::BatchStatus;
use crate::scheduler::message::WorkerId;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Everything observable about a running batch system.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A task was dispatched to a worker.
    TaskStarted {
        batch_id: String,
        task_id: String,
        worker_id: WorkerId,
        attempt: u32,
    },
    /// An executor reported intermediate progress.
    TaskProgress {
        task_id: String,
        worker_id: WorkerId,
        percent: f64,
        message: Option<String>,
    },
    /// A task finished successfully.
    TaskCompleted {
        batch_id: String,
        task_id: String,
        worker_id: WorkerId,
        duration_ms: u64,
    },
    /// A failed attempt will be retried after a delay.
    TaskRetryScheduled {
        batch_id: String,
        task_id: String,
        retry_count: u32,
        delay_ms: u64,
        error: String,
    },
    /// A task exhausted its retries. Emitted exactly once per task.
    TaskFailed {
        batch_id: String,
        task_id: String,
        attempts: u32,
        error: String,
    },
    /// A worker was terminated and a replacement spawned.
    WorkerRestarted { worker_id: WorkerId, reason: String },
    /// Counters of a batch changed.
    ProgressUpdate {
        batch_id: String,
        total: usize,
        queued: usize,
        active: usize,
        completed: usize,
        failed: usize,
        percent: f64,
    },
    /// Every task of a batch reached a terminal state.
    BatchCompleted {
        batch_id: String,
        status: BatchStatus,
        completed: usize,
        failed: usize,
        duration_ms: u64,
    },
    /// A resource threshold was crossed.
    ResourceAlert(ResourceAlert),
    /// Fresh scheduling recommendations were computed.
    Recommendation(ResourceRecommendations),
}

impl SchedulerEvent {
    /// Returns the snake_case name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::TaskStarted { .. } => "task_started",
            SchedulerEvent::TaskProgress { .. } => "task_progress",
            SchedulerEvent::TaskCompleted { .. } => "task_completed",
            SchedulerEvent::TaskRetryScheduled { .. } => "task_retry_scheduled",
            SchedulerEvent::TaskFailed { .. } => "task_failed",
            SchedulerEvent::WorkerRestarted { .. } => "worker_restarted",
            SchedulerEvent::ProgressUpdate { .. } => "progress_update",
            SchedulerEvent::BatchCompleted { .. } => "batch_completed",
            SchedulerEvent::ResourceAlert(_) => "resource_alert",
            SchedulerEvent::Recommendation(_) => "recommendation",
        }
    }
}

/// Cloneable publisher for [`SchedulerEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Registers a new subscriber. It only sees events emitted afterwards.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event to all current subscribers.
    pub fn emit(&self, event: SchedulerEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(SchedulerEvent::WorkerRestarted {
            worker_id: 0,
            reason: "test".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscriber_receives_synchronously() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(SchedulerEvent::TaskStarted {
            batch_id: "b".to_string(),
            task_id: "t".to_string(),
            worker_id: 1,
            attempt: 1,
        });

        let event = rx.try_recv().expect("event is buffered immediately");
        assert_eq!(event.kind(), "task_started");
    }

    #[test]
    fn test_event_serialization() {
        let event = SchedulerEvent::TaskFailed {
            batch_id: "b".to_string(),
            task_id: "t".to_string(),
            attempts: 3,
            error: "timeout".to_string(),
        };
        let value = serde_json::to_value(&event).expect("serializable");
        assert_eq!(value["event"], "task_failed");
        assert_eq!(value["attempts"], 3);
    }
}

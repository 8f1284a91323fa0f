//! Per-batch counters, ETA and throughput.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::ProgressError;
use crate::events::{EventBus, SchedulerEvent};
use crate::metrics::MetricsCollector;

use super::{BatchProgress, BatchStatus, TaskStatus};

#[derive(Debug)]
struct TaskRecord {
    status: TaskStatus,
    started_at: Option<Instant>,
    duration: Option<Duration>,
}

#[derive(Debug)]
struct BatchRecord {
    total: usize,
    queued: usize,
    active: usize,
    completed: usize,
    failed: usize,
    status: BatchStatus,
    started_at: DateTime<Utc>,
    started: Instant,
    finished: Option<Instant>,
    tasks: HashMap<String, TaskRecord>,
}

impl BatchRecord {
    fn counter_mut(&mut self, status: TaskStatus) -> &mut usize {
        match status {
            TaskStatus::Queued => &mut self.queued,
            TaskStatus::Active => &mut self.active,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
        }
    }
}

/// Global counters across all batches seen by the tracker.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalProgress {
    /// Tasks registered across all batches.
    pub total_tasks: usize,
    /// Tasks waiting for a worker.
    pub queued_tasks: usize,
    /// Tasks bound to a worker.
    pub active_tasks: usize,
    /// Tasks finished successfully.
    pub completed_tasks: usize,
    /// Tasks that exhausted their retries.
    pub failed_tasks: usize,
    /// Rolling average duration of recent completed tasks.
    pub average_task_ms: Option<u64>,
    /// Completed tasks per second since tracking started.
    pub throughput: f64,
    /// Estimated time until all registered tasks are terminal.
    pub eta_ms: Option<u64>,
}

/// Authoritative per-batch and global progress counters.
///
/// All updates go through `&mut self`, so counter changes for one transition
/// are never observed half-applied.
#[derive(Debug)]
pub struct ProgressTracker {
    batches: HashMap<String, BatchRecord>,
    events: EventBus,
    metrics: MetricsCollector,
    eta_window: usize,
    recent_durations: VecDeque<Duration>,
    global: GlobalProgress,
    tracking_since: Option<Instant>,
}

impl ProgressTracker {
    /// Creates a tracker averaging the last `eta_window` task durations.
    pub fn new(events: EventBus, eta_window: usize) -> Self {
        Self {
            batches: HashMap::new(),
            events,
            metrics: MetricsCollector::new(),
            eta_window: eta_window.max(1),
            recent_durations: VecDeque::new(),
            global: GlobalProgress::default(),
            tracking_since: None,
        }
    }

    /// Registers a batch with all its tasks in the `queued` state.
    ///
    /// A batch without tasks is complete on registration; its snapshot is
    /// returned and `batch_completed` is emitted immediately.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::DuplicateBatch` if the batch id is known and
    /// `ProgressError::DuplicateTask` if a task id repeats within the batch.
    pub fn register_batch<I, S>(
        &mut self,
        batch_id: &str,
        task_ids: I,
    ) -> Result<Option<BatchProgress>, ProgressError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.batches.contains_key(batch_id) {
            return Err(ProgressError::DuplicateBatch(batch_id.to_string()));
        }

        let mut tasks = HashMap::new();
        for task_id in task_ids {
            let task_id = task_id.into();
            if tasks.contains_key(&task_id) {
                return Err(ProgressError::DuplicateTask {
                    batch_id: batch_id.to_string(),
                    task_id,
                });
            }
            tasks.insert(
                task_id,
                TaskRecord {
                    status: TaskStatus::Queued,
                    started_at: None,
                    duration: None,
                },
            );
        }

        let total = tasks.len();
        let now = Instant::now();
        self.tracking_since.get_or_insert(now);
        self.global.total_tasks += total;
        self.global.queued_tasks += total;

        self.batches.insert(
            batch_id.to_string(),
            BatchRecord {
                total,
                queued: total,
                active: 0,
                completed: 0,
                failed: 0,
                status: BatchStatus::Active,
                started_at: Utc::now(),
                started: now,
                finished: None,
                tasks,
            },
        );
        info!(batch_id = %batch_id, total_tasks = total, "Registered batch");

        if total == 0 {
            return Ok(self.complete_batch(batch_id));
        }
        self.emit_progress(batch_id);
        Ok(None)
    }

    /// Moves a task to a new status.
    ///
    /// The old counter is decremented and the new one incremented in one
    /// step. Terminal transitions record the task duration. When this update
    /// makes every task of the batch terminal, `batch_completed` is emitted
    /// before returning and the final snapshot is returned.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown batches or tasks and for transitions not
    /// allowed by [`TaskStatus::can_transition_to`]. Counters are unchanged
    /// on error.
    pub fn update_task_status(
        &mut self,
        batch_id: &str,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<Option<BatchProgress>, ProgressError> {
        let batch = self
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| ProgressError::UnknownBatch(batch_id.to_string()))?;
        let task = batch
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ProgressError::UnknownTask {
                batch_id: batch_id.to_string(),
                task_id: task_id.to_string(),
            })?;

        let previous = task.status;
        if !previous.can_transition_to(status) {
            return Err(ProgressError::InvalidTransition {
                task_id: task_id.to_string(),
                from: previous.to_string(),
                to: status.to_string(),
            });
        }

        task.status = status;
        let mut completed_duration = None;
        match status {
            TaskStatus::Active => task.started_at = Some(Instant::now()),
            TaskStatus::Completed | TaskStatus::Failed => {
                let duration = task.started_at.map(|s| s.elapsed()).unwrap_or_default();
                task.duration = Some(duration);
                if status == TaskStatus::Completed {
                    completed_duration = Some(duration);
                }
            }
            TaskStatus::Queued => task.started_at = None,
        }

        *batch.counter_mut(previous) -= 1;
        *batch.counter_mut(status) += 1;
        let finished = batch.completed + batch.failed == batch.total;

        *global_counter(&mut self.global, previous) -= 1;
        *global_counter(&mut self.global, status) += 1;

        if let Some(duration) = completed_duration {
            self.recent_durations.push_back(duration);
            while self.recent_durations.len() > self.eta_window {
                self.recent_durations.pop_front();
            }
        }

        debug!(
            batch_id = %batch_id,
            task_id = %task_id,
            from = %previous,
            to = %status,
            "Task status updated"
        );

        self.emit_progress(batch_id);
        if finished {
            return Ok(self.complete_batch(batch_id));
        }
        Ok(None)
    }

    /// Returns the status of a task.
    pub fn task_status(&self, batch_id: &str, task_id: &str) -> Option<TaskStatus> {
        self.batches
            .get(batch_id)?
            .tasks
            .get(task_id)
            .map(|task| task.status)
    }

    /// Returns the recorded duration of a terminal task.
    pub fn task_duration(&self, batch_id: &str, task_id: &str) -> Option<Duration> {
        self.batches.get(batch_id)?.tasks.get(task_id)?.duration
    }

    /// Returns a snapshot of a batch.
    pub fn batch(&self, batch_id: &str) -> Option<BatchProgress> {
        self.batches
            .get(batch_id)
            .map(|record| self.snapshot(batch_id, record))
    }

    /// Snapshots of every tracked batch, ordered by registration time.
    pub fn batches(&self) -> Vec<BatchProgress> {
        let mut all: Vec<BatchProgress> = self
            .batches
            .iter()
            .map(|(id, record)| self.snapshot(id, record))
            .collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    /// Forgets a batch. Global counters are kept.
    pub fn remove_batch(&mut self, batch_id: &str) -> Option<BatchProgress> {
        let snapshot = self.batch(batch_id)?;
        self.batches.remove(batch_id);
        Some(snapshot)
    }

    /// Global counters with throughput and ETA.
    pub fn global(&self) -> GlobalProgress {
        let mut global = self.global.clone();
        global.average_task_ms = self.average_task_time().map(|d| d.as_millis() as u64);
        global.throughput = self.throughput();
        let remaining = global.queued_tasks + global.active_tasks;
        global.eta_ms = self.eta_for(remaining).map(|d| d.as_millis() as u64);
        global
    }

    /// Rolling average over the last `eta_window` completed tasks.
    pub fn average_task_time(&self) -> Option<Duration> {
        if self.recent_durations.is_empty() {
            return None;
        }
        let total: Duration = self.recent_durations.iter().sum();
        let samples = u32::try_from(self.recent_durations.len()).unwrap_or(u32::MAX);
        Some(total / samples)
    }

    /// Completed tasks per second since the first batch was registered.
    pub fn throughput(&self) -> f64 {
        let Some(since) = self.tracking_since else {
            return 0.0;
        };
        let elapsed = since.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.global.completed_tasks as f64 / elapsed
    }

    /// `remaining * average_task_time / max(active_workers, 1)`, saturating.
    fn eta_for(&self, remaining: usize) -> Option<Duration> {
        let average = self.average_task_time()?;
        let remaining = u32::try_from(remaining).unwrap_or(u32::MAX);
        let workers = u32::try_from(self.global.active_tasks.max(1)).unwrap_or(u32::MAX);
        Some(average.saturating_mul(remaining) / workers)
    }

    fn snapshot(&self, batch_id: &str, record: &BatchRecord) -> BatchProgress {
        let elapsed = match record.finished {
            Some(finished) => finished.duration_since(record.started),
            None => record.started.elapsed(),
        };
        let remaining = record.total - record.completed - record.failed;
        BatchProgress {
            batch_id: batch_id.to_string(),
            total_tasks: record.total,
            queued_tasks: record.queued,
            active_tasks: record.active,
            completed_tasks: record.completed,
            failed_tasks: record.failed,
            status: record.status,
            started_at: record.started_at,
            elapsed,
            eta_ms: if remaining == 0 {
                Some(0)
            } else {
                self.eta_for(remaining).map(|d| d.as_millis() as u64)
            },
        }
    }

    fn emit_progress(&self, batch_id: &str) {
        if let Some(progress) = self.batch(batch_id) {
            self.events.emit(SchedulerEvent::ProgressUpdate {
                batch_id: progress.batch_id.clone(),
                total: progress.total_tasks,
                queued: progress.queued_tasks,
                active: progress.active_tasks,
                completed: progress.completed_tasks,
                failed: progress.failed_tasks,
                percent: progress.percent_complete(),
            });
        }
    }

    fn complete_batch(&mut self, batch_id: &str) -> Option<BatchProgress> {
        let record = self.batches.get_mut(batch_id)?;
        record.status = BatchStatus::from_outcome(record.completed, record.failed);
        record.finished = Some(Instant::now());
        let total = record.total;

        let progress = self.batch(batch_id)?;
        info!(
            batch_id = %batch_id,
            status = %progress.status,
            completed = progress.completed_tasks,
            failed = progress.failed_tasks,
            duration_ms = progress.elapsed.as_millis() as u64,
            "Batch completed"
        );
        self.events.emit(SchedulerEvent::BatchCompleted {
            batch_id: batch_id.to_string(),
            status: progress.status,
            completed: progress.completed_tasks,
            failed: progress.failed_tasks,
            duration_ms: progress.elapsed.as_millis() as u64,
        });
        self.metrics.record_batch(&progress.status.to_string(), total);
        Some(progress)
    }
}

fn global_counter(global: &mut GlobalProgress, status: TaskStatus) -> &mut usize {
    match status {
        TaskStatus::Queued => &mut global.queued_tasks,
        TaskStatus::Active => &mut global.active_tasks,
        TaskStatus::Completed => &mut global.completed_tasks,
        TaskStatus::Failed => &mut global.failed_tasks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn tracker() -> (ProgressTracker, tokio::sync::broadcast::Receiver<SchedulerEvent>) {
        let events = EventBus::new(256);
        let rx = events.subscribe();
        (ProgressTracker::new(events, 50), rx)
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("t-{}", i)).collect()
    }

    fn assert_conserved(tracker: &ProgressTracker, batch_id: &str) {
        let batch = tracker.batch(batch_id).expect("batch registered");
        assert_eq!(batch.accounted(), batch.total_tasks);
    }

    #[test]
    fn test_register_batch() {
        let (mut tracker, _rx) = tracker();
        assert!(tracker.register_batch("b", ids(3)).expect("registers").is_none());

        let batch = tracker.batch("b").expect("batch registered");
        assert_eq!(batch.total_tasks, 3);
        assert_eq!(batch.queued_tasks, 3);
        assert_eq!(batch.status, BatchStatus::Active);
        assert_eq!(tracker.task_status("b", "t-1"), Some(TaskStatus::Queued));

        assert_eq!(
            tracker.register_batch("b", ids(1)),
            Err(ProgressError::DuplicateBatch("b".to_string()))
        );
    }

    #[test]
    fn test_register_rejects_repeated_task_ids() {
        let (mut tracker, _rx) = tracker();
        let result = tracker.register_batch("b", vec!["x", "y", "x"]);
        assert!(matches!(result, Err(ProgressError::DuplicateTask { .. })));
        assert!(tracker.batch("b").is_none());
    }

    #[test]
    fn test_empty_batch_completes_immediately() {
        let (mut tracker, mut rx) = tracker();
        let done = tracker
            .register_batch("empty", Vec::<String>::new())
            .expect("registers")
            .expect("completes on registration");
        assert_eq!(done.status, BatchStatus::Completed);

        let event = rx.try_recv().expect("batch_completed emitted");
        assert_eq!(event.kind(), "batch_completed");
    }

    #[test]
    fn test_invalid_transitions_leave_counters_untouched() {
        let (mut tracker, _rx) = tracker();
        tracker.register_batch("b", ids(2)).expect("registers");

        let err = tracker
            .update_task_status("b", "t-0", TaskStatus::Completed)
            .expect_err("queued cannot complete");
        assert!(matches!(err, ProgressError::InvalidTransition { .. }));

        assert!(matches!(
            tracker.update_task_status("b", "missing", TaskStatus::Active),
            Err(ProgressError::UnknownTask { .. })
        ));
        assert!(matches!(
            tracker.update_task_status("nope", "t-0", TaskStatus::Active),
            Err(ProgressError::UnknownBatch(_))
        ));

        let batch = tracker.batch("b").expect("batch registered");
        assert_eq!(batch.queued_tasks, 2);
        assert_eq!(batch.completed_tasks, 0);
    }

    #[test]
    fn test_counts_conserved_through_lifecycle() {
        let (mut tracker, _rx) = tracker();
        tracker.register_batch("b", ids(4)).expect("registers");
        assert_conserved(&tracker, "b");

        let steps = [
            ("t-0", TaskStatus::Active),
            ("t-1", TaskStatus::Active),
            ("t-0", TaskStatus::Completed),
            ("t-1", TaskStatus::Queued),
            ("t-2", TaskStatus::Active),
            ("t-1", TaskStatus::Active),
            ("t-2", TaskStatus::Failed),
            ("t-1", TaskStatus::Completed),
            ("t-3", TaskStatus::Active),
        ];
        for (task_id, status) in steps {
            tracker
                .update_task_status("b", task_id, status)
                .expect("valid transition");
            assert_conserved(&tracker, "b");
        }

        let batch = tracker.batch("b").expect("batch registered");
        assert_eq!(batch.completed_tasks, 2);
        assert_eq!(batch.failed_tasks, 1);
        assert_eq!(batch.active_tasks, 1);
        assert_eq!(batch.status, BatchStatus::Active);

        let global = tracker.global();
        assert_eq!(global.total_tasks, 4);
        assert_eq!(global.completed_tasks, 2);
        assert_eq!(global.active_tasks, 1);
    }

    #[test]
    fn test_completion_detected_in_same_call() {
        let (mut tracker, mut rx) = tracker();
        tracker.register_batch("b", ids(2)).expect("registers");
        for id in ["t-0", "t-1"] {
            tracker
                .update_task_status("b", id, TaskStatus::Active)
                .expect("valid transition");
        }
        assert!(tracker
            .update_task_status("b", "t-0", TaskStatus::Completed)
            .expect("valid transition")
            .is_none());

        // Drain what has been emitted so far.
        while rx.try_recv().is_ok() {}

        let done = tracker
            .update_task_status("b", "t-1", TaskStatus::Failed)
            .expect("valid transition")
            .expect("last terminal transition completes the batch");
        assert_eq!(done.status, BatchStatus::CompletedWithErrors);

        let mut saw_completion = false;
        loop {
            match rx.try_recv() {
                Ok(SchedulerEvent::BatchCompleted {
                    completed, failed, ..
                }) => {
                    assert_eq!((completed, failed), (1, 1));
                    saw_completion = true;
                }
                Ok(_) => {}
                Err(TryRecvError::Empty) => break,
                Err(other) => panic!("unexpected receive error: {}", other),
            }
        }
        assert!(saw_completion, "batch_completed visible without waiting");
    }

    #[test]
    fn test_all_failed_batch_status() {
        let (mut tracker, _rx) = tracker();
        tracker.register_batch("b", ids(1)).expect("registers");
        tracker
            .update_task_status("b", "t-0", TaskStatus::Active)
            .expect("valid transition");
        let done = tracker
            .update_task_status("b", "t-0", TaskStatus::Failed)
            .expect("valid transition")
            .expect("batch completes");
        assert_eq!(done.status, BatchStatus::Failed);
        assert!(tracker.task_duration("b", "t-0").is_some());
    }

    fn run_task(tracker: &mut ProgressTracker, batch_id: &str, task_id: &str, work: Duration) {
        tracker
            .update_task_status(batch_id, task_id, TaskStatus::Active)
            .expect("valid transition");
        std::thread::sleep(work);
        tracker
            .update_task_status(batch_id, task_id, TaskStatus::Completed)
            .expect("valid transition");
    }

    #[test]
    fn test_eta_uses_rolling_window() {
        let mut tracker = ProgressTracker::new(EventBus::new(64), 2);
        assert!(tracker.average_task_time().is_none());
        tracker.register_batch("b", ids(7)).expect("registers");

        run_task(&mut tracker, "b", "t-0", Duration::from_millis(150));
        let slow = tracker.average_task_time().expect("one sample");
        assert!(slow >= Duration::from_millis(150));

        run_task(&mut tracker, "b", "t-1", Duration::ZERO);
        run_task(&mut tracker, "b", "t-2", Duration::ZERO);

        // The slow sample fell out of the two-task window.
        let average = tracker.average_task_time().expect("samples");
        assert!(average < Duration::from_millis(50), "average was {:?}", average);

        let global = tracker.global();
        assert_eq!(global.queued_tasks, 4);
        let eta = global.eta_ms.expect("eta with samples");
        assert_eq!(eta, (average * 4).as_millis() as u64);
    }

    #[test]
    fn test_eta_saturates_for_huge_backlogs() {
        let mut tracker = ProgressTracker::new(EventBus::new(64), 10);
        tracker.register_batch("b", ids(1)).expect("registers");
        run_task(&mut tracker, "b", "t-0", Duration::from_millis(5));

        let capped = tracker.eta_for(u32::MAX as usize).expect("eta");
        let beyond = tracker.eta_for(u32::MAX as usize + 10).expect("eta");
        assert_eq!(beyond, capped);
        assert!(beyond > tracker.eta_for(1_000).expect("eta"));
    }

    #[test]
    fn test_remove_batch_keeps_global_counts() {
        let (mut tracker, _rx) = tracker();
        tracker.register_batch("b", ids(1)).expect("registers");
        tracker
            .update_task_status("b", "t-0", TaskStatus::Active)
            .expect("valid transition");
        tracker
            .update_task_status("b", "t-0", TaskStatus::Completed)
            .expect("valid transition");

        assert!(tracker.remove_batch("b").is_some());
        assert!(tracker.batch("b").is_none());
        assert_eq!(tracker.global().completed_tasks, 1);
    }
}

//! High-level metric recording for scheduler operations.
//!
//! The `MetricsCollector` struct wraps the raw Prometheus metrics and provides
//! convenient methods for the events the scheduler observes. Every method is
//! a no-op when [`init_metrics`](super::init_metrics) was never called.

use super::prometheus::{
    ACTIVE_WORKERS, BATCHES_TOTAL, BATCH_SIZE, CONFLICTS_TOTAL, QUEUE_DEPTH, RESOURCE_ALERTS,
    TASKS_TOTAL, TASK_DURATION, TASK_RETRIES, WORKER_RESTARTS,
};

/// Metrics collector for recording scheduler metrics.
///
/// # Example
///
/// ```ignore
/// use refactor_forge::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_task_completed("normal", 3.5);
/// collector.record_worker_restart("timeout");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a successfully completed task.
    ///
    /// # Arguments
    ///
    /// * `priority` - Task priority label ("high", "normal", "low")
    /// * `duration_secs` - Wall-clock duration of the successful attempt
    pub fn record_task_completed(&self, priority: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&["completed"]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[priority])
                .observe(duration_secs);
        }

        tracing::trace!(
            priority = priority,
            duration_secs = duration_secs,
            "Recorded task completion metric"
        );
    }

    /// Record a task that exhausted its retries.
    pub fn record_task_failed(&self) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&["failed"]).inc();
        }

        tracing::trace!("Recorded task failure metric");
    }

    /// Record a scheduled retry.
    pub fn record_retry(&self) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&["retried"]).inc();
        }

        if let Some(retries) = TASK_RETRIES.get() {
            retries.inc();
        }
    }

    /// Record a worker restart.
    ///
    /// # Arguments
    ///
    /// * `reason` - Why the worker was restarted ("timeout", "crash", "setup")
    pub fn record_worker_restart(&self, reason: &str) {
        if let Some(restarts) = WORKER_RESTARTS.get() {
            restarts.with_label_values(&[reason]).inc();
        }

        tracing::trace!(reason = reason, "Recorded worker restart metric");
    }

    /// Update the pending queue depth.
    pub fn update_queue_depth(&self, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.set(depth as f64);
        }
    }

    /// Update the number of workers currently running a task.
    pub fn update_active_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }
    }

    /// Record a detected result conflict.
    ///
    /// # Arguments
    ///
    /// * `conflict_type` - e.g. "performance_regression"
    /// * `severity` - "low", "medium" or "high"
    pub fn record_conflict(&self, conflict_type: &str, severity: &str) {
        if let Some(conflicts) = CONFLICTS_TOTAL.get() {
            conflicts
                .with_label_values(&[conflict_type, severity])
                .inc();
        }

        tracing::trace!(
            conflict_type = conflict_type,
            severity = severity,
            "Recorded conflict metric"
        );
    }

    /// Record a raised resource alert.
    pub fn record_resource_alert(&self, alert_type: &str, severity: &str) {
        if let Some(alerts) = RESOURCE_ALERTS.get() {
            alerts.with_label_values(&[alert_type, severity]).inc();
        }
    }

    /// Record a finished batch.
    ///
    /// # Arguments
    ///
    /// * `status` - Terminal batch status
    /// * `total_tasks` - Number of tasks in the batch
    pub fn record_batch(&self, status: &str, total_tasks: usize) {
        if let Some(batches) = BATCHES_TOTAL.get() {
            batches.with_label_values(&[status]).inc();
        }

        if let Some(batch_size) = BATCH_SIZE.get() {
            batch_size.observe(total_tasks as f64);
        }

        tracing::trace!(
            status = status,
            total_tasks = total_tasks,
            "Recorded batch metric"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_task_outcomes() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_task_completed("high", 0.25);
        collector.record_task_completed("low", 12.0);
        collector.record_retry();
        collector.record_task_failed();

        let text = export_metrics();
        assert!(text.contains("refactor_forge_task_duration_seconds"));
        assert!(text.contains("refactor_forge_task_retries_total"));
    }

    #[test]
    fn test_record_worker_and_queue_gauges() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_queue_depth(42);
        collector.update_active_workers(3);
        collector.record_worker_restart("timeout");
        collector.record_worker_restart("crash");
    }

    #[test]
    fn test_record_conflicts_alerts_batches() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_conflict("performance_regression", "high");
        collector.record_resource_alert("high_cpu", "critical");
        collector.record_batch("completed_with_errors", 25);

        let text = export_metrics();
        assert!(text.contains("performance_regression"));
    }
}

//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the batch scheduler and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all scheduler metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of task outcomes, labeled by status (completed, failed, retried).
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall-clock duration of successful task attempts in seconds, labeled by priority.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of tasks waiting in the pending queue.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of workers currently running a task.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Total worker restarts, labeled by reason (timeout, crash, setup).
pub static WORKER_RESTARTS: OnceLock<CounterVec> = OnceLock::new();

/// Total retries scheduled.
pub static TASK_RETRIES: OnceLock<Counter> = OnceLock::new();

/// Total conflicts detected, labeled by type and severity.
pub static CONFLICTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total resource alerts raised, labeled by type and severity.
pub static RESOURCE_ALERTS: OnceLock<CounterVec> = OnceLock::new();

/// Total batches finished, labeled by terminal status.
pub static BATCHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Distribution of batch sizes.
pub static BATCH_SIZE: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Later calls
/// leave the first set of metrics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Task metrics
    let tasks_total = CounterVec::new(
        Opts::new("refactor_forge_tasks_total", "Total number of task outcomes"),
        &["status"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "refactor_forge_task_duration_seconds",
            "Task execution duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0]),
        &["priority"],
    )?;

    let task_retries = Counter::new(
        "refactor_forge_task_retries_total",
        "Total number of task retries scheduled",
    )?;

    // Queue and worker metrics
    let queue_depth = Gauge::new(
        "refactor_forge_queue_depth",
        "Number of tasks waiting for a worker",
    )?;

    let active_workers = Gauge::new(
        "refactor_forge_active_workers",
        "Number of workers currently running a task",
    )?;

    let worker_restarts = CounterVec::new(
        Opts::new(
            "refactor_forge_worker_restarts_total",
            "Total number of worker restarts",
        ),
        &["reason"],
    )?;

    // Result metrics
    let conflicts_total = CounterVec::new(
        Opts::new(
            "refactor_forge_conflicts_total",
            "Total number of conflicts detected in task results",
        ),
        &["type", "severity"],
    )?;

    let resource_alerts = CounterVec::new(
        Opts::new(
            "refactor_forge_resource_alerts_total",
            "Total number of resource alerts raised",
        ),
        &["type", "severity"],
    )?;

    let batches_total = CounterVec::new(
        Opts::new("refactor_forge_batches_total", "Total number of finished batches"),
        &["status"],
    )?;

    let batch_size = Histogram::with_opts(
        prometheus::HistogramOpts::new("refactor_forge_batch_size", "Distribution of batch sizes")
            .buckets(vec![1.0, 10.0, 50.0, 100.0, 200.0, 500.0, 1000.0]),
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(task_retries.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(worker_restarts.clone()))?;
    registry.register(Box::new(conflicts_total.clone()))?;
    registry.register(Box::new(resource_alerts.clone()))?;
    registry.register(Box::new(batches_total.clone()))?;
    registry.register(Box::new(batch_size.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = TASK_RETRIES.set(task_retries);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = WORKER_RESTARTS.set(worker_restarts);
    let _ = CONFLICTS_TOTAL.set(conflicts_total);
    let _ = RESOURCE_ALERTS.set(resource_alerts);
    let _ = BATCHES_TOTAL.set(batches_total);
    let _ = BATCH_SIZE.set(batch_size);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead when the registry has not
/// been initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_metrics_never_empty() {
        // Depends on execution order: either real output or the uninitialized notice.
        let metrics = export_metrics();
        assert!(!metrics.is_empty());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(counter) = TASKS_TOTAL.get() {
            counter.with_label_values(&["completed"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("refactor_forge_tasks_total"));
    }
}

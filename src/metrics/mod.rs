//! Metrics module for Prometheus-based monitoring.
//!
//! Collects task outcomes, queue depth, worker restarts, conflicts and
//! resource alerts of the batch scheduler.
//!
//! # Example
//!
//! ```ignore
//! use refactor_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_task_completed("high", 1.25);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, BATCHES_TOTAL, BATCH_SIZE, CONFLICTS_TOTAL, QUEUE_DEPTH, REGISTRY,
    RESOURCE_ALERTS, TASKS_TOTAL, TASK_DURATION, TASK_RETRIES, WORKER_RESTARTS,
};

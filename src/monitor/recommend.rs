//! Advisory worker-count, memory and batch-size recommendations.
//!
//! Recommendations are published for operators and callers; the running
//! pool is never resized from them.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::source::RawMetrics;
use super::SchedulerLoad;

const MIB: u64 = 1024 * 1024;

/// Lower bound for the recommended per-worker memory.
pub const MIN_MEMORY_PER_WORKER: u64 = 256 * MIB;

/// Upper bound for the recommended per-worker memory.
pub const MAX_MEMORY_PER_WORKER: u64 = 2048 * MIB;

/// Starting point for the recommended batch size.
pub const BASE_BATCH_SIZE: usize = 50;

const MAX_BATCH_SIZE: usize = 200;
const MIN_BATCH_SIZE: usize = 10;

/// Scheduling recommendations derived from a resource sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecommendations {
    /// Recommended number of workers.
    pub worker_count: usize,
    /// Recommended memory budget per worker in bytes.
    pub memory_per_worker: u64,
    /// Recommended number of tasks per batch.
    pub batch_size: usize,
    /// Adjustments that led to these values.
    pub reasons: Vec<String>,
    /// When the recommendation was computed.
    pub timestamp: DateTime<Utc>,
}

impl ResourceRecommendations {
    /// Returns whether the recommended values differ, ignoring reasons and time.
    pub fn differs_from(&self, other: &ResourceRecommendations) -> bool {
        self.worker_count != other.worker_count
            || self.memory_per_worker != other.memory_per_worker
            || self.batch_size != other.batch_size
    }
}

/// Computes recommendations from raw metrics and current scheduler load.
pub fn recommend(
    metrics: &RawMetrics,
    load: &SchedulerLoad,
    max_cpu_usage_percent: f64,
    max_memory_usage_percent: f64,
) -> ResourceRecommendations {
    let mut reasons = Vec::new();

    let worker_count = optimal_worker_count(
        metrics,
        load,
        max_cpu_usage_percent,
        max_memory_usage_percent,
        &mut reasons,
    );
    let memory_per_worker = optimal_memory_per_worker(metrics.total_memory, load.active_workers);
    let batch_size = optimal_batch_size(load.throughput, metrics.memory_usage, &mut reasons);

    ResourceRecommendations {
        worker_count,
        memory_per_worker,
        batch_size,
        reasons,
        timestamp: Utc::now(),
    }
}

/// Starts from the core count, shrinks under CPU or memory pressure and grows
/// by one (up to twice the core count) when CPU is underused or the queue is
/// long compared to the pool.
fn optimal_worker_count(
    metrics: &RawMetrics,
    load: &SchedulerLoad,
    max_cpu: f64,
    max_memory: f64,
    reasons: &mut Vec<String>,
) -> usize {
    let cores = metrics.cpu_cores.max(1);
    let mut workers = cores as f64;

    if metrics.cpu_usage > max_cpu {
        workers *= 0.8;
        reasons.push(format!("cpu usage {:.1}% above {:.1}%", metrics.cpu_usage, max_cpu));
    }
    if metrics.memory_usage > max_memory {
        workers *= 0.7;
        reasons.push(format!(
            "memory usage {:.1}% above {:.1}%",
            metrics.memory_usage, max_memory
        ));
    }

    let mut count = (workers.floor() as usize).max(1);

    let backlog = load.queue_length > load.worker_count.max(1) * 10;
    if metrics.cpu_usage < 50.0 || backlog {
        count = (count + 1).min(cores * 2);
        if backlog {
            reasons.push(format!("queue backlog of {} tasks", load.queue_length));
        } else {
            reasons.push("cpu underused".to_string());
        }
    }

    count
}

/// `0.75 * total_memory / max(1, active_workers)`, clamped to [256 MiB, 2 GiB].
fn optimal_memory_per_worker(total_memory: u64, active_workers: usize) -> u64 {
    let share = total_memory as f64 * 0.75 / active_workers.max(1) as f64;
    (share as u64).clamp(MIN_MEMORY_PER_WORKER, MAX_MEMORY_PER_WORKER)
}

fn optimal_batch_size(throughput: f64, memory_usage: f64, reasons: &mut Vec<String>) -> usize {
    let mut size = BASE_BATCH_SIZE;

    if throughput > 10.0 {
        size = (size * 2).min(MAX_BATCH_SIZE);
        reasons.push(format!("high throughput {:.1} tasks/s", throughput));
    } else if throughput < 2.0 {
        size = (size / 2).max(MIN_BATCH_SIZE);
        reasons.push(format!("low throughput {:.1} tasks/s", throughput));
    }

    if memory_usage > 80.0 {
        size = ((size as f64 * 0.7).floor() as usize).max(1);
        reasons.push(format!("memory usage {:.1}% above 80%", memory_usage));
    }

    size
}

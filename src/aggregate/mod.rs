//! Result aggregation with conflict detection.
//!
//! The [`ResultAggregator`] consumes completed and failed tasks per batch,
//! detects regressions in completed results, resolves them with the batch's
//! [`ConflictResolutionStrategy`] and keeps O(1) running averages plus trend
//! windows across batches.

mod conflict;
mod resolution;
mod stats;

pub use conflict::{detect_conflicts, ConflictRecord, ConflictSeverity, ConflictType};
pub use resolution::{ConflictResolutionStrategy, Resolution, ResolutionAction, ReviewPriority};
pub use stats::{RunningAverage, TrendDirection, TrendSeries, MIN_TREND_SAMPLES, TREND_WINDOW};

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::metrics::MetricsCollector;
use crate::scheduler::task::{CompletedTask, FailedTask};

/// Averages of the tracked result metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateMetrics {
    /// Wall-clock duration of successful attempts in milliseconds.
    pub duration_ms: RunningAverage,
    /// `qualityScore` reported by executors.
    pub quality_score: RunningAverage,
    /// Performance change in percent: `performanceComparison.improvement`,
    /// or the negated `degradation`.
    pub performance_delta: RunningAverage,
}

/// Current trend of each tracked metric across batches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricTrends {
    pub duration: TrendDirection,
    pub quality: TrendDirection,
    pub performance: TrendDirection,
}

/// Everything aggregated for one finished batch.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAggregate {
    /// Strategy used to resolve this batch's conflicts.
    pub strategy: ConflictResolutionStrategy,
    /// Successful task results.
    pub results: Vec<CompletedTask>,
    /// Tasks that exhausted their retries.
    pub failures: Vec<FailedTask>,
    /// Detected conflicts.
    pub conflicts: Vec<ConflictRecord>,
    /// One resolution per conflict.
    pub resolutions: Vec<Resolution>,
    /// Averages over this batch only.
    pub averages: AggregateMetrics,
}

/// Totals across every finished batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSummary {
    pub batches_processed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub conflicts_detected: u64,
    pub averages: AggregateMetrics,
    pub trends: MetricTrends,
}

#[derive(Debug, Default)]
struct BatchSamples {
    duration_ms: Vec<f64>,
    quality_score: Vec<f64>,
    performance_delta: Vec<f64>,
}

impl BatchSamples {
    fn averages(&self) -> AggregateMetrics {
        AggregateMetrics {
            duration_ms: RunningAverage::of(&self.duration_ms),
            quality_score: RunningAverage::of(&self.quality_score),
            performance_delta: RunningAverage::of(&self.performance_delta),
        }
    }
}

#[derive(Debug)]
struct BatchState {
    aggregate: BatchAggregate,
    samples: BatchSamples,
}

/// Per-batch conflict detection and cross-batch running statistics.
#[derive(Debug)]
pub struct ResultAggregator {
    default_strategy: ConflictResolutionStrategy,
    batches: HashMap<String, BatchState>,
    averages: AggregateMetrics,
    duration_trend: TrendSeries,
    quality_trend: TrendSeries,
    performance_trend: TrendSeries,
    batches_processed: u64,
    tasks_completed: u64,
    tasks_failed: u64,
    conflicts_detected: u64,
    metrics: MetricsCollector,
}

impl ResultAggregator {
    /// Creates an aggregator resolving conflicts with `default_strategy`
    /// unless a batch overrides it.
    pub fn new(default_strategy: ConflictResolutionStrategy) -> Self {
        Self {
            default_strategy,
            batches: HashMap::new(),
            averages: AggregateMetrics::default(),
            duration_trend: TrendSeries::new(false),
            quality_trend: TrendSeries::new(true),
            performance_trend: TrendSeries::new(true),
            batches_processed: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            conflicts_detected: 0,
            metrics: MetricsCollector::new(),
        }
    }

    /// Starts collecting results for `batch_id`.
    pub fn begin_batch(&mut self, batch_id: &str, strategy: Option<ConflictResolutionStrategy>) {
        let strategy = strategy.unwrap_or(self.default_strategy);
        self.batches.insert(
            batch_id.to_string(),
            BatchState {
                aggregate: BatchAggregate {
                    strategy,
                    ..Default::default()
                },
                samples: BatchSamples::default(),
            },
        );
    }

    /// Records a successful task and returns the conflicts found in it.
    pub fn record_completed(&mut self, task: CompletedTask) -> Vec<ConflictRecord> {
        let conflicts = detect_conflicts(&task.task_id, &task.batch_id, &task.output);
        self.tasks_completed += 1;
        self.conflicts_detected += conflicts.len() as u64;

        let Some(state) = self.batches.get_mut(&task.batch_id) else {
            warn!(batch_id = %task.batch_id, task_id = %task.task_id, "Result for unknown batch dropped");
            return conflicts;
        };

        let strategy = state.aggregate.strategy;
        for conflict in &conflicts {
            self.metrics.record_conflict(
                &conflict.conflict_type.to_string(),
                &conflict.severity.to_string(),
            );
            let resolution = strategy.resolve(conflict);
            warn!(
                task_id = %conflict.task_id,
                conflict_type = %conflict.conflict_type,
                severity = %conflict.severity,
                strategy = %strategy,
                "Conflict detected: {}",
                resolution.rationale
            );
            state.aggregate.resolutions.push(resolution);
        }
        state.aggregate.conflicts.extend(conflicts.iter().cloned());

        state
            .samples
            .duration_ms
            .push(task.duration.as_secs_f64() * 1000.0);
        if let Some(score) = task.output.get("qualityScore").and_then(Value::as_f64) {
            state.samples.quality_score.push(score);
        }
        if let Some(delta) = performance_delta(&task.output) {
            state.samples.performance_delta.push(delta);
        }

        state.aggregate.results.push(task);
        conflicts
    }

    /// Records a task that exhausted its retries.
    pub fn record_failed(&mut self, task: FailedTask) {
        self.tasks_failed += 1;
        match self.batches.get_mut(&task.batch_id) {
            Some(state) => state.aggregate.failures.push(task),
            None => {
                warn!(batch_id = %task.batch_id, task_id = %task.task_id, "Failure for unknown batch dropped")
            }
        }
    }

    /// Closes a batch, folds its averages into the running totals and
    /// returns everything collected for it.
    pub fn finish_batch(&mut self, batch_id: &str) -> Option<BatchAggregate> {
        let BatchState {
            mut aggregate,
            samples,
        } = self.batches.remove(batch_id)?;

        let batch = samples.averages();
        aggregate.averages = batch;
        self.batches_processed += 1;

        merge_metric(&mut self.averages.duration_ms, &batch.duration_ms, &mut self.duration_trend);
        merge_metric(&mut self.averages.quality_score, &batch.quality_score, &mut self.quality_trend);
        merge_metric(
            &mut self.averages.performance_delta,
            &batch.performance_delta,
            &mut self.performance_trend,
        );

        info!(
            batch_id = %batch_id,
            completed = aggregate.results.len(),
            failed = aggregate.failures.len(),
            conflicts = aggregate.conflicts.len(),
            "Batch results aggregated"
        );
        Some(aggregate)
    }

    /// Running averages across every finished batch.
    pub fn averages(&self) -> AggregateMetrics {
        self.averages
    }

    /// Current trend of each metric.
    pub fn trends(&self) -> MetricTrends {
        MetricTrends {
            duration: self.duration_trend.direction(),
            quality: self.quality_trend.direction(),
            performance: self.performance_trend.direction(),
        }
    }

    /// Totals, averages and trends.
    pub fn summary(&self) -> AggregateSummary {
        AggregateSummary {
            batches_processed: self.batches_processed,
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
            conflicts_detected: self.conflicts_detected,
            averages: self.averages,
            trends: self.trends(),
        }
    }
}

fn merge_metric(total: &mut RunningAverage, batch: &RunningAverage, trend: &mut TrendSeries) {
    if batch.count == 0 {
        return;
    }
    total.merge(batch.mean, batch.count);
    trend.push(batch.mean);
    debug!(mean = total.mean, count = total.count, "Running average updated");
}

fn performance_delta(output: &Value) -> Option<f64> {
    let comparison = output.get("performanceComparison")?;
    comparison
        .get("improvement")
        .and_then(Value::as_f64)
        .or_else(|| comparison.get("degradation").and_then(Value::as_f64).map(|d| -d))
}

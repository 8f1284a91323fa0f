//! System resource monitoring.
//!
//! The [`ResourceMonitor`] samples a [`MetricsSource`], keeps a bounded
//! history of [`ResourceSnapshot`]s, raises deduplicated threshold alerts and
//! computes advisory [`ResourceRecommendations`]. It never blocks or fails
//! tasks; everything it produces is informational.

mod alerts;
mod recommend;
mod source;

pub use alerts::{AlertManager, AlertSeverity, AlertType, ResourceAlert};
pub use recommend::{
    recommend, ResourceRecommendations, BASE_BATCH_SIZE, MAX_MEMORY_PER_WORKER,
    MIN_MEMORY_PER_WORKER,
};
pub use source::{MetricsSource, RawMetrics, StaticMetricsSource, SystemMetricsSource};

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::events::{EventBus, SchedulerEvent};
use crate::metrics::MetricsCollector;

/// Thresholds and retention for a [`ResourceMonitor`].
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// CPU usage above which alerts fire and fewer workers are recommended.
    pub max_cpu_usage_percent: f64,
    /// Memory usage above which alerts fire and fewer workers are recommended.
    pub max_memory_usage_percent: f64,
    /// Window in which an identical alert is not raised again.
    pub alert_cooldown: Duration,
    /// Number of snapshots retained.
    pub history_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_cpu_usage_percent: 80.0,
            max_memory_usage_percent: 75.0,
            alert_cooldown: Duration::from_secs(30),
            history_size: 100,
        }
    }
}

/// Scheduler-side inputs to a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SchedulerLoad {
    /// Size of the worker pool.
    pub worker_count: usize,
    /// Workers currently running a task.
    pub active_workers: usize,
    /// Tasks waiting in the pending queue.
    pub queue_length: usize,
    /// Completed tasks per second.
    pub throughput: f64,
}

/// Point-in-time resource metrics. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Global CPU usage in percent.
    pub cpu_usage: f64,
    /// Memory usage in percent.
    pub memory_usage: f64,
    /// One-minute load average.
    pub load_average: f64,
    /// Workers running a task.
    pub active_workers: usize,
    /// Pending queue length.
    pub queue_length: usize,
    /// Completed tasks per second.
    pub throughput: f64,
}

/// Result of one monitoring cycle.
#[derive(Debug, Clone)]
pub struct MonitorReport {
    /// The recorded snapshot.
    pub snapshot: ResourceSnapshot,
    /// Alerts raised by this cycle (after cooldown filtering).
    pub alerts: Vec<ResourceAlert>,
    /// Recommendations computed from this cycle.
    pub recommendations: ResourceRecommendations,
    /// Whether the recommendations differ from the previous cycle.
    pub recommendations_changed: bool,
}

/// Periodic resource sampler with alerting and recommendations.
pub struct ResourceMonitor {
    config: MonitorConfig,
    source: Box<dyn MetricsSource>,
    history: VecDeque<ResourceSnapshot>,
    alerts: AlertManager,
    last_recommendations: Option<ResourceRecommendations>,
    events: EventBus,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("config", &self.config)
            .field("history_len", &self.history.len())
            .finish()
    }
}

impl ResourceMonitor {
    /// Creates a monitor reading from `source` and publishing on `events`.
    pub fn new(config: MonitorConfig, source: Box<dyn MetricsSource>, events: EventBus) -> Self {
        let alerts = AlertManager::new(
            config.max_cpu_usage_percent,
            config.max_memory_usage_percent,
            config.alert_cooldown,
        );
        Self {
            history: VecDeque::with_capacity(config.history_size.max(1)),
            config,
            source,
            alerts,
            last_recommendations: None,
            events,
            metrics: MetricsCollector::new(),
        }
    }

    /// Samples the source and runs one monitoring cycle.
    pub async fn sample(&mut self, load: SchedulerLoad) -> MonitorReport {
        let raw = self.source.sample().await;
        self.observe(raw, load, Instant::now())
    }

    /// Runs one monitoring cycle over an already-taken sample.
    ///
    /// Records a snapshot, emits new alerts and emits recommendations when
    /// they changed since the previous cycle.
    pub fn observe(&mut self, raw: RawMetrics, load: SchedulerLoad, now: Instant) -> MonitorReport {
        let snapshot = ResourceSnapshot {
            timestamp: Utc::now(),
            cpu_usage: raw.cpu_usage,
            memory_usage: raw.memory_usage,
            load_average: raw.load_average,
            active_workers: load.active_workers,
            queue_length: load.queue_length,
            throughput: load.throughput,
        };
        self.record(snapshot.clone());

        debug!(
            cpu = raw.cpu_usage,
            memory = raw.memory_usage,
            load = raw.load_average,
            queue = load.queue_length,
            "Resource sample"
        );

        let alerts = self.alerts.check(&raw, now);
        for alert in &alerts {
            warn!(
                alert_type = %alert.alert_type,
                severity = %alert.severity,
                value = alert.value,
                threshold = alert.threshold,
                "{}",
                alert.message
            );
            self.metrics
                .record_resource_alert(&alert.alert_type.to_string(), &alert.severity.to_string());
            self.events.emit(SchedulerEvent::ResourceAlert(alert.clone()));
        }

        let recommendations = recommend(
            &raw,
            &load,
            self.config.max_cpu_usage_percent,
            self.config.max_memory_usage_percent,
        );
        let recommendations_changed = self
            .last_recommendations
            .as_ref()
            .map_or(true, |last| recommendations.differs_from(last));

        if recommendations_changed {
            info!(
                worker_count = recommendations.worker_count,
                memory_per_worker = recommendations.memory_per_worker,
                batch_size = recommendations.batch_size,
                "Updated resource recommendations"
            );
            self.events
                .emit(SchedulerEvent::Recommendation(recommendations.clone()));
        }
        self.last_recommendations = Some(recommendations.clone());

        MonitorReport {
            snapshot,
            alerts,
            recommendations,
            recommendations_changed,
        }
    }

    fn record(&mut self, snapshot: ResourceSnapshot) {
        let capacity = self.config.history_size.max(1);
        while self.history.len() >= capacity {
            self.history.pop_front();
        }
        self.history.push_back(snapshot);
    }

    /// Most recent snapshot, if any sample was taken.
    pub fn latest(&self) -> Option<&ResourceSnapshot> {
        self.history.back()
    }

    /// Recorded snapshots, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ResourceSnapshot> {
        self.history.iter()
    }

    /// Recommendations from the most recent cycle.
    pub fn recommendations(&self) -> Option<&ResourceRecommendations> {
        self.last_recommendations.as_ref()
    }

    /// Monitor configuration.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
}

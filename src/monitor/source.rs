//! Sources of raw system metrics.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use sysinfo::System;

/// Raw machine metrics at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMetrics {
    /// Global CPU usage in percent.
    pub cpu_usage: f64,
    /// Used memory in percent of total memory.
    pub memory_usage: f64,
    /// Total memory in bytes.
    pub total_memory: u64,
    /// One-minute load average.
    pub load_average: f64,
    /// Number of logical CPU cores.
    pub cpu_cores: usize,
}

impl Default for RawMetrics {
    fn default() -> Self {
        Self {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            total_memory: 0,
            load_average: 0.0,
            cpu_cores: 1,
        }
    }
}

/// Provider of [`RawMetrics`] samples.
#[async_trait]
pub trait MetricsSource: Send + 'static {
    /// Takes a fresh sample.
    async fn sample(&mut self) -> RawMetrics;
}

/// Samples the local machine through `sysinfo`.
///
/// CPU usage is computed between consecutive refreshes, so the very first
/// sample reports 0%.
pub struct SystemMetricsSource {
    system: System,
    cpu_cores: usize,
}

impl Default for SystemMetricsSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMetricsSource {
    /// Creates a source for the local machine.
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or_else(|_| system.cpus().len().max(1));
        Self { system, cpu_cores }
    }
}

#[async_trait]
impl MetricsSource for SystemMetricsSource {
    async fn sample(&mut self) -> RawMetrics {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let total_memory = self.system.total_memory();
        let memory_usage = if total_memory > 0 {
            self.system.used_memory() as f64 / total_memory as f64 * 100.0
        } else {
            0.0
        };

        RawMetrics {
            cpu_usage: self.system.global_cpu_info().cpu_usage() as f64,
            memory_usage,
            total_memory,
            load_average: System::load_average().one,
            cpu_cores: self.cpu_cores,
        }
    }
}

/// Source returning caller-controlled values. Clones share the same values.
#[derive(Debug, Clone, Default)]
pub struct StaticMetricsSource {
    metrics: Arc<RwLock<RawMetrics>>,
}

impl StaticMetricsSource {
    /// Creates a source that reports `metrics` until changed.
    pub fn new(metrics: RawMetrics) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(metrics)),
        }
    }

    /// Replaces the reported values.
    pub fn set(&self, metrics: RawMetrics) {
        *self.metrics.write().unwrap_or_else(PoisonError::into_inner) = metrics;
    }
}

#[async_trait]
impl MetricsSource for StaticMetricsSource {
    async fn sample(&mut self) -> RawMetrics {
        *self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }
}

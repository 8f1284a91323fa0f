//! Configuration for the batch processing system.
//!
//! This module gathers every knob of the scheduler core: worker pool sizing,
//! timeouts and retries, resource thresholds, load-balancing and conflict
//! resolution strategies, and monitoring cadence.

use std::time::Duration;

use thiserror::Error;

use crate::aggregate::ConflictResolutionStrategy;
use crate::monitor::MonitorConfig;
use crate::scheduler::strategy::LoadBalancingStrategy;
use crate::scheduler::worker_pool::WorkerPoolConfig;

const MIB: u64 = 1024 * 1024;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for a [`BatchProcessingSystem`](crate::system::BatchProcessingSystem).
#[derive(Debug, Clone)]
pub struct BatchConfig {
    // Worker pool settings
    /// Number of workers in the pool.
    pub max_workers: usize,
    /// Memory budget of a single worker in bytes.
    pub max_memory_per_worker: u64,
    /// Time a single task attempt may run before its worker is recycled.
    pub task_timeout: Duration,
    /// Retries allowed after the first failed attempt.
    pub retry_attempts: u32,
    /// Base retry delay; the n-th retry waits `n * retry_backoff`.
    pub retry_backoff: Duration,
    /// Delay a restarted worker waits before accepting tasks.
    pub restart_settle_delay: Duration,
    /// Maximum time to wait for all workers to come up.
    pub spawn_timeout: Duration,
    /// Maximum time to wait for workers to stop on shutdown.
    pub shutdown_timeout: Duration,

    // Scheduling settings
    /// Strategy used to pick an idle worker for a task.
    pub load_balancing: LoadBalancingStrategy,
    /// Delay between scheduling ticks while tasks remain queued.
    pub schedule_interval: Duration,

    // Resource thresholds
    /// CPU usage above which alerts fire and fewer workers are recommended.
    pub max_cpu_usage_percent: f64,
    /// Memory usage above which alerts fire and fewer workers are recommended.
    pub max_memory_usage_percent: f64,
    /// Whether the periodic resource monitor runs.
    pub monitor_enabled: bool,
    /// How often system resources are sampled.
    pub monitor_interval: Duration,
    /// Window during which identical alerts are suppressed.
    pub alert_cooldown: Duration,
    /// Number of resource snapshots kept.
    pub history_size: usize,

    // Progress and results
    /// Number of recent task durations used for ETA.
    pub eta_window: usize,
    /// Default strategy for resolving detected conflicts.
    pub conflict_resolution: ConflictResolutionStrategy,
    /// Events buffered per subscriber.
    pub event_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_memory_per_worker: 1024 * MIB,
            task_timeout: Duration::from_secs(300),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(1000),
            restart_settle_delay: Duration::from_millis(500),
            spawn_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),

            load_balancing: LoadBalancingStrategy::Adaptive,
            schedule_interval: Duration::from_millis(100),

            max_cpu_usage_percent: 80.0,
            max_memory_usage_percent: 75.0,
            monitor_enabled: true,
            monitor_interval: Duration::from_secs(5),
            alert_cooldown: Duration::from_secs(30),
            history_size: 100,

            eta_window: 50,
            conflict_resolution: ConflictResolutionStrategy::LatestWins,
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Default worker count: one per core, at most eight.
pub fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

impl BatchConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BATCH_MAX_WORKERS`: Worker count (default: min(cores, 8))
    /// - `BATCH_MAX_MEMORY_PER_WORKER_MB`: Per-worker memory budget (default: 1024)
    /// - `BATCH_TASK_TIMEOUT_MS`: Task timeout (default: 300000)
    /// - `BATCH_RETRY_ATTEMPTS`: Retries per task (default: 3)
    /// - `BATCH_RETRY_BACKOFF_MS`: Base retry delay (default: 1000)
    /// - `BATCH_RESTART_SETTLE_MS`: Settle delay after a restart (default: 500)
    /// - `BATCH_LOAD_BALANCING`: round-robin, least-loaded, memory-optimized, adaptive
    /// - `BATCH_MAX_CPU_PERCENT`: CPU threshold (default: 80)
    /// - `BATCH_MAX_MEMORY_PERCENT`: Memory threshold (default: 75)
    /// - `BATCH_MONITOR_ENABLED`: Enable resource monitoring (default: true)
    /// - `BATCH_MONITOR_INTERVAL_MS`: Sampling interval (default: 5000)
    /// - `BATCH_CONFLICT_RESOLUTION`: latest_wins, manual_review, automatic_rollback, quality_threshold
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("BATCH_MAX_WORKERS") {
            config.max_workers = parse_env_value(&val, "BATCH_MAX_WORKERS")?;
        }

        if let Ok(val) = std::env::var("BATCH_MAX_MEMORY_PER_WORKER_MB") {
            let mb: u64 = parse_env_value(&val, "BATCH_MAX_MEMORY_PER_WORKER_MB")?;
            config.max_memory_per_worker = mb * MIB;
        }

        if let Ok(val) = std::env::var("BATCH_TASK_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "BATCH_TASK_TIMEOUT_MS")?;
            config.task_timeout = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("BATCH_RETRY_ATTEMPTS") {
            config.retry_attempts = parse_env_value(&val, "BATCH_RETRY_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("BATCH_RETRY_BACKOFF_MS") {
            let ms: u64 = parse_env_value(&val, "BATCH_RETRY_BACKOFF_MS")?;
            config.retry_backoff = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("BATCH_RESTART_SETTLE_MS") {
            let ms: u64 = parse_env_value(&val, "BATCH_RESTART_SETTLE_MS")?;
            config.restart_settle_delay = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("BATCH_LOAD_BALANCING") {
            config.load_balancing = parse_env_value(&val, "BATCH_LOAD_BALANCING")?;
        }

        if let Ok(val) = std::env::var("BATCH_MAX_CPU_PERCENT") {
            config.max_cpu_usage_percent = parse_env_value(&val, "BATCH_MAX_CPU_PERCENT")?;
        }

        if let Ok(val) = std::env::var("BATCH_MAX_MEMORY_PERCENT") {
            config.max_memory_usage_percent = parse_env_value(&val, "BATCH_MAX_MEMORY_PERCENT")?;
        }

        if let Ok(val) = std::env::var("BATCH_MONITOR_ENABLED") {
            config.monitor_enabled = parse_env_bool(&val, "BATCH_MONITOR_ENABLED")?;
        }

        if let Ok(val) = std::env::var("BATCH_MONITOR_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "BATCH_MONITOR_INTERVAL_MS")?;
            config.monitor_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("BATCH_CONFLICT_RESOLUTION") {
            config.conflict_resolution = parse_env_value(&val, "BATCH_CONFLICT_RESOLUTION")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.max_memory_per_worker == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_memory_per_worker must be greater than 0".to_string(),
            ));
        }

        if self.task_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "task_timeout must be greater than 0".to_string(),
            ));
        }

        if self.schedule_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "schedule_interval must be greater than 0".to_string(),
            ));
        }

        if self.monitor_enabled && self.monitor_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "monitor_interval must be greater than 0".to_string(),
            ));
        }

        if !(self.max_cpu_usage_percent > 0.0 && self.max_cpu_usage_percent <= 100.0) {
            return Err(ConfigError::ValidationFailed(
                "max_cpu_usage_percent must be in (0, 100]".to_string(),
            ));
        }

        if !(self.max_memory_usage_percent > 0.0 && self.max_memory_usage_percent <= 100.0) {
            return Err(ConfigError::ValidationFailed(
                "max_memory_usage_percent must be in (0, 100]".to_string(),
            ));
        }

        if self.history_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "history_size must be greater than 0".to_string(),
            ));
        }

        if self.eta_window == 0 {
            return Err(ConfigError::ValidationFailed(
                "eta_window must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Worker pool settings derived from this configuration.
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            max_workers: self.max_workers,
            max_memory_per_worker: self.max_memory_per_worker,
            task_timeout: self.task_timeout,
            retry_attempts: self.retry_attempts,
            retry_backoff: self.retry_backoff,
            restart_settle_delay: self.restart_settle_delay,
            spawn_timeout: self.spawn_timeout,
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    /// Resource monitor settings derived from this configuration.
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            max_cpu_usage_percent: self.max_cpu_usage_percent,
            max_memory_usage_percent: self.max_memory_usage_percent,
            alert_cooldown: self.alert_cooldown,
            history_size: self.history_size,
        }
    }

    /// Builder method to set the worker count.
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Builder method to set the per-worker memory budget in bytes.
    pub fn with_max_memory_per_worker(mut self, bytes: u64) -> Self {
        self.max_memory_per_worker = bytes;
        self
    }

    /// Builder method to set the task timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Builder method to set the retry count.
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Builder method to set the base retry delay.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Builder method to set the restart settle delay.
    pub fn with_restart_settle_delay(mut self, delay: Duration) -> Self {
        self.restart_settle_delay = delay;
        self
    }

    /// Builder method to set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Builder method to set the load-balancing strategy.
    pub fn with_load_balancing(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.load_balancing = strategy;
        self
    }

    /// Builder method to set the scheduling tick interval.
    pub fn with_schedule_interval(mut self, interval: Duration) -> Self {
        self.schedule_interval = interval;
        self
    }

    /// Builder method to set the CPU threshold.
    pub fn with_max_cpu_usage_percent(mut self, percent: f64) -> Self {
        self.max_cpu_usage_percent = percent;
        self
    }

    /// Builder method to set the memory threshold.
    pub fn with_max_memory_usage_percent(mut self, percent: f64) -> Self {
        self.max_memory_usage_percent = percent;
        self
    }

    /// Builder method to enable or disable resource monitoring.
    pub fn with_monitor(mut self, enabled: bool) -> Self {
        self.monitor_enabled = enabled;
        self
    }

    /// Builder method to set the resource sampling interval.
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Builder method to set the ETA window.
    pub fn with_eta_window(mut self, window: usize) -> Self {
        self.eta_window = window;
        self
    }

    /// Builder method to set the conflict resolution strategy.
    pub fn with_conflict_resolution(mut self, strategy: ConflictResolutionStrategy) -> Self {
        self.conflict_resolution = strategy;
        self
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

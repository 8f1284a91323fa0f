//! refactor-forge: batch scheduling of long-running refactoring tasks.
//!
//! This library coordinates batches of independent tasks across a fixed
//! pool of workers, with timeouts, retries, resource monitoring, progress
//! tracking and conflict-aware result aggregation. What a task computes is
//! up to the [`TaskExecutor`] supplied by the caller.

pub mod aggregate;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod metrics;
pub mod monitor;
pub mod progress;
pub mod scheduler;
pub mod system;

pub use aggregate::{ConflictResolutionStrategy, ResultAggregator};
pub use config::{BatchConfig, ConfigError};
pub use error::{ProgressError, SchedulerError, SchedulerResult};
pub use events::{EventBus, SchedulerEvent};
pub use executor::{CommandExecutor, ExecutorError, FnExecutor, TaskContext, TaskExecutor};
pub use monitor::{ResourceMonitor, StaticMetricsSource, SystemMetricsSource};
pub use progress::{BatchStatus, ProgressTracker, TaskStatus};
pub use scheduler::{LoadBalancingStrategy, Priority, TaskSpec};
pub use system::{BatchHandle, BatchOptions, BatchProcessingSystem, BatchReport, SystemStatus};

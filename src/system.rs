//! Batch processing facade.
//!
//! [`BatchProcessingSystem`] wires the worker pool, scheduler, progress
//! tracker, result aggregator and resource monitor together and exposes
//! submit, status, event and shutdown operations.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use refactor_forge::{BatchConfig, BatchOptions, BatchProcessingSystem, FnExecutor, TaskSpec};
//!
//! let executor = Arc::new(FnExecutor::new(|task| async move { Ok(task.payload.clone()) }));
//! let system = BatchProcessingSystem::start(BatchConfig::default(), executor).await?;
//!
//! let report = system
//!     .process_batch(vec![TaskSpec::new("t-1"), TaskSpec::new("t-2")], BatchOptions::default())
//!     .await?;
//! println!("{} completed, {} failed", report.completed, report.failed);
//!
//! system.shutdown().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregate::{
    AggregateMetrics, AggregateSummary, BatchAggregate, ConflictRecord,
    ConflictResolutionStrategy, Resolution,
};
use crate::config::BatchConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{EventBus, SchedulerEvent};
use crate::executor::TaskExecutor;
use crate::monitor::{
    MetricsSource, ResourceRecommendations, ResourceSnapshot, SystemMetricsSource,
};
use crate::progress::{BatchProgress, BatchStatus, GlobalProgress};
use crate::scheduler::orchestrator::{Command, Orchestrator, Submission};
use crate::scheduler::task::{duration_millis, CompletedTask, FailedTask, Task, TaskSpec};
use crate::scheduler::worker_pool::{PoolStats, WorkerStats};

/// Per-batch submission options.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Batch id; a UUID is generated when absent.
    pub batch_id: Option<String>,
    /// Overrides the configured conflict resolution strategy for this batch.
    pub conflict_resolution: Option<ConflictResolutionStrategy>,
}

impl BatchOptions {
    /// Creates default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the batch id.
    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    /// Sets the conflict resolution strategy for this batch.
    pub fn with_conflict_resolution(mut self, strategy: ConflictResolutionStrategy) -> Self {
        self.conflict_resolution = Some(strategy);
        self
    }
}

/// Final outcome of a batch.
///
/// Partial failure is reported here, never as an error.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Strategy used for this batch's conflicts.
    pub conflict_resolution: ConflictResolutionStrategy,
    pub results: Vec<CompletedTask>,
    /// Failed tasks with their last error and attempt count.
    pub failures: Vec<FailedTask>,
    pub conflicts: Vec<ConflictRecord>,
    pub resolutions: Vec<Resolution>,
    /// Averages over this batch.
    pub aggregate: AggregateMetrics,
}

impl BatchReport {
    pub(crate) fn new(progress: BatchProgress, aggregate: BatchAggregate) -> Self {
        Self {
            batch_id: progress.batch_id,
            status: progress.status,
            total: progress.total_tasks,
            completed: progress.completed_tasks,
            failed: progress.failed_tasks,
            started_at: progress.started_at,
            duration: progress.elapsed,
            conflict_resolution: aggregate.strategy,
            results: aggregate.results,
            failures: aggregate.failures,
            conflicts: aggregate.conflicts,
            resolutions: aggregate.resolutions,
            aggregate: aggregate.averages,
        }
    }

    /// Error message of a failed task.
    pub fn error_for(&self, task_id: &str) -> Option<&str> {
        self.failures
            .iter()
            .find(|failure| failure.task_id == task_id)
            .map(|failure| failure.error.as_str())
    }
}

/// Snapshot of the whole system.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub queue_length: usize,
    pub active_tasks: usize,
    /// Tasks waiting out a retry backoff.
    pub pending_retries: usize,
    pub workers: Vec<WorkerStats>,
    pub pool: PoolStats,
    /// Batches that have not finished yet.
    pub batches: Vec<BatchProgress>,
    pub progress: GlobalProgress,
    /// Latest resource sample, when monitoring is enabled.
    pub resources: Option<ResourceSnapshot>,
    pub recommendations: Option<ResourceRecommendations>,
    pub aggregate: AggregateSummary,
}

/// Handle to a submitted batch.
#[derive(Debug)]
pub struct BatchHandle {
    batch_id: String,
    completion: oneshot::Receiver<SchedulerResult<BatchReport>>,
}

impl BatchHandle {
    /// Id of the batch.
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Waits until every task of the batch is terminal.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::ShutDown` if the system shut down first.
    pub async fn wait(self) -> SchedulerResult<BatchReport> {
        self.completion
            .await
            .map_err(|_| SchedulerError::ShutDown)?
    }
}

/// Facade over the batch scheduling subsystems.
pub struct BatchProcessingSystem {
    config: BatchConfig,
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus,
    control_loop: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BatchProcessingSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessingSystem")
            .field("config", &self.config)
            .finish()
    }
}

impl BatchProcessingSystem {
    /// Starts the system, sampling resources of the local machine.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Config` for invalid configuration and
    /// `SchedulerError::Pool` when the worker pool cannot be initialized.
    pub async fn start(config: BatchConfig, executor: Arc<dyn TaskExecutor>) -> SchedulerResult<Self> {
        Self::start_with_source(config, executor, Box::new(SystemMetricsSource::new())).await
    }

    /// Starts the system with a custom metrics source.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    pub async fn start_with_source(
        config: BatchConfig,
        executor: Arc<dyn TaskExecutor>,
        source: Box<dyn MetricsSource>,
    ) -> SchedulerResult<Self> {
        config.validate()?;
        let events = EventBus::new(config.event_capacity);

        let (commands, handle) =
            Orchestrator::spawn(config.clone(), executor, source, events.clone()).await?;

        info!(
            max_workers = config.max_workers,
            load_balancing = %config.load_balancing,
            conflict_resolution = %config.conflict_resolution,
            "Batch processing system started"
        );

        Ok(Self {
            config,
            commands,
            events,
            control_loop: Mutex::new(Some(handle)),
        })
    }

    /// Submits a batch and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::DuplicateBatch` or `SchedulerError::DuplicateTask`
    /// when ids clash, and `SchedulerError::ShutDown` after shutdown.
    pub async fn submit_batch(
        &self,
        tasks: Vec<TaskSpec>,
        options: BatchOptions,
    ) -> SchedulerResult<BatchHandle> {
        let batch_id = options
            .batch_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let tasks: Vec<Task> = tasks
            .into_iter()
            .map(|spec| Task::from_spec(spec, batch_id.clone()))
            .collect();

        let (completion, receiver) = oneshot::channel();
        let (reply, ack) = oneshot::channel();
        let submission = Submission {
            batch_id: batch_id.clone(),
            tasks,
            conflict_resolution: options.conflict_resolution,
            completion,
        };

        self.commands
            .send(Command::Submit { submission, reply })
            .map_err(|_| SchedulerError::ShutDown)?;
        ack.await.map_err(|_| SchedulerError::ShutDown)??;

        Ok(BatchHandle {
            batch_id,
            completion: receiver,
        })
    }

    /// Submits a batch and waits for its report.
    ///
    /// # Errors
    ///
    /// Same as [`submit_batch`](Self::submit_batch) and [`BatchHandle::wait`].
    pub async fn process_batch(
        &self,
        tasks: Vec<TaskSpec>,
        options: BatchOptions,
    ) -> SchedulerResult<BatchReport> {
        self.submit_batch(tasks, options).await?.wait().await
    }

    /// Returns queue, worker, progress and resource status.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::ShutDown` after shutdown.
    pub async fn status(&self) -> SchedulerResult<SystemStatus> {
        let (reply, status) = oneshot::channel();
        self.commands
            .send(Command::Status { reply })
            .map_err(|_| SchedulerError::ShutDown)?;
        status.await.map_err(|_| SchedulerError::ShutDown)
    }

    /// Subscribes to scheduler events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Scheduler events as a stream. Lagging consumers receive an error item.
    pub fn event_stream(&self) -> BroadcastStream<SchedulerEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Configuration the system runs with.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Stops all workers and resolves outstanding batches with
    /// `SchedulerError::ShutDown`. Returns the ids of tasks that did not
    /// finish. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Pool` when some workers could not be stopped
    /// cleanly. They are stopped regardless.
    pub async fn shutdown(&self) -> SchedulerResult<Vec<String>> {
        let Some(handle) = self.control_loop.lock().await.take() else {
            return Ok(Vec::new());
        };

        let (reply, done) = oneshot::channel();
        let result = match self.commands.send(Command::Shutdown { reply }) {
            Ok(()) => done.await.unwrap_or(Ok(Vec::new())),
            Err(_) => Ok(Vec::new()),
        };

        if let Err(e) = handle.await {
            warn!(error = %e, "Scheduler control loop ended abnormally");
        }

        if let Ok(abandoned) = &result {
            info!(abandoned = abandoned.len(), "Batch processing system stopped");
        }
        result
    }
}

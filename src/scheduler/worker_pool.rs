//! Worker pool executing tasks on isolated workers.
//!
//! Each worker incarnation owns a dedicated OS thread running its own
//! single-threaded tokio runtime, with its own command channel. It runs at
//! most one task at a time and reports back over a channel shared by the
//! whole pool. Timeouts and retry timers live on the pool owner's runtime,
//! so an executor that blocks its thread cannot delay them. The pool itself
//! is owned by a single control loop, so all bookkeeping (worker table,
//! active task records, retry timers) is mutated by one writer.
//!
//! # Features
//!
//! - Fixed number of workers, spawned up front; spawn failure tears down the pool
//! - Per-task timeout; a timed-out worker is recycled and its thread
//!   abandoned if the executor does not yield
//! - Crash detection; a panicking executor gets its worker recycled
//! - Linear retry backoff (`retry_backoff * retry_count`)
//! - Settle delay before a recycled worker accepts tasks again
//! - Stale report fencing by dispatch id and worker generation

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, SchedulerEvent};
use crate::executor::{TaskContext, TaskExecutor};
use crate::metrics::MetricsCollector;

use super::message::{Assignment, WorkerId, WorkerMessage, WorkerReport};
use super::strategy::WorkerLoad;
use super::task::{CompletedTask, FailedTask, Task};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker could not be brought up during initialization.
    #[error("Worker {worker_id} initialization failed: {reason}")]
    WorkerInitFailed { worker_id: WorkerId, reason: String },

    /// Workers did not become ready in time.
    #[error("Workers not ready after {0:?}")]
    SpawnTimeout(Duration),

    /// The pool configuration cannot produce a working pool.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Some workers did not stop cleanly.
    #[error("Shutdown incomplete: {}", .0.join("; "))]
    ShutdownIncomplete(Vec<String>),

    /// The worker report channel closed unexpectedly.
    #[error("Worker report channel closed")]
    ChannelClosed,
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of workers to spawn.
    pub max_workers: usize,
    /// Memory budget of a single worker in bytes.
    pub max_memory_per_worker: u64,
    /// Maximum time allowed for a single task attempt.
    pub task_timeout: Duration,
    /// Retries allowed after the first failed attempt.
    pub retry_attempts: u32,
    /// Base retry delay.
    pub retry_backoff: Duration,
    /// Delay a recycled worker waits before becoming ready.
    pub restart_settle_delay: Duration,
    /// Maximum time to wait for the initial workers.
    pub spawn_timeout: Duration,
    /// Maximum time to wait for workers to stop.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_memory_per_worker: 1024 * 1024 * 1024,
            task_timeout: Duration::from_secs(300),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(1000),
            restart_settle_delay: Duration::from_millis(500),
            spawn_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            ..Default::default()
        }
    }

    /// Sets the task timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Sets the number of retries.
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Sets the base retry delay.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Sets the restart settle delay.
    pub fn with_restart_settle_delay(mut self, delay: Duration) -> Self {
        self.restart_settle_delay = delay;
        self
    }

    /// Sets the spawn timeout.
    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Delay before the `retry_count`-th retry.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        self.retry_backoff * retry_count
    }
}

/// Lifecycle state of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, running setup.
    Starting,
    /// Ready for a task.
    Idle,
    /// Running exactly one task.
    Busy,
    /// Being replaced after a crash or timeout.
    Restarting,
    /// Stopped by pool shutdown.
    Stopped,
}

/// Observable statistics of one worker slot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    /// Worker id.
    pub id: WorkerId,
    /// Current lifecycle state.
    pub state: WorkerState,
    /// Task currently bound to the worker.
    pub current_task: Option<String>,
    /// Tasks completed successfully.
    pub tasks_completed: u64,
    /// Attempts that failed, timed out or crashed.
    pub tasks_failed: u64,
    /// Number of times the slot was recycled.
    pub restarts: u64,
    /// Last reported memory usage in bytes.
    pub memory_usage: u64,
    /// Last reported CPU usage in percent.
    pub cpu_usage: f64,
}

impl WorkerStats {
    fn new(id: WorkerId) -> Self {
        Self {
            id,
            state: WorkerState::Starting,
            current_task: None,
            tasks_completed: 0,
            tasks_failed: 0,
            restarts: 0,
            memory_usage: 0,
            cpu_usage: 0.0,
        }
    }

    /// Returns whether the worker can take a task.
    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
    }
}

/// Aggregate statistics about the worker pool.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently running a task.
    pub busy_workers: usize,
    /// Total tasks completed successfully.
    pub tasks_completed: u64,
    /// Total failed attempts.
    pub tasks_failed: u64,
    /// Total worker restarts.
    pub restarts: u64,
    /// Average duration of successful attempts.
    #[serde(with = "super::task::duration_millis")]
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of attempts that finished (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Everything that can wake the control loop on behalf of the pool.
#[derive(Debug)]
pub enum PoolSignal {
    /// A worker reported something.
    Worker(WorkerReport),
    /// A dispatched task exceeded its timeout.
    TimedOut { task_id: String, dispatch_id: u64 },
    /// A retry backoff elapsed; the task may be queued again.
    RetryDue(Task),
}

/// Result of a dispatch attempt.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The task is now bound to this worker.
    Committed(WorkerId),
    /// No suitable worker; the task is handed back for re-queueing.
    Rejected(Task),
}

/// What the control loop has to act on after a signal was handled.
#[derive(Debug)]
pub enum PoolOutcome {
    /// A worker became ready for tasks.
    WorkerReady(WorkerId),
    /// A task finished successfully.
    Completed(CompletedTask),
    /// An attempt failed and the task will be retried after `delay`.
    RetryScheduled {
        task_id: String,
        batch_id: String,
        retry_count: u32,
        delay: Duration,
        error: String,
    },
    /// A task exhausted its retries.
    Failed(FailedTask),
    /// A retry backoff elapsed; the task goes back to the head of the queue.
    Requeue(Task),
}

/// Binding of a task to the worker running it.
struct ActiveTaskRecord {
    task: Task,
    worker_id: WorkerId,
    dispatch_id: u64,
    started_at: Instant,
    timeout: JoinHandle<()>,
}

/// Handle to the thread of one worker incarnation.
///
/// Dropping it cancels the worker at its next await point. A worker stuck
/// in blocking code keeps its thread until the code returns; whatever it
/// reports afterwards carries a stale generation and is dropped.
struct WorkerThread {
    _cancel: oneshot::Sender<()>,
    exited: oneshot::Receiver<()>,
}

struct WorkerSlot {
    stats: WorkerStats,
    generation: u64,
    commands: mpsc::UnboundedSender<WorkerMessage>,
    handle: Option<WorkerThread>,
}

/// Pool of workers executing tasks through a shared [`TaskExecutor`].
pub struct WorkerPool {
    config: WorkerPoolConfig,
    executor: Arc<dyn TaskExecutor>,
    events: EventBus,
    metrics: MetricsCollector,
    signals: mpsc::UnboundedSender<PoolSignal>,
    workers: Vec<WorkerSlot>,
    active: HashMap<String, ActiveTaskRecord>,
    retry_timers: HashMap<String, JoinHandle<()>>,
    next_dispatch_id: u64,
    total_task_duration: Duration,
    shutting_down: bool,
}

impl WorkerPool {
    /// Spawns `config.max_workers` workers and waits until all are ready.
    ///
    /// Returns the pool together with the receiver every pool signal arrives
    /// on; the owner must feed each received signal to [`handle_signal`](Self::handle_signal).
    ///
    /// # Arguments
    ///
    /// * `config` - Pool configuration
    /// * `executor` - Executor shared by all workers
    /// * `events` - Bus for task and worker events
    ///
    /// # Errors
    ///
    /// Returns `PoolError::WorkerInitFailed` if any worker fails setup and
    /// `PoolError::SpawnTimeout` if workers are not ready in time. In both
    /// cases every spawned worker has been torn down.
    pub async fn initialize(
        config: WorkerPoolConfig,
        executor: Arc<dyn TaskExecutor>,
        events: EventBus,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PoolSignal>), PoolError> {
        if config.max_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        let (signals, mut receiver) = mpsc::unbounded_channel();
        let mut pool = Self {
            config,
            executor,
            events,
            metrics: MetricsCollector::new(),
            signals,
            workers: Vec::new(),
            active: HashMap::new(),
            retry_timers: HashMap::new(),
            next_dispatch_id: 0,
            total_task_duration: Duration::ZERO,
            shutting_down: false,
        };

        for worker_id in 0..pool.config.max_workers {
            let (commands, handle) = match pool.spawn_worker(worker_id, 0, Duration::ZERO) {
                Ok(spawned) => spawned,
                Err(e) => {
                    error!(worker_id = worker_id, error = %e, "Failed to spawn worker thread");
                    pool.abort_all();
                    return Err(PoolError::WorkerInitFailed {
                        worker_id,
                        reason: format!("thread spawn failed: {}", e),
                    });
                }
            };
            pool.workers.push(WorkerSlot {
                stats: WorkerStats::new(worker_id),
                generation: 0,
                commands,
                handle: Some(handle),
            });
        }

        let deadline = tokio::time::Instant::now() + pool.config.spawn_timeout;
        let mut ready = 0;
        while ready < pool.config.max_workers {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some(PoolSignal::Worker(WorkerReport::Ready { worker_id, .. }))) => {
                    if let Some(slot) = pool.workers.get_mut(worker_id) {
                        if slot.stats.state == WorkerState::Starting {
                            slot.stats.state = WorkerState::Idle;
                            ready += 1;
                            debug!(worker_id = worker_id, "Worker ready");
                        }
                    }
                }
                Ok(Some(PoolSignal::Worker(WorkerReport::SetupFailed {
                    worker_id, error, ..
                }))) => {
                    error!(worker_id = worker_id, error = %error, "Worker failed to start");
                    pool.abort_all();
                    return Err(PoolError::WorkerInitFailed {
                        worker_id,
                        reason: error,
                    });
                }
                Ok(Some(other)) => {
                    debug!(signal = ?other, "Ignoring signal during pool startup");
                }
                Ok(None) => {
                    pool.abort_all();
                    return Err(PoolError::ChannelClosed);
                }
                Err(_) => {
                    pool.abort_all();
                    return Err(PoolError::SpawnTimeout(pool.config.spawn_timeout));
                }
            }
        }

        info!(num_workers = pool.config.max_workers, "Worker pool started");
        Ok((pool, receiver))
    }

    /// Dispatches a task to the lowest-numbered idle worker.
    ///
    /// Never blocks. Returns the task back when no worker is idle.
    pub fn dispatch(&mut self, task: Task) -> DispatchOutcome {
        match self.workers.iter().find(|slot| slot.stats.is_idle()) {
            Some(slot) => {
                let worker_id = slot.stats.id;
                self.dispatch_to(task, worker_id)
            }
            None => DispatchOutcome::Rejected(task),
        }
    }

    /// Dispatches a task to a specific worker.
    ///
    /// The worker must be idle and hold no active task; otherwise the task is
    /// handed back. Arms the task timeout and emits `task_started`.
    pub fn dispatch_to(&mut self, task: Task, worker_id: WorkerId) -> DispatchOutcome {
        if self.shutting_down || self.active.contains_key(&task.id) {
            return DispatchOutcome::Rejected(task);
        }
        let Some(slot) = self.workers.get_mut(worker_id) else {
            return DispatchOutcome::Rejected(task);
        };
        if !slot.stats.is_idle() || slot.stats.current_task.is_some() {
            return DispatchOutcome::Rejected(task);
        }

        self.next_dispatch_id += 1;
        let dispatch_id = self.next_dispatch_id;
        let assignment = Assignment {
            dispatch_id,
            task: task.clone(),
        };

        if let Err(mpsc::error::SendError(message)) = slot
            .commands
            .send(WorkerMessage::TaskAssignment(assignment))
        {
            warn!(worker_id = worker_id, "Worker channel closed, recycling worker");
            self.restart_worker(worker_id, "worker channel closed");
            return match message {
                WorkerMessage::TaskAssignment(assignment) => {
                    DispatchOutcome::Rejected(assignment.task)
                }
                WorkerMessage::ShutdownSignal => DispatchOutcome::Rejected(task),
            };
        }

        slot.stats.state = WorkerState::Busy;
        slot.stats.current_task = Some(task.id.clone());

        let timeout = self.arm_timeout(task.id.clone(), dispatch_id);

        info!(
            worker_id = worker_id,
            task_id = %task.id,
            batch_id = %task.batch_id,
            attempt = task.attempt(),
            "Dispatched task"
        );
        self.events.emit(SchedulerEvent::TaskStarted {
            batch_id: task.batch_id.clone(),
            task_id: task.id.clone(),
            worker_id,
            attempt: task.attempt(),
        });

        self.active.insert(
            task.id.clone(),
            ActiveTaskRecord {
                task,
                worker_id,
                dispatch_id,
                started_at: Instant::now(),
                timeout,
            },
        );
        self.metrics.update_active_workers(self.busy_count());

        DispatchOutcome::Committed(worker_id)
    }

    /// Applies a signal to the pool state.
    ///
    /// Returns what the owner has to act on, if anything. Signals from
    /// superseded dispatches or recycled worker incarnations are dropped.
    pub fn handle_signal(&mut self, signal: PoolSignal) -> Option<PoolOutcome> {
        if self.shutting_down {
            debug!(signal = ?signal, "Ignoring signal after shutdown");
            return None;
        }

        match signal {
            PoolSignal::Worker(report) => {
                let worker_id = report.worker_id();
                let current = self.workers.get(worker_id).map(|slot| slot.generation);
                if current != Some(report.generation()) {
                    debug!(
                        worker_id = worker_id,
                        generation = report.generation(),
                        "Dropping report from stale worker incarnation"
                    );
                    return None;
                }
                self.handle_report(report)
            }
            PoolSignal::TimedOut {
                task_id,
                dispatch_id,
            } => self.on_task_timeout(&task_id, dispatch_id),
            PoolSignal::RetryDue(task) => {
                self.retry_timers.remove(&task.id);
                debug!(task_id = %task.id, retry_count = task.retry_count, "Retry backoff elapsed");
                Some(PoolOutcome::Requeue(task))
            }
        }
    }

    fn handle_report(&mut self, report: WorkerReport) -> Option<PoolOutcome> {
        match report {
            WorkerReport::Ready { worker_id, .. } => {
                let slot = self.workers.get_mut(worker_id)?;
                match slot.stats.state {
                    WorkerState::Starting | WorkerState::Restarting => {
                        slot.stats.state = WorkerState::Idle;
                        info!(worker_id = worker_id, "Worker ready");
                        Some(PoolOutcome::WorkerReady(worker_id))
                    }
                    _ => None,
                }
            }
            WorkerReport::SetupFailed {
                worker_id, error, ..
            } => {
                // Runtime restarts keep trying; the replacement waits out the settle delay first.
                warn!(worker_id = worker_id, error = %error, "Replacement worker failed setup, retrying");
                self.metrics.record_worker_restart("setup");
                self.respawn(worker_id);
                None
            }
            WorkerReport::ProgressUpdate {
                worker_id,
                dispatch_id,
                percent,
                message,
                ..
            } => {
                let record = self.record_for(worker_id, dispatch_id)?;
                let task_id = record.task.id.clone();
                debug!(worker_id = worker_id, task_id = %task_id, percent = percent, "Task progress");
                self.events.emit(SchedulerEvent::TaskProgress {
                    task_id,
                    worker_id,
                    percent,
                    message,
                });
                None
            }
            WorkerReport::ResourceReport {
                worker_id,
                memory_bytes,
                cpu_percent,
                ..
            } => {
                let budget = self.config.max_memory_per_worker;
                let slot = self.workers.get_mut(worker_id)?;
                slot.stats.memory_usage = memory_bytes;
                slot.stats.cpu_usage = cpu_percent;
                if memory_bytes > budget {
                    warn!(
                        worker_id = worker_id,
                        memory_bytes = memory_bytes,
                        budget = budget,
                        "Worker exceeds its memory budget"
                    );
                }
                None
            }
            WorkerReport::TaskCompleted {
                worker_id,
                dispatch_id,
                output,
                duration,
                ..
            } => self.on_task_completed(worker_id, dispatch_id, output, duration),
            WorkerReport::TaskFailed {
                worker_id,
                dispatch_id,
                error,
                ..
            } => self.on_task_failed(worker_id, dispatch_id, error),
            WorkerReport::Crashed {
                worker_id,
                dispatch_id,
                reason,
                ..
            } => self.on_worker_crashed(worker_id, dispatch_id, reason),
        }
    }

    /// Resolves a successful attempt: the worker becomes idle and the
    /// completion is emitted with the wall-clock duration since dispatch.
    fn on_task_completed(
        &mut self,
        worker_id: WorkerId,
        dispatch_id: u64,
        output: serde_json::Value,
        execution_time: Duration,
    ) -> Option<PoolOutcome> {
        let record = self.take_record(worker_id, dispatch_id)?;
        let duration = record.started_at.elapsed();
        let task = record.task;

        if let Some(slot) = self.workers.get_mut(worker_id) {
            slot.stats.state = WorkerState::Idle;
            slot.stats.current_task = None;
            slot.stats.tasks_completed += 1;
        }
        self.total_task_duration += duration;

        info!(
            worker_id = worker_id,
            task_id = %task.id,
            duration_ms = duration.as_millis() as u64,
            execution_ms = execution_time.as_millis() as u64,
            "Task completed"
        );
        self.events.emit(SchedulerEvent::TaskCompleted {
            batch_id: task.batch_id.clone(),
            task_id: task.id.clone(),
            worker_id,
            duration_ms: duration.as_millis() as u64,
        });
        self.metrics
            .record_task_completed(&task.priority.to_string(), duration.as_secs_f64());
        self.metrics.update_active_workers(self.busy_count());

        Some(PoolOutcome::Completed(CompletedTask {
            task_id: task.id,
            batch_id: task.batch_id,
            worker_id,
            output,
            duration,
            attempts: task.retry_count + 1,
        }))
    }

    /// Resolves an attempt whose executor returned an error.
    fn on_task_failed(
        &mut self,
        worker_id: WorkerId,
        dispatch_id: u64,
        error: String,
    ) -> Option<PoolOutcome> {
        let record = self.take_record(worker_id, dispatch_id)?;

        if let Some(slot) = self.workers.get_mut(worker_id) {
            slot.stats.state = WorkerState::Idle;
            slot.stats.current_task = None;
            slot.stats.tasks_failed += 1;
        }
        self.metrics.update_active_workers(self.busy_count());

        warn!(
            worker_id = worker_id,
            task_id = %record.task.id,
            attempt = record.task.attempt(),
            error = %error,
            "Task attempt failed"
        );
        Some(self.retry_or_fail(record.task, error))
    }

    /// Resolves an attempt that exceeded its timeout.
    ///
    /// The owning worker's state is unknown at this point, so it is
    /// recycled before the task enters the retry path.
    fn on_task_timeout(&mut self, task_id: &str, dispatch_id: u64) -> Option<PoolOutcome> {
        match self.active.get(task_id) {
            Some(record) if record.dispatch_id == dispatch_id => {}
            _ => {
                debug!(task_id = %task_id, dispatch_id = dispatch_id, "Ignoring stale timeout");
                return None;
            }
        }
        let record = self.active.remove(task_id)?;
        let worker_id = record.worker_id;
        let timeout = self.config.task_timeout;

        warn!(
            worker_id = worker_id,
            task_id = %task_id,
            timeout_ms = timeout.as_millis() as u64,
            "Task timed out, restarting worker"
        );

        if let Some(slot) = self.workers.get_mut(worker_id) {
            slot.stats.tasks_failed += 1;
        }
        self.metrics.record_worker_restart("timeout");
        self.restart_worker(worker_id, "task timeout");

        let error = format!("Task timed out after {}ms", timeout.as_millis());
        Some(self.retry_or_fail(record.task, error))
    }

    /// Resolves a worker whose executor panicked.
    fn on_worker_crashed(
        &mut self,
        worker_id: WorkerId,
        dispatch_id: Option<u64>,
        reason: String,
    ) -> Option<PoolOutcome> {
        error!(worker_id = worker_id, reason = %reason, "Worker crashed");

        let record = dispatch_id.and_then(|id| self.take_record(worker_id, id));
        if let Some(slot) = self.workers.get_mut(worker_id) {
            if record.is_some() {
                slot.stats.tasks_failed += 1;
            }
        }
        self.metrics.record_worker_restart("crash");
        self.restart_worker(worker_id, &format!("crashed: {}", reason));

        record.map(|record| {
            let error = format!("Worker crashed: {}", reason);
            self.retry_or_fail(record.task, error)
        })
    }

    /// Schedules a retry or reports a terminal failure.
    ///
    /// A task is retried while `retry_count < retry_attempts`; the n-th retry
    /// becomes due after `retry_backoff * n`. Once retries are exhausted the
    /// `task_failed` event is emitted, exactly once per task.
    fn retry_or_fail(&mut self, mut task: Task, error: String) -> PoolOutcome {
        if task.retry_count < self.config.retry_attempts {
            task.retry_count += 1;
            let delay = self.config.backoff_for(task.retry_count);

            info!(
                task_id = %task.id,
                retry_count = task.retry_count,
                delay_ms = delay.as_millis() as u64,
                "Scheduling task retry"
            );
            self.events.emit(SchedulerEvent::TaskRetryScheduled {
                batch_id: task.batch_id.clone(),
                task_id: task.id.clone(),
                retry_count: task.retry_count,
                delay_ms: delay.as_millis() as u64,
                error: error.clone(),
            });
            self.metrics.record_retry();

            let outcome = PoolOutcome::RetryScheduled {
                task_id: task.id.clone(),
                batch_id: task.batch_id.clone(),
                retry_count: task.retry_count,
                delay,
                error,
            };

            let task_id = task.id.clone();
            let signals = self.signals.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = signals.send(PoolSignal::RetryDue(task));
            });
            self.retry_timers.insert(task_id, timer);

            outcome
        } else {
            error!(
                task_id = %task.id,
                attempts = task.attempt(),
                error = %error,
                "Task failed permanently"
            );
            self.events.emit(SchedulerEvent::TaskFailed {
                batch_id: task.batch_id.clone(),
                task_id: task.id.clone(),
                attempts: task.attempt(),
                error: error.clone(),
            });
            self.metrics.record_task_failed();

            PoolOutcome::Failed(FailedTask {
                task_id: task.id.clone(),
                batch_id: task.batch_id.clone(),
                error,
                attempts: task.attempt(),
            })
        }
    }

    /// Terminates a worker and spawns a replacement with the same id.
    ///
    /// Termination is best-effort. Any task the old worker held is not
    /// retried here; callers route it through the failure path themselves.
    /// The replacement waits `restart_settle_delay` before reporting ready.
    pub fn restart_worker(&mut self, worker_id: WorkerId, reason: &str) {
        let Some(slot) = self.workers.get_mut(worker_id) else {
            warn!(worker_id = worker_id, "Restart requested for unknown worker");
            return;
        };
        slot.stats.restarts += 1;

        info!(worker_id = worker_id, reason = %reason, "Restarting worker");
        self.respawn(worker_id);
        self.events.emit(SchedulerEvent::WorkerRestarted {
            worker_id,
            reason: reason.to_string(),
        });
        self.metrics.update_active_workers(self.busy_count());
    }

    fn respawn(&mut self, worker_id: WorkerId) {
        let settle = self.config.restart_settle_delay;
        let Some(slot) = self.workers.get_mut(worker_id) else {
            return;
        };
        // Cancels the old incarnation; a blocked one is left to finish alone.
        slot.handle = None;
        slot.generation += 1;
        slot.stats.state = WorkerState::Restarting;
        slot.stats.current_task = None;
        slot.stats.memory_usage = 0;
        slot.stats.cpu_usage = 0.0;

        let generation = slot.generation;
        match self.spawn_worker(worker_id, generation, settle) {
            Ok((commands, handle)) => {
                if let Some(slot) = self.workers.get_mut(worker_id) {
                    slot.commands = commands;
                    slot.handle = Some(handle);
                }
            }
            Err(e) => {
                // Retried like a failed setup, after the settle delay.
                error!(worker_id = worker_id, error = %e, "Failed to spawn replacement worker thread");
                let signals = self.signals.clone();
                let error = format!("thread spawn failed: {}", e);
                tokio::spawn(async move {
                    tokio::time::sleep(settle).await;
                    let _ = signals.send(PoolSignal::Worker(WorkerReport::SetupFailed {
                        worker_id,
                        generation,
                        error,
                    }));
                });
            }
        }
    }

    /// Stops every worker and clears all pool state.
    ///
    /// Pending timeouts and retry timers are cancelled. Idle workers are
    /// asked to exit; workers still holding a task are terminated. Returns
    /// the tasks that were active or waiting out a retry.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownIncomplete` listing workers that panicked
    /// or did not stop within `shutdown_timeout`. All workers are stopped
    /// regardless.
    pub async fn shutdown(&mut self) -> Result<Vec<String>, PoolError> {
        if self.shutting_down {
            return Ok(Vec::new());
        }
        self.shutting_down = true;
        info!("Initiating worker pool shutdown");

        let mut abandoned: Vec<String> = Vec::new();
        for (task_id, record) in self.active.drain() {
            record.timeout.abort();
            abandoned.push(task_id);
        }
        for (task_id, timer) in self.retry_timers.drain() {
            timer.abort();
            abandoned.push(task_id);
        }
        abandoned.sort();

        let mut threads = Vec::new();
        for slot in &mut self.workers {
            let Some(thread) = slot.handle.take() else {
                continue;
            };
            let WorkerThread { _cancel: cancel, exited } = thread;
            // Idle workers exit on the signal; busy ones are cancelled.
            let cancel = if slot.stats.state == WorkerState::Idle {
                let _ = slot.commands.send(WorkerMessage::ShutdownSignal);
                Some(cancel)
            } else {
                None
            };
            slot.stats.state = WorkerState::Stopped;
            slot.stats.current_task = None;
            threads.push((slot.stats.id, exited, cancel));
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        let joins = threads.into_iter().map(|(worker_id, exited, cancel)| async move {
            let result = tokio::time::timeout_at(deadline, exited).await;
            drop(cancel);
            (worker_id, result)
        });

        let mut errors = Vec::new();
        for (worker_id, result) in futures::future::join_all(joins).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    error!(worker_id = worker_id, "Worker thread exited abnormally during shutdown");
                    errors.push(format!("worker {} exited abnormally", worker_id));
                }
                Err(_) => {
                    warn!(worker_id = worker_id, "Abandoning worker thread that did not stop");
                    errors.push(format!(
                        "worker {} did not stop within {:?}",
                        worker_id, self.config.shutdown_timeout
                    ));
                }
            }
        }
        self.metrics.update_active_workers(0);

        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "Abandoned unfinished tasks on shutdown");
        }

        if errors.is_empty() {
            info!("Worker pool shutdown complete");
            Ok(abandoned)
        } else {
            Err(PoolError::ShutdownIncomplete(errors))
        }
    }

    /// Load figures of every idle worker, for the load-balancing strategies.
    pub fn idle_workers(&self) -> Vec<WorkerLoad> {
        self.workers
            .iter()
            .filter(|slot| slot.stats.is_idle())
            .map(|slot| WorkerLoad {
                worker_id: slot.stats.id,
                tasks_completed: slot.stats.tasks_completed,
                memory_usage: slot.stats.memory_usage,
                cpu_usage: slot.stats.cpu_usage,
            })
            .collect()
    }

    /// Per-worker statistics ordered by worker id.
    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(|slot| slot.stats.clone()).collect()
    }

    /// Aggregate pool statistics.
    pub fn stats(&self) -> PoolStats {
        let tasks_completed: u64 = self.workers.iter().map(|s| s.stats.tasks_completed).sum();
        let average_task_duration = if tasks_completed > 0 {
            self.total_task_duration / tasks_completed as u32
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers: self.workers.len(),
            busy_workers: self.busy_count(),
            tasks_completed,
            tasks_failed: self.workers.iter().map(|s| s.stats.tasks_failed).sum(),
            restarts: self.workers.iter().map(|s| s.stats.restarts).sum(),
            average_task_duration,
        }
    }

    /// Returns whether a task is currently bound to a worker.
    pub fn is_active(&self, task_id: &str) -> bool {
        self.active.contains_key(task_id)
    }

    /// Returns whether a task is waiting out a retry backoff.
    pub fn is_retry_pending(&self, task_id: &str) -> bool {
        self.retry_timers.contains_key(task_id)
    }

    /// Number of tasks currently bound to workers.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Number of tasks waiting out a retry backoff.
    pub fn pending_retry_count(&self) -> usize {
        self.retry_timers.len()
    }

    /// Number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Memory budget of a single worker in bytes.
    pub fn memory_budget(&self) -> u64 {
        self.config.max_memory_per_worker
    }

    fn busy_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|slot| slot.stats.state == WorkerState::Busy)
            .count()
    }

    fn record_for(&self, worker_id: WorkerId, dispatch_id: u64) -> Option<&ActiveTaskRecord> {
        let task_id = self.workers.get(worker_id)?.stats.current_task.as_ref()?;
        self.active
            .get(task_id)
            .filter(|record| record.dispatch_id == dispatch_id && record.worker_id == worker_id)
    }

    /// Removes the active record of `worker_id` if it matches `dispatch_id`
    /// and cancels its timeout.
    fn take_record(&mut self, worker_id: WorkerId, dispatch_id: u64) -> Option<ActiveTaskRecord> {
        let task_id = self.record_for(worker_id, dispatch_id)?.task.id.clone();
        let record = self.active.remove(&task_id)?;
        record.timeout.abort();
        Some(record)
    }

    fn arm_timeout(&self, task_id: String, dispatch_id: u64) -> JoinHandle<()> {
        let signals = self.signals.clone();
        let timeout = self.config.task_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = signals.send(PoolSignal::TimedOut {
                task_id,
                dispatch_id,
            });
        })
    }

    /// Starts a worker incarnation on a new OS thread.
    fn spawn_worker(
        &self,
        worker_id: WorkerId,
        generation: u64,
        settle: Duration,
    ) -> std::io::Result<(mpsc::UnboundedSender<WorkerMessage>, WorkerThread)> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (cancel, cancelled) = oneshot::channel();
        let (exit, exited) = oneshot::channel();
        let worker = Worker {
            id: worker_id,
            generation,
            executor: Arc::clone(&self.executor),
            signals: self.signals.clone(),
        };

        std::thread::Builder::new()
            .name(format!("refactor-worker-{}-{}", worker_id, generation))
            .spawn(move || {
                worker.run_on_thread(receiver, settle, cancelled);
                let _ = exit.send(());
            })?;

        Ok((
            commands,
            WorkerThread {
                _cancel: cancel,
                exited,
            },
        ))
    }

    fn abort_all(&mut self) {
        for slot in &mut self.workers {
            slot.handle = None;
            slot.stats.state = WorkerState::Stopped;
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for record in self.active.values() {
            record.timeout.abort();
        }
        for timer in self.retry_timers.values() {
            timer.abort();
        }
    }
}

/// A single worker incarnation.
struct Worker {
    id: WorkerId,
    generation: u64,
    executor: Arc<dyn TaskExecutor>,
    signals: mpsc::UnboundedSender<PoolSignal>,
}

impl Worker {
    /// Runs the worker on the calling thread until it exits or is cancelled.
    fn run_on_thread(
        self,
        commands: mpsc::UnboundedReceiver<WorkerMessage>,
        settle: Duration,
        cancelled: oneshot::Receiver<()>,
    ) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                self.report(WorkerReport::SetupFailed {
                    worker_id: self.id,
                    generation: self.generation,
                    error: format!("worker runtime failed to start: {}", e),
                });
                return;
            }
        };

        let worker_id = self.id;
        runtime.block_on(async move {
            tokio::select! {
                _ = self.run(commands, settle) => {}
                _ = cancelled => debug!(worker_id = worker_id, "Worker cancelled"),
            }
        });
        // Leftover blocking work must not keep this thread alive.
        runtime.shutdown_background();
    }

    /// Main worker loop.
    ///
    /// Runs setup, reports ready, then executes assignments one at a time
    /// until a shutdown signal arrives or the executor panics.
    async fn run(self, mut commands: mpsc::UnboundedReceiver<WorkerMessage>, settle: Duration) {
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        if let Err(e) = self.executor.prepare_worker(self.id).await {
            self.report(WorkerReport::SetupFailed {
                worker_id: self.id,
                generation: self.generation,
                error: e.to_string(),
            });
            return;
        }
        self.report(WorkerReport::Ready {
            worker_id: self.id,
            generation: self.generation,
        });

        while let Some(message) = commands.recv().await {
            match message {
                WorkerMessage::TaskAssignment(assignment) => {
                    if !self.execute(assignment).await {
                        return;
                    }
                }
                WorkerMessage::ShutdownSignal => {
                    debug!(worker_id = self.id, "Worker received shutdown signal");
                    break;
                }
            }
        }

        debug!(worker_id = self.id, "Worker stopped");
    }

    /// Executes one assignment. Returns `false` when the worker must exit.
    async fn execute(&self, assignment: Assignment) -> bool {
        let Assignment { dispatch_id, task } = assignment;
        let ctx = TaskContext::new(self.id, self.generation, dispatch_id, self.signals.clone());
        let started = Instant::now();

        let result = AssertUnwindSafe(self.executor.execute(&task, &ctx))
            .catch_unwind()
            .await;
        let duration = started.elapsed();

        match result {
            Ok(Ok(output)) => {
                self.report(WorkerReport::TaskCompleted {
                    worker_id: self.id,
                    generation: self.generation,
                    dispatch_id,
                    output,
                    duration,
                });
                true
            }
            Ok(Err(e)) => {
                self.report(WorkerReport::TaskFailed {
                    worker_id: self.id,
                    generation: self.generation,
                    dispatch_id,
                    error: e.to_string(),
                });
                true
            }
            Err(panic) => {
                self.report(WorkerReport::Crashed {
                    worker_id: self.id,
                    generation: self.generation,
                    dispatch_id: Some(dispatch_id),
                    reason: panic_message(panic.as_ref()),
                });
                false
            }
        }
    }

    fn report(&self, report: WorkerReport) {
        let _ = self.signals.send(PoolSignal::Worker(report));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorError, FnExecutor};
    use crate::scheduler::task::TaskSpec;
    use async_trait::async_trait;
    use serde_json::json;

    fn config(workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig::new(workers)
            .with_task_timeout(Duration::from_secs(5))
            .with_retry_attempts(2)
            .with_retry_backoff(Duration::from_millis(10))
            .with_restart_settle_delay(Duration::from_millis(5))
            .with_spawn_timeout(Duration::from_secs(5))
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    fn task(id: &str) -> Task {
        Task::from_spec(TaskSpec::new(id), "batch")
    }

    async fn next_outcome(
        pool: &mut WorkerPool,
        rx: &mut mpsc::UnboundedReceiver<PoolSignal>,
    ) -> PoolOutcome {
        loop {
            let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("signal before timeout")
                .expect("channel open");
            if let Some(outcome) = pool.handle_signal(signal) {
                return outcome;
            }
        }
    }

    async fn next_terminal(
        pool: &mut WorkerPool,
        rx: &mut mpsc::UnboundedReceiver<PoolSignal>,
    ) -> PoolOutcome {
        loop {
            match next_outcome(pool, rx).await {
                PoolOutcome::WorkerReady(_) => continue,
                PoolOutcome::Requeue(task) => {
                    // Wait for a ready worker, then dispatch the retry.
                    let mut pending = Some(task);
                    while let Some(task) = pending.take() {
                        match pool.dispatch(task) {
                            DispatchOutcome::Committed(_) => {}
                            DispatchOutcome::Rejected(task) => {
                                pending = Some(task);
                                let _ = next_outcome(pool, rx).await;
                            }
                        }
                    }
                }
                PoolOutcome::RetryScheduled { .. } => continue,
                other => return other,
            }
        }
    }

    struct FailingSetup;

    #[async_trait]
    impl TaskExecutor for FailingSetup {
        async fn prepare_worker(&self, worker_id: WorkerId) -> Result<(), ExecutorError> {
            if worker_id == 1 {
                Err(ExecutorError::Setup("sandbox unavailable".to_string()))
            } else {
                Ok(())
            }
        }

        async fn execute(
            &self,
            _task: &Task,
            _ctx: &TaskContext,
        ) -> Result<serde_json::Value, ExecutorError> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.max_workers, 4);
        assert_eq!(config.task_timeout, Duration::from_secs(300));
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_is_linear() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.backoff_for(1), Duration::from_millis(1000));
        assert_eq!(config.backoff_for(2), Duration::from_millis(2000));
        assert_eq!(config.backoff_for(3), Duration::from_millis(3000));
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            busy_workers: 2,
            tasks_completed: 80,
            tasks_failed: 20,
            restarts: 1,
            average_task_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::WorkerInitFailed {
            worker_id: 3,
            reason: "no sandbox".to_string(),
        };
        assert!(err.to_string().contains("Worker 3"));
        assert!(err.to_string().contains("no sandbox"));

        let err = PoolError::ShutdownIncomplete(vec!["a".to_string(), "b".to_string()]);
        assert!(err.to_string().contains("a; b"));
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_initialize_all_workers_idle() {
        let executor = Arc::new(FnExecutor::new(|_task: Task| async { Ok(json!({})) }));
        let (mut pool, _rx) = WorkerPool::initialize(config(3), executor, EventBus::default())
            .await
            .expect("pool starts");

        assert_eq!(pool.num_workers(), 3);
        assert_eq!(pool.idle_workers().len(), 3);
        assert!(pool
            .worker_stats()
            .iter()
            .all(|stats| stats.state == WorkerState::Idle));

        pool.shutdown().await.expect("clean shutdown");
        assert!(pool
            .worker_stats()
            .iter()
            .all(|stats| stats.state == WorkerState::Stopped));
    }

    #[tokio::test]
    async fn test_initialize_fails_when_worker_setup_fails() {
        let result =
            WorkerPool::initialize(config(3), Arc::new(FailingSetup), EventBus::default()).await;

        match result {
            Err(PoolError::WorkerInitFailed { worker_id, reason }) => {
                assert_eq!(worker_id, 1);
                assert!(reason.contains("sandbox unavailable"));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("pool must not start"),
        }
    }

    #[tokio::test]
    async fn test_initialize_rejects_zero_workers() {
        let executor = Arc::new(FnExecutor::new(|_task: Task| async { Ok(json!({})) }));
        let result = WorkerPool::initialize(config(0), executor, EventBus::default()).await;
        assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_dispatch_and_complete() {
        let executor = Arc::new(FnExecutor::new(|task: Task| async move {
            Ok(json!({ "echo": task.id }))
        }));
        let events = EventBus::default();
        let mut subscriber = events.subscribe();
        let (mut pool, mut rx) = WorkerPool::initialize(config(1), executor, events)
            .await
            .expect("pool starts");

        assert!(matches!(
            pool.dispatch(task("t-1")),
            DispatchOutcome::Committed(0)
        ));
        assert!(pool.is_active("t-1"));
        // The only worker is busy now.
        assert!(matches!(
            pool.dispatch(task("t-2")),
            DispatchOutcome::Rejected(_)
        ));

        match next_outcome(&mut pool, &mut rx).await {
            PoolOutcome::Completed(done) => {
                assert_eq!(done.task_id, "t-1");
                assert_eq!(done.output["echo"], json!("t-1"));
                assert_eq!(done.attempts, 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert!(!pool.is_active("t-1"));
        assert_eq!(pool.idle_workers().len(), 1);
        assert_eq!(pool.stats().tasks_completed, 1);

        let started = subscriber.try_recv().expect("task_started emitted");
        assert_eq!(started.kind(), "task_started");
        let completed = subscriber.try_recv().expect("task_completed emitted");
        assert_eq!(completed.kind(), "task_completed");

        pool.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn test_dispatch_same_task_twice_rejected() {
        let executor = Arc::new(FnExecutor::new(|_task: Task| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!({}))
        }));
        let (mut pool, _rx) = WorkerPool::initialize(config(2), executor, EventBus::default())
            .await
            .expect("pool starts");

        assert!(matches!(
            pool.dispatch_to(task("dup"), 0),
            DispatchOutcome::Committed(0)
        ));
        assert!(matches!(
            pool.dispatch_to(task("dup"), 1),
            DispatchOutcome::Rejected(_)
        ));
        assert_eq!(pool.active_count(), 1);

        pool.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn test_failure_retries_then_fails_once() {
        let executor = Arc::new(FnExecutor::new(|_task: Task| async {
            Err(ExecutorError::Failed("always broken".to_string()))
        }));
        let events = EventBus::default();
        let mut subscriber = events.subscribe();
        let (mut pool, mut rx) = WorkerPool::initialize(config(1), executor, events)
            .await
            .expect("pool starts");

        assert!(matches!(
            pool.dispatch(task("flaky")),
            DispatchOutcome::Committed(_)
        ));

        match next_terminal(&mut pool, &mut rx).await {
            PoolOutcome::Failed(failed) => {
                assert_eq!(failed.task_id, "flaky");
                assert_eq!(failed.attempts, 3);
                assert!(failed.error.contains("always broken"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let mut started = 0;
        let mut retries = 0;
        let mut failures = 0;
        while let Ok(event) = subscriber.try_recv() {
            match event.kind() {
                "task_started" => started += 1,
                "task_retry_scheduled" => retries += 1,
                "task_failed" => failures += 1,
                _ => {}
            }
        }
        assert_eq!(started, 3);
        assert_eq!(retries, 2);
        assert_eq!(failures, 1);

        pool.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn test_timeout_restarts_worker() {
        let executor = Arc::new(FnExecutor::new(|_task: Task| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!({}))
        }));
        let pool_config = config(1)
            .with_task_timeout(Duration::from_millis(50))
            .with_retry_attempts(0);
        let (mut pool, mut rx) = WorkerPool::initialize(pool_config, executor, EventBus::default())
            .await
            .expect("pool starts");

        assert!(matches!(
            pool.dispatch(task("slow")),
            DispatchOutcome::Committed(_)
        ));

        match next_outcome(&mut pool, &mut rx).await {
            PoolOutcome::Failed(failed) => {
                assert_eq!(failed.attempts, 1);
                assert!(failed.error.contains("timed out"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let stats = pool.worker_stats();
        assert_eq!(stats[0].restarts, 1);
        assert_eq!(stats[0].state, WorkerState::Restarting);

        // The replacement reports ready after the settle delay.
        assert!(matches!(
            next_outcome(&mut pool, &mut rx).await,
            PoolOutcome::WorkerReady(0)
        ));

        pool.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn test_blocking_executor_times_out_and_late_result_is_dropped() {
        let executor = Arc::new(FnExecutor::new(|_task: Task| async {
            std::thread::sleep(Duration::from_millis(600));
            Ok(json!({"late": true}))
        }));
        let pool_config = config(1)
            .with_task_timeout(Duration::from_millis(100))
            .with_retry_attempts(0);
        let (mut pool, mut rx) = WorkerPool::initialize(pool_config, executor, EventBus::default())
            .await
            .expect("pool starts");

        let started = Instant::now();
        assert!(matches!(
            pool.dispatch(task("blocking")),
            DispatchOutcome::Committed(_)
        ));

        match next_outcome(&mut pool, &mut rx).await {
            PoolOutcome::Failed(failed) => {
                assert!(failed.error.contains("timed out"));
                assert!(started.elapsed() < Duration::from_millis(500));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(matches!(
            next_outcome(&mut pool, &mut rx).await,
            PoolOutcome::WorkerReady(0)
        ));

        // The abandoned thread reports once its sleep ends; that report is stale.
        tokio::time::sleep(Duration::from_millis(800)).await;
        while let Ok(signal) = rx.try_recv() {
            assert!(pool.handle_signal(signal).is_none());
        }
        assert_eq!(pool.stats().tasks_completed, 0);
        assert_eq!(pool.stats().tasks_failed, 1);
        assert_eq!(pool.worker_stats()[0].state, WorkerState::Idle);

        pool.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn test_panic_is_treated_as_crash() {
        let executor = Arc::new(FnExecutor::new(|task: Task| async move {
            if task.retry_count == 0 {
                panic!("executor exploded");
            }
            Ok(json!({"recovered": true}))
        }));
        let (mut pool, mut rx) = WorkerPool::initialize(config(1), executor, EventBus::default())
            .await
            .expect("pool starts");

        assert!(matches!(
            pool.dispatch(task("fragile")),
            DispatchOutcome::Committed(_)
        ));

        match next_outcome(&mut pool, &mut rx).await {
            PoolOutcome::RetryScheduled {
                retry_count, error, ..
            } => {
                assert_eq!(retry_count, 1);
                assert!(error.contains("executor exploded"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(pool.worker_stats()[0].restarts, 1);

        match next_terminal(&mut pool, &mut rx).await {
            PoolOutcome::Completed(done) => {
                assert_eq!(done.attempts, 2);
                assert_eq!(done.output["recovered"], json!(true));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        pool.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn test_shutdown_returns_abandoned_tasks() {
        let executor = Arc::new(FnExecutor::new(|_task: Task| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!({}))
        }));
        let (mut pool, _rx) = WorkerPool::initialize(config(2), executor, EventBus::default())
            .await
            .expect("pool starts");

        assert!(matches!(
            pool.dispatch(task("a")),
            DispatchOutcome::Committed(_)
        ));

        let abandoned = pool.shutdown().await.expect("clean shutdown");
        assert_eq!(abandoned, vec!["a".to_string()]);
        assert_eq!(pool.active_count(), 0);
        assert!(matches!(
            pool.dispatch(task("late")),
            DispatchOutcome::Rejected(_)
        ));
    }
}

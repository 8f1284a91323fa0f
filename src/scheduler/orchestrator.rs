//! The scheduling control loop.
//!
//! One spawned task owns every piece of mutable scheduling state: the
//! pending queue, the worker pool, the progress tracker, the result
//! aggregator and the resource monitor. It reacts to four inputs:
//!
//! - commands from [`BatchProcessingSystem`](crate::system::BatchProcessingSystem)
//! - pool signals (worker reports, timeouts, due retries)
//! - the scheduling tick, while tasks are queued
//! - the monitoring tick
//!
//! Since only this task mutates state, each input is applied as one atomic
//! step and no observer sees a half-applied transition.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::aggregate::{ConflictResolutionStrategy, ResultAggregator};
use crate::config::BatchConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::EventBus;
use crate::executor::TaskExecutor;
use crate::metrics::MetricsCollector;
use crate::monitor::{MetricsSource, ResourceMonitor, SchedulerLoad};
use crate::progress::{BatchProgress, ProgressTracker, TaskStatus};
use crate::system::{BatchReport, SystemStatus};

use super::queue::PendingQueue;
use super::strategy::LoadBalancingStrategy;
use super::task::Task;
use super::worker_pool::{DispatchOutcome, PoolOutcome, PoolSignal, WorkerPool};

/// Resolves once a batch reaches a terminal state or the system shuts down.
pub(crate) type BatchCompletion = oneshot::Sender<SchedulerResult<BatchReport>>;

/// A batch handed to the control loop.
pub(crate) struct Submission {
    pub batch_id: String,
    pub tasks: Vec<Task>,
    pub conflict_resolution: Option<ConflictResolutionStrategy>,
    pub completion: BatchCompletion,
}

/// Requests from the facade to the control loop.
pub(crate) enum Command {
    Submit {
        submission: Submission,
        reply: oneshot::Sender<SchedulerResult<()>>,
    },
    Status {
        reply: oneshot::Sender<SystemStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<SchedulerResult<Vec<String>>>,
    },
}

/// Owner of all scheduling state. Runs inside [`Orchestrator::spawn`].
pub(crate) struct Orchestrator {
    config: BatchConfig,
    strategy: LoadBalancingStrategy,
    queue: PendingQueue,
    pool: WorkerPool,
    signals: mpsc::UnboundedReceiver<PoolSignal>,
    tracker: ProgressTracker,
    aggregator: ResultAggregator,
    monitor: Option<ResourceMonitor>,
    waiters: HashMap<String, BatchCompletion>,
    metrics: MetricsCollector,
}

impl Orchestrator {
    /// Initializes the worker pool and starts the control loop.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Pool` if the pool cannot be initialized. No
    /// worker is left running in that case.
    pub(crate) async fn spawn(
        config: BatchConfig,
        executor: Arc<dyn TaskExecutor>,
        source: Box<dyn MetricsSource>,
        events: EventBus,
    ) -> SchedulerResult<(mpsc::UnboundedSender<Command>, JoinHandle<()>)> {
        let (pool, signals) =
            WorkerPool::initialize(config.pool_config(), executor, events.clone()).await?;

        let monitor = config
            .monitor_enabled
            .then(|| ResourceMonitor::new(config.monitor_config(), source, events.clone()));

        let orchestrator = Self {
            strategy: config.load_balancing,
            queue: PendingQueue::new(),
            pool,
            signals,
            tracker: ProgressTracker::new(events, config.eta_window),
            aggregator: ResultAggregator::new(config.conflict_resolution),
            monitor,
            waiters: HashMap::new(),
            metrics: MetricsCollector::new(),
            config,
        };

        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(orchestrator.run(receiver));
        Ok((commands, handle))
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut schedule_tick = tokio::time::interval(self.config.schedule_interval);
        schedule_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Unchecked when monitoring is off; interval() rejects a zero period.
        let monitor_period = self.config.monitor_interval.max(Duration::from_millis(1));
        let mut monitor_tick = tokio::time::interval(monitor_period);
        monitor_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            strategy = %self.strategy,
            workers = self.pool.num_workers(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        let result = self.shutdown().await;
                        let _ = reply.send(result);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All system handles dropped, stopping scheduler");
                        if let Err(e) = self.shutdown().await {
                            error!(error = %e, "Shutdown after handle drop was incomplete");
                        }
                        break;
                    }
                },
                Some(signal) = self.signals.recv() => self.handle_signal(signal),
                _ = schedule_tick.tick(), if !self.queue.is_empty() => self.schedule(),
                _ = monitor_tick.tick(), if self.monitor.is_some() => self.sample_resources().await,
            }
        }

        info!("Scheduler stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { submission, reply } => {
                let result = self.submit(submission);
                if let Err(e) = &result {
                    warn!(error = %e, "Batch rejected");
                }
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            // Handled by the loop itself.
            Command::Shutdown { .. } => {}
        }
    }

    /// Registers and queues a batch.
    ///
    /// Rejected without side effects when the batch id is in use or any task
    /// id is duplicated within the batch or already queued, running or
    /// waiting for a retry.
    fn submit(&mut self, submission: Submission) -> SchedulerResult<()> {
        let Submission {
            batch_id,
            tasks,
            conflict_resolution,
            completion,
        } = submission;

        if self.waiters.contains_key(&batch_id) || self.tracker.batch(&batch_id).is_some() {
            return Err(SchedulerError::DuplicateBatch(batch_id));
        }
        let mut seen = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if !seen.insert(task.id.as_str())
                || self.queue.contains(&task.id)
                || self.pool.is_active(&task.id)
                || self.pool.is_retry_pending(&task.id)
            {
                return Err(SchedulerError::DuplicateTask(task.id.clone()));
            }
        }

        let completed = self
            .tracker
            .register_batch(&batch_id, tasks.iter().map(|task| task.id.clone()))?;
        self.aggregator.begin_batch(&batch_id, conflict_resolution);
        self.waiters.insert(batch_id.clone(), completion);

        info!(batch_id = %batch_id, tasks = tasks.len(), "Batch submitted");

        if let Some(progress) = completed {
            self.finish_batch(progress);
            return Ok(());
        }

        self.queue.enqueue_batch(tasks);
        self.schedule();
        Ok(())
    }

    /// Matches queued tasks to idle workers until either runs out.
    fn schedule(&mut self) {
        let mut idle = self.pool.idle_workers();
        let budget = self.pool.memory_budget();

        while !idle.is_empty() {
            let Some(task) = self.queue.pop() else {
                break;
            };
            let Some(worker_id) = self.strategy.select(&idle, &task, budget) else {
                self.queue.requeue_front(task);
                break;
            };

            let task_id = task.id.clone();
            let batch_id = task.batch_id.clone();
            match self.pool.dispatch_to(task, worker_id) {
                DispatchOutcome::Committed(worker_id) => {
                    idle.retain(|worker| worker.worker_id != worker_id);
                    self.update_status(&batch_id, &task_id, TaskStatus::Active);
                }
                DispatchOutcome::Rejected(task) => {
                    debug!(worker_id = worker_id, task_id = %task_id, "Dispatch rejected");
                    idle.retain(|worker| worker.worker_id != worker_id);
                    self.queue.requeue_front(task);
                }
            }
        }

        self.metrics.update_queue_depth(self.queue.len());
    }

    fn handle_signal(&mut self, signal: PoolSignal) {
        let Some(outcome) = self.pool.handle_signal(signal) else {
            return;
        };

        match outcome {
            PoolOutcome::WorkerReady(_) => self.schedule(),
            PoolOutcome::Completed(completed) => {
                let batch_id = completed.batch_id.clone();
                let task_id = completed.task_id.clone();
                self.aggregator.record_completed(completed);
                self.update_status(&batch_id, &task_id, TaskStatus::Completed);
                self.schedule();
            }
            PoolOutcome::RetryScheduled {
                task_id, batch_id, ..
            } => {
                self.update_status(&batch_id, &task_id, TaskStatus::Queued);
                self.schedule();
            }
            PoolOutcome::Failed(failed) => {
                let batch_id = failed.batch_id.clone();
                let task_id = failed.task_id.clone();
                self.aggregator.record_failed(failed);
                self.update_status(&batch_id, &task_id, TaskStatus::Failed);
                self.schedule();
            }
            PoolOutcome::Requeue(task) => {
                self.queue.requeue_front(task);
                self.schedule();
            }
        }
    }

    fn update_status(&mut self, batch_id: &str, task_id: &str, status: TaskStatus) {
        match self.tracker.update_task_status(batch_id, task_id, status) {
            Ok(Some(progress)) => self.finish_batch(progress),
            Ok(None) => {}
            Err(e) => error!(error = %e, "Progress update rejected"),
        }
    }

    /// Builds the report of a terminal batch and resolves its waiter.
    fn finish_batch(&mut self, progress: BatchProgress) {
        let aggregate = self
            .aggregator
            .finish_batch(&progress.batch_id)
            .unwrap_or_default();
        self.tracker.remove_batch(&progress.batch_id);

        info!(
            batch_id = %progress.batch_id,
            status = %progress.status,
            completed = progress.completed_tasks,
            failed = progress.failed_tasks,
            "Batch finished"
        );

        let batch_id = progress.batch_id.clone();
        let report = BatchReport::new(progress, aggregate);
        if let Some(waiter) = self.waiters.remove(&batch_id) {
            let _ = waiter.send(Ok(report));
        }
    }

    async fn sample_resources(&mut self) {
        let load = SchedulerLoad {
            worker_count: self.pool.num_workers(),
            active_workers: self.pool.active_count(),
            queue_length: self.queue.len(),
            throughput: self.tracker.throughput(),
        };
        if let Some(monitor) = self.monitor.as_mut() {
            let report = monitor.sample(load).await;
            if report.recommendations_changed
                && report.recommendations.worker_count != load.worker_count
            {
                // Advisory only; the pool keeps its configured size.
                info!(
                    current = load.worker_count,
                    recommended = report.recommendations.worker_count,
                    "Worker count recommendation differs from pool size"
                );
            }
        }
    }

    fn status(&self) -> SystemStatus {
        SystemStatus {
            queue_length: self.queue.len(),
            active_tasks: self.pool.active_count(),
            pending_retries: self.pool.pending_retry_count(),
            workers: self.pool.worker_stats(),
            pool: self.pool.stats(),
            batches: self.tracker.batches(),
            progress: self.tracker.global(),
            resources: self
                .monitor
                .as_ref()
                .and_then(|monitor| monitor.latest().cloned()),
            recommendations: self
                .monitor
                .as_ref()
                .and_then(|monitor| monitor.recommendations().cloned()),
            aggregate: self.aggregator.summary(),
        }
    }

    /// Stops the pool and fails every outstanding batch with
    /// `SchedulerError::ShutDown`. Returns the ids of unfinished tasks.
    async fn shutdown(&mut self) -> SchedulerResult<Vec<String>> {
        info!(
            queued = self.queue.len(),
            active = self.pool.active_count(),
            "Shutting down scheduler"
        );

        let queued: Vec<String> = self.queue.drain().into_iter().map(|task| task.id).collect();
        let result = self.pool.shutdown().await;

        for (batch_id, waiter) in self.waiters.drain() {
            debug!(batch_id = %batch_id, "Cancelling batch");
            let _ = waiter.send(Err(SchedulerError::ShutDown));
        }
        self.metrics.update_queue_depth(0);

        let mut abandoned = result?;
        abandoned.extend(queued);
        abandoned.sort();
        Ok(abandoned)
    }
}

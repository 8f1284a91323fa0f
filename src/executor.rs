//! Task execution capability consumed by the worker pool.
//!
//! The scheduler never looks inside a task: each worker hands the task to a
//! [`TaskExecutor`] and reports whatever comes back. Two executors ship with
//! the crate:
//!
//! - [`FnExecutor`]: wraps an async closure, handy for embedding and tests
//! - [`CommandExecutor`]: runs the payload's command as a child process

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sysinfo::{Pid, System};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::scheduler::message::{WorkerId, WorkerReport};
use crate::scheduler::task::Task;
use crate::scheduler::worker_pool::PoolSignal;

/// Errors returned by a task executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The task ran and failed.
    #[error("Task failed: {0}")]
    Failed(String),

    /// Worker setup failed before any task could run.
    #[error("Worker setup failed: {0}")]
    Setup(String),

    /// The payload did not describe a runnable task.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// A child process exited unsuccessfully.
    #[error("Command exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    /// IO error while running the task.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability that performs the actual work of a task.
///
/// Implementations must be shareable across workers; each worker calls
/// `execute` for at most one task at a time.
///
/// Every worker runs on its own thread with a single-threaded runtime, so
/// blocking inside `execute` stalls only that worker. A blocked attempt
/// cannot be interrupted: once its timeout fires the attempt is failed, the
/// worker is replaced, and whatever the abandoned call returns later is
/// discarded.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    /// Prepares a freshly spawned worker before it accepts tasks.
    ///
    /// An error here means the worker could not be brought up. During pool
    /// initialization this is fatal; during a restart the pool tries again.
    async fn prepare_worker(&self, _worker_id: WorkerId) -> Result<(), ExecutorError> {
        Ok(())
    }

    /// Executes a task and returns its opaque result payload.
    async fn execute(
        &self,
        task: &Task,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, ExecutorError>;
}

/// Per-dispatch handle given to an executor for reporting back to the pool.
#[derive(Debug, Clone)]
pub struct TaskContext {
    worker_id: WorkerId,
    generation: u64,
    dispatch_id: u64,
    signals: mpsc::UnboundedSender<PoolSignal>,
}

impl TaskContext {
    pub(crate) fn new(
        worker_id: WorkerId,
        generation: u64,
        dispatch_id: u64,
        signals: mpsc::UnboundedSender<PoolSignal>,
    ) -> Self {
        Self {
            worker_id,
            generation,
            dispatch_id,
            signals,
        }
    }

    /// Returns the ID of the worker running the task.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Reports intermediate progress of the task (0-100).
    pub fn report_progress(&self, percent: f64, message: Option<&str>) {
        let _ = self
            .signals
            .send(PoolSignal::Worker(WorkerReport::ProgressUpdate {
                worker_id: self.worker_id,
                generation: self.generation,
                dispatch_id: self.dispatch_id,
                percent: percent.clamp(0.0, 100.0),
                message: message.map(str::to_string),
            }));
    }

    /// Reports current resource usage of the work done on this worker.
    pub fn report_resources(&self, memory_bytes: u64, cpu_percent: f64) {
        let _ = self
            .signals
            .send(PoolSignal::Worker(WorkerReport::ResourceReport {
                worker_id: self.worker_id,
                generation: self.generation,
                memory_bytes,
                cpu_percent,
            }));
    }
}

/// Executor backed by an async closure.
pub struct FnExecutor<F> {
    func: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ExecutorError>> + Send + 'static,
{
    /// Wraps a closure receiving an owned copy of each task.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ExecutorError>> + Send + 'static,
{
    async fn execute(
        &self,
        task: &Task,
        _ctx: &TaskContext,
    ) -> Result<serde_json::Value, ExecutorError> {
        (self.func)(task.clone()).await
    }
}

/// Payload understood by [`CommandExecutor`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandPayload {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Executor that runs `payload.command` as a child process.
///
/// The payload shape is `{"command": "...", "args": [...], "cwd": "...", "env": {...}}`.
/// The result is `{"exitCode", "stdout", "stderr"}`; if stdout is a JSON
/// object its fields are merged into the result, so external tools can
/// report analysis fields such as `performanceComparison`.
///
/// The child is killed when the worker running it is terminated.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    default_cwd: Option<PathBuf>,
    sample_interval: Duration,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self {
            default_cwd: None,
            sample_interval: Duration::from_millis(500),
        }
    }
}

impl CommandExecutor {
    /// Creates a command executor with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the working directory used when the payload has none.
    pub fn with_default_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.default_cwd = Some(cwd.into());
        self
    }

    /// Sets how often child resource usage is sampled.
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    fn build_result(stdout: &str, stderr: &str, code: i32) -> serde_json::Value {
        let mut result = serde_json::Map::new();
        if let Ok(serde_json::Value::Object(reported)) =
            serde_json::from_str::<serde_json::Value>(stdout.trim())
        {
            result.extend(reported);
        }
        result.insert("exitCode".to_string(), serde_json::json!(code));
        result.insert("stdout".to_string(), serde_json::json!(stdout));
        result.insert("stderr".to_string(), serde_json::json!(stderr));
        serde_json::Value::Object(result)
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(
        &self,
        task: &Task,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, ExecutorError> {
        let payload: CommandPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| ExecutorError::InvalidPayload(e.to_string()))?;

        let mut command = tokio::process::Command::new(&payload.command);
        command
            .args(&payload.args)
            .envs(&payload.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = payload.cwd.as_ref().or(self.default_cwd.as_ref()) {
            command.current_dir(cwd);
        }

        debug!(
            task_id = %task.id,
            worker_id = ctx.worker_id(),
            command = %payload.command,
            "Spawning task command"
        );

        let child = command.spawn()?;
        let pid = child.id();
        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let mut system = System::new();
        let mut ticker = tokio::time::interval(self.sample_interval);
        let output = loop {
            tokio::select! {
                output = &mut wait => break output?,
                _ = ticker.tick() => {
                    if let Some(pid) = pid.map(Pid::from_u32) {
                        if system.refresh_process(pid) {
                            if let Some(process) = system.process(pid) {
                                trace!(task_id = %task.id, memory = process.memory(), "Sampled task process");
                                ctx.report_resources(process.memory(), process.cpu_usage() as f64);
                            }
                        }
                    }
                }
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            return Err(ExecutorError::NonZeroExit {
                code,
                stderr: stderr.trim().to_string(),
            });
        }

        ctx.report_progress(100.0, None);
        Ok(Self::build_result(&stdout, &stderr, code))
    }
}

//! CLI command definitions for refactor-forge.
//!
//! `run` executes a task file through the batch scheduler using
//! [`CommandExecutor`]; `plan` prints resource recommendations for the
//! local machine.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::aggregate::ConflictResolutionStrategy;
use crate::config::BatchConfig;
use crate::events::EventBus;
use crate::executor::CommandExecutor;
use crate::metrics::{export_metrics, init_metrics};
use crate::monitor::{ResourceMonitor, SchedulerLoad, SystemMetricsSource};
use crate::scheduler::strategy::LoadBalancingStrategy;
use crate::scheduler::task::TaskSpec;
use crate::system::{BatchOptions, BatchProcessingSystem, BatchReport};

/// Batch scheduler for long-running refactoring tasks.
#[derive(Parser)]
#[command(name = "refactor-forge")]
#[command(about = "Run batches of refactoring tasks across a worker pool")]
#[command(version)]
#[command(
    long_about = "refactor-forge schedules batches of independent, long-running tasks across a fixed worker pool with timeouts, retries, resource monitoring and conflict detection.\n\nExample usage:\n  refactor-forge run --tasks tasks.yaml --max-workers 4 --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a task file through the scheduler.
    Run(RunArgs),

    /// Print resource-based scheduling recommendations for this machine.
    Plan(PlanArgs),
}

/// Arguments for `refactor-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// JSON or YAML file holding a list of tasks (or `{"tasks": [...]}`).
    #[arg(short, long)]
    pub tasks: PathBuf,

    /// Batch id (default: random UUID).
    #[arg(long)]
    pub batch_id: Option<String>,

    /// Number of workers.
    #[arg(short = 'w', long, env = "BATCH_MAX_WORKERS")]
    pub max_workers: Option<usize>,

    /// Per-task timeout in milliseconds.
    #[arg(long, env = "BATCH_TASK_TIMEOUT_MS")]
    pub task_timeout_ms: Option<u64>,

    /// Retries per task after the first attempt.
    #[arg(long, env = "BATCH_RETRY_ATTEMPTS")]
    pub retry_attempts: Option<u32>,

    /// Load-balancing strategy (round-robin, least-loaded, memory-optimized, adaptive).
    #[arg(long, env = "BATCH_LOAD_BALANCING")]
    pub load_balancing: Option<LoadBalancingStrategy>,

    /// Conflict resolution strategy (latest_wins, manual_review, automatic_rollback, quality_threshold).
    #[arg(long, env = "BATCH_CONFLICT_RESOLUTION")]
    pub conflict_resolution: Option<ConflictResolutionStrategy>,

    /// Working directory for task commands without their own `cwd`.
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Disable periodic resource monitoring.
    #[arg(long)]
    pub no_monitor: bool,

    /// Print scheduler events to stderr as JSON lines.
    #[arg(long)]
    pub events: bool,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,

    /// Output the full batch report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `refactor-forge plan`.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Number of samples to take; CPU usage needs at least two.
    #[arg(long, default_value = "2")]
    pub samples: usize,

    /// Delay between samples in milliseconds.
    #[arg(long, default_value = "1000")]
    pub interval_ms: u64,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Task file contents: a bare list or an object with a `tasks` field.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TaskFile {
    List(Vec<TaskSpec>),
    Wrapped { tasks: Vec<TaskSpec> },
}

impl TaskFile {
    fn into_tasks(self) -> Vec<TaskSpec> {
        match self {
            TaskFile::List(tasks) | TaskFile::Wrapped { tasks } => tasks,
        }
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_batch_command(args).await,
        Commands::Plan(args) => run_plan_command(args).await,
    }
}

/// Builds the scheduler configuration: environment first, then flags.
fn build_config(args: &RunArgs) -> anyhow::Result<BatchConfig> {
    let mut config = BatchConfig::from_env()?;

    if let Some(workers) = args.max_workers {
        config = config.with_max_workers(workers);
    }
    if let Some(ms) = args.task_timeout_ms {
        config = config.with_task_timeout(Duration::from_millis(ms));
    }
    if let Some(retries) = args.retry_attempts {
        config = config.with_retry_attempts(retries);
    }
    if let Some(strategy) = args.load_balancing {
        config = config.with_load_balancing(strategy);
    }
    if let Some(strategy) = args.conflict_resolution {
        config = config.with_conflict_resolution(strategy);
    }
    if args.no_monitor {
        config = config.with_monitor(false);
    }

    config.validate()?;
    Ok(config)
}

/// Loads task specs from a JSON or YAML file, chosen by extension.
fn load_tasks(path: &Path) -> anyhow::Result<Vec<TaskSpec>> {
    let content = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;

    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );
    let file: TaskFile = if is_yaml {
        serde_yaml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse task YAML: {}", e))?
    } else {
        serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse task JSON: {}", e))?
    };

    Ok(file.into_tasks())
}

async fn run_batch_command(args: RunArgs) -> anyhow::Result<()> {
    let config = build_config(&args)?;
    let tasks = load_tasks(&args.tasks)?;
    if tasks.is_empty() {
        warn!(path = %args.tasks.display(), "Task file contains no tasks");
    }

    if args.metrics {
        init_metrics().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;
    }

    let mut executor = CommandExecutor::new();
    if let Some(cwd) = &args.cwd {
        executor = executor.with_default_cwd(cwd.clone());
    }

    info!(
        tasks = tasks.len(),
        max_workers = config.max_workers,
        "Starting batch run"
    );
    let system = BatchProcessingSystem::start(config, Arc::new(executor)).await?;

    let event_printer = args.events.then(|| {
        let mut stream = system.event_stream();
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => eprintln!("{}", line),
                        Err(e) => warn!(error = %e, "Failed to serialize event"),
                    },
                    Err(e) => warn!(error = %e, "Event stream lagged"),
                }
            }
        })
    });

    let mut options = BatchOptions::new();
    if let Some(batch_id) = &args.batch_id {
        options = options.with_batch_id(batch_id.clone());
    }

    let outcome = system.process_batch(tasks, options).await;
    let shutdown = system.shutdown().await;
    if let Some(printer) = event_printer {
        printer.abort();
    }

    let report = outcome?;
    if let Err(e) = shutdown {
        warn!(error = %e, "Shutdown was incomplete");
    }

    if args.json {
        let json_output = serde_json::to_string_pretty(&report)
            .map_err(|e| anyhow::anyhow!("Failed to serialize batch report: {}", e))?;
        println!("{}", json_output);
    } else {
        print_summary(&report);
    }

    if args.metrics {
        println!("{}", export_metrics());
    }

    Ok(())
}

fn print_summary(report: &BatchReport) {
    println!("Batch {}: {}", report.batch_id, report.status);
    println!(
        "  {} tasks, {} completed, {} failed in {:.1}s",
        report.total,
        report.completed,
        report.failed,
        report.duration.as_secs_f64()
    );

    for failure in &report.failures {
        println!(
            "  FAILED {} after {} attempts: {}",
            failure.task_id, failure.attempts, failure.error
        );
    }

    if !report.conflicts.is_empty() {
        println!("  Conflicts ({}):", report.conflicts.len());
        for conflict in &report.conflicts {
            println!(
                "    [{}] {} {}: {}",
                conflict.severity, conflict.task_id, conflict.conflict_type, conflict.details
            );
        }
    }
}

async fn run_plan_command(args: PlanArgs) -> anyhow::Result<()> {
    let config = BatchConfig::from_env()?;
    let mut monitor = ResourceMonitor::new(
        config.monitor_config(),
        Box::new(SystemMetricsSource::new()),
        EventBus::default(),
    );
    let load = SchedulerLoad {
        worker_count: config.max_workers,
        ..Default::default()
    };

    let mut report = monitor.sample(load).await;
    for _ in 1..args.samples.max(1) {
        tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        report = monitor.sample(load).await;
    }

    if args.json {
        let output = serde_json::json!({
            "snapshot": report.snapshot,
            "alerts": report.alerts,
            "recommendations": report.recommendations,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let snapshot = &report.snapshot;
    let rec = &report.recommendations;
    println!(
        "CPU {:.1}%  memory {:.1}%  load {:.2}",
        snapshot.cpu_usage, snapshot.memory_usage, snapshot.load_average
    );
    println!("Recommended workers:           {}", rec.worker_count);
    println!(
        "Recommended memory per worker: {} MiB",
        rec.memory_per_worker / (1024 * 1024)
    );
    println!("Recommended batch size:        {}", rec.batch_size);
    for reason in &rec.reasons {
        println!("  - {}", reason);
    }
    for alert in &report.alerts {
        println!("ALERT [{}] {}", alert.severity, alert.message);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_tasks_json_list() {
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .expect("temp file");
        write!(
            file,
            r#"[{{"id": "a", "priority": "high", "payload": {{"command": "true"}}}}, {{"id": "b"}}]"#
        )
        .expect("write");

        let tasks = load_tasks(file.path()).expect("valid tasks");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "a");
        assert_eq!(tasks[0].priority, crate::scheduler::task::Priority::High);
    }

    #[test]
    fn test_load_tasks_yaml_wrapped() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("temp file");
        writeln!(
            file,
            "tasks:\n  - id: x\n    priority: low\n    estimatedComplexity: 7\n    payload:\n      command: echo\n      args: [hi]"
        )
        .expect("write");

        let tasks = load_tasks(file.path()).expect("valid tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].estimated_complexity, Some(7.0));
    }

    #[test]
    fn test_load_tasks_invalid() {
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .expect("temp file");
        write!(file, "not json").expect("write");
        assert!(load_tasks(file.path()).is_err());
        assert!(load_tasks(Path::new("/nonexistent/tasks.json")).is_err());
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "refactor-forge",
            "run",
            "--tasks",
            "tasks.json",
            "--max-workers",
            "3",
            "--load-balancing",
            "least-loaded",
            "--conflict-resolution",
            "manual_review",
        ])
        .expect("valid arguments");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.max_workers, Some(3));
                assert_eq!(args.load_balancing, Some(LoadBalancingStrategy::LeastLoaded));
                assert_eq!(
                    args.conflict_resolution,
                    Some(ConflictResolutionStrategy::ManualReview)
                );
            }
            Commands::Plan(_) => panic!("expected run"),
        }
    }
}

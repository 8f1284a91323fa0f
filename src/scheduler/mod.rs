//! Parallel task scheduling core.
//!
//! - **task**: task specs, enriched tasks and their results
//! - **message**: the closed worker protocol
//! - **queue**: priority and complexity ordered pending queue
//! - **strategy**: load-balancing policies choosing an idle worker
//! - **worker_pool**: workers, timeouts, retries and restarts
//! - **orchestrator**: the control loop tying them together
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────┐
//!   commands ───▶ │     Orchestrator     │ ◀─── monitor tick
//!                 │ queue  tracker  aggr │ ◀─── schedule tick
//!                 └──────────┬───────────┘
//!                 dispatch   │   ▲ PoolSignal
//!         ┌──────────────────┼───┴──────────────┐
//!         ▼                  ▼                  ▼
//!    ┌─────────┐        ┌─────────┐        ┌─────────┐
//!    │ Worker 0│        │ Worker 1│        │ Worker N│
//!    └─────────┘        └─────────┘        └─────────┘
//! ```
//!
//! Each worker runs at most one task. A timed-out or crashed worker is
//! replaced under the same id and its task goes through the retry path.

pub mod message;
pub(crate) mod orchestrator;
pub mod queue;
pub mod strategy;
pub mod task;
pub mod worker_pool;

pub use message::{WorkerId, WorkerMessage, WorkerReport};
pub use queue::PendingQueue;
pub use strategy::{LoadBalancingStrategy, WorkerLoad};
pub use task::{CompletedTask, FailedTask, Priority, Task, TaskSpec};
pub use worker_pool::{
    DispatchOutcome, PoolError, PoolOutcome, PoolSignal, PoolStats, WorkerPool, WorkerPoolConfig,
    WorkerState, WorkerStats,
};

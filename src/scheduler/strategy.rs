//! Load-balancing strategies for matching tasks to idle workers.

use std::fmt;
use std::str::FromStr;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use super::message::WorkerId;
use super::task::Task;

/// Complexity above which the adaptive strategy favours free capacity.
const HEAVY_TASK_COMPLEXITY: f64 = 5.0;

/// How an idle worker is chosen for the next task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    /// Lowest worker id first.
    RoundRobin,
    /// Fewest completed tasks first.
    LeastLoaded,
    /// Lowest current memory usage first.
    MemoryOptimized,
    /// Weighted score of free CPU, free memory and recent task count.
    #[default]
    Adaptive,
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadBalancingStrategy::RoundRobin => "round-robin",
            LoadBalancingStrategy::LeastLoaded => "least-loaded",
            LoadBalancingStrategy::MemoryOptimized => "memory-optimized",
            LoadBalancingStrategy::Adaptive => "adaptive",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "round-robin" => Ok(LoadBalancingStrategy::RoundRobin),
            "least-loaded" => Ok(LoadBalancingStrategy::LeastLoaded),
            "memory-optimized" => Ok(LoadBalancingStrategy::MemoryOptimized),
            "adaptive" => Ok(LoadBalancingStrategy::Adaptive),
            other => Err(format!(
                "Unknown load balancing strategy '{}': expected round-robin, least-loaded, memory-optimized or adaptive",
                other
            )),
        }
    }
}

/// Load figures of an idle worker, as seen by the strategies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerLoad {
    /// Worker id.
    pub worker_id: WorkerId,
    /// Tasks completed so far by this worker slot.
    pub tasks_completed: u64,
    /// Last reported memory usage in bytes.
    pub memory_usage: u64,
    /// Last reported CPU usage in percent.
    pub cpu_usage: f64,
}

impl LoadBalancingStrategy {
    /// Picks a worker for `task` among idle `candidates`.
    ///
    /// `memory_budget` is the per-worker memory limit in bytes, used to
    /// normalise memory usage for the adaptive score. Ties go to the lowest
    /// worker id. Returns `None` when there are no candidates.
    pub fn select(
        &self,
        candidates: &[WorkerLoad],
        task: &Task,
        memory_budget: u64,
    ) -> Option<WorkerId> {
        let mut sorted: Vec<&WorkerLoad> = candidates.iter().collect();
        sorted.sort_by_key(|w| w.worker_id);

        let chosen = match self {
            LoadBalancingStrategy::RoundRobin => sorted.first().copied(),
            LoadBalancingStrategy::LeastLoaded => {
                sorted.into_iter().min_by_key(|w| w.tasks_completed)
            }
            LoadBalancingStrategy::MemoryOptimized => {
                sorted.into_iter().min_by_key(|w| w.memory_usage)
            }
            LoadBalancingStrategy::Adaptive => {
                let busiest = sorted.iter().map(|w| w.tasks_completed).max().unwrap_or(0);
                // max_by_key keeps the last maximum; iterate in reverse so ties
                // resolve to the lowest id.
                sorted.into_iter().rev().max_by_key(|w| {
                    OrderedFloat(adaptive_score(
                        w,
                        task.estimated_complexity,
                        memory_budget,
                        busiest,
                    ))
                })
            }
        };

        chosen.map(|w| w.worker_id)
    }
}

/// Scores a worker for the adaptive strategy; higher is better.
///
/// Heavy tasks (complexity above 5) weigh free CPU and memory most, light
/// tasks weigh spreading work across workers most.
pub fn adaptive_score(
    worker: &WorkerLoad,
    complexity: f64,
    memory_budget: u64,
    busiest: u64,
) -> f64 {
    let free_cpu = ((100.0 - worker.cpu_usage) / 100.0).clamp(0.0, 1.0);
    let free_memory = if memory_budget > 0 {
        (1.0 - worker.memory_usage as f64 / memory_budget as f64).clamp(0.0, 1.0)
    } else {
        1.0
    };
    let recent_load = if busiest > 0 {
        worker.tasks_completed as f64 / busiest as f64
    } else {
        0.0
    };
    let spread = 1.0 - recent_load;

    if complexity > HEAVY_TASK_COMPLEXITY {
        0.45 * free_cpu + 0.45 * free_memory + 0.1 * spread
    } else {
        0.3 * free_cpu + 0.3 * free_memory + 0.4 * spread
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::TaskSpec;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn load(worker_id: WorkerId, completed: u64, memory: u64, cpu: f64) -> WorkerLoad {
        WorkerLoad {
            worker_id,
            tasks_completed: completed,
            memory_usage: memory,
            cpu_usage: cpu,
        }
    }

    fn task(complexity: f64) -> Task {
        Task::from_spec(TaskSpec::new("t").with_complexity(complexity), "b")
    }

    #[test]
    fn test_strategy_parse_and_display() {
        for name in ["round-robin", "least-loaded", "memory-optimized", "adaptive"] {
            let strategy: LoadBalancingStrategy = name.parse().expect("known strategy");
            assert_eq!(strategy.to_string(), name);
        }
        assert_eq!(
            "least_loaded".parse::<LoadBalancingStrategy>(),
            Ok(LoadBalancingStrategy::LeastLoaded)
        );
        assert!("random".parse::<LoadBalancingStrategy>().is_err());
        assert_eq!(LoadBalancingStrategy::default(), LoadBalancingStrategy::Adaptive);
    }

    #[test]
    fn test_empty_candidates() {
        for strategy in [
            LoadBalancingStrategy::RoundRobin,
            LoadBalancingStrategy::LeastLoaded,
            LoadBalancingStrategy::MemoryOptimized,
            LoadBalancingStrategy::Adaptive,
        ] {
            assert_eq!(strategy.select(&[], &task(1.0), GIB), None);
        }
    }

    #[test]
    fn test_round_robin_lowest_id() {
        let candidates = [load(4, 0, 0, 0.0), load(2, 10, GIB, 90.0), load(7, 0, 0, 0.0)];
        assert_eq!(
            LoadBalancingStrategy::RoundRobin.select(&candidates, &task(1.0), GIB),
            Some(2)
        );
    }

    #[test]
    fn test_least_loaded() {
        let candidates = [load(0, 5, 0, 0.0), load(1, 2, 0, 0.0), load(2, 2, 0, 0.0)];
        assert_eq!(
            LoadBalancingStrategy::LeastLoaded.select(&candidates, &task(1.0), GIB),
            Some(1)
        );
    }

    #[test]
    fn test_memory_optimized() {
        let candidates = [load(0, 0, GIB / 2, 0.0), load(1, 0, GIB / 8, 0.0), load(2, 0, GIB, 0.0)];
        assert_eq!(
            LoadBalancingStrategy::MemoryOptimized.select(&candidates, &task(1.0), GIB),
            Some(1)
        );
    }

    #[test]
    fn test_adaptive_prefers_free_capacity_for_heavy_tasks() {
        // Worker 0 has done less work but is nearly saturated; worker 1 is busy
        // historically but idle now.
        let candidates = [load(0, 0, GIB * 9 / 10, 90.0), load(1, 10, 0, 5.0)];
        assert_eq!(
            LoadBalancingStrategy::Adaptive.select(&candidates, &task(8.0), GIB),
            Some(1)
        );
    }

    #[test]
    fn test_adaptive_spreads_light_tasks() {
        let candidates = [load(0, 10, GIB / 4, 20.0), load(1, 0, GIB / 2, 40.0)];
        assert_eq!(
            LoadBalancingStrategy::Adaptive.select(&candidates, &task(2.0), GIB),
            Some(1)
        );
    }

    #[test]
    fn test_adaptive_tie_goes_to_lowest_id() {
        let candidates = [load(3, 0, 0, 0.0), load(1, 0, 0, 0.0), load(2, 0, 0, 0.0)];
        assert_eq!(
            LoadBalancingStrategy::Adaptive.select(&candidates, &task(1.0), GIB),
            Some(1)
        );
    }
}

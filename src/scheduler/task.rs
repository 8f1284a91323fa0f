//! Task definitions for the scheduler.
//!
//! This module defines the core task types used by the scheduling system:
//!
//! - `TaskSpec`: What a caller submits
//! - `Task`: A queued unit of work, enriched with batch and retry state
//! - `Priority`: Scheduling priority of a task
//! - `CompletedTask` / `FailedTask`: Terminal outcomes of a task

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Lower bound for estimated task complexity.
const MIN_COMPLEXITY: f64 = 1.0;

/// Upper bound for estimated task complexity.
const MAX_COMPLEXITY: f64 = 10.0;

/// Scheduling priority of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Scheduled after everything else.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Scheduled before everything else.
    High,
}

impl Priority {
    /// Returns the numeric weight used for ordering (high=3, normal=2, low=1).
    pub fn weight(&self) -> u8 {
        match self {
            Priority::High => 3,
            Priority::Normal => 2,
            Priority::Low => 1,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!(
                "Invalid priority '{}': must be 'high', 'normal', or 'low'",
                other
            )),
        }
    }
}

/// Specification of a task as submitted by a caller.
///
/// The payload is opaque to the scheduler; it is handed unchanged to the
/// configured [`TaskExecutor`](crate::executor::TaskExecutor).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Unique identifier for the task.
    pub id: String,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// Cost hint used for ordering and load balancing.
    /// Estimated from the payload when absent.
    #[serde(default)]
    pub estimated_complexity: Option<f64>,
    /// Opaque work description.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskSpec {
    /// Creates a new task specification with normal priority and no payload.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            priority: Priority::Normal,
            estimated_complexity: None,
            payload: serde_json::Value::Null,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the estimated complexity.
    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.estimated_complexity = Some(complexity);
        self
    }

    /// Sets the payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A unit of work owned by the scheduler.
///
/// Created from a [`TaskSpec`] on submission. Only `retry_count` changes
/// after creation, and only the worker pool changes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique identifier for this task.
    pub id: String,
    /// Batch this task belongs to.
    pub batch_id: String,
    /// Scheduling priority.
    pub priority: Priority,
    /// Cost hint, always within [1, 10] when estimated.
    pub estimated_complexity: f64,
    /// Number of retries already scheduled for this task.
    pub retry_count: u32,
    /// Opaque work description.
    pub payload: serde_json::Value,
    /// When this task was submitted.
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    /// Creates a task from a caller spec, estimating complexity when missing.
    pub fn from_spec(spec: TaskSpec, batch_id: impl Into<String>) -> Self {
        let estimated_complexity = spec
            .estimated_complexity
            .filter(|c| c.is_finite())
            .unwrap_or_else(|| estimate_complexity(&spec.payload));

        Self {
            id: spec.id,
            batch_id: batch_id.into(),
            priority: spec.priority,
            estimated_complexity,
            retry_count: 0,
            payload: spec.payload,
            submitted_at: Utc::now(),
        }
    }

    /// Returns the 1-based attempt number of the next (or current) execution.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    /// Compares two tasks by scheduling order.
    ///
    /// `Ordering::Greater` means `self` should be dispatched first: higher
    /// priority wins, then higher estimated complexity.
    pub fn schedule_cmp(&self, other: &Task) -> Ordering {
        self.priority.weight().cmp(&other.priority.weight()).then_with(|| {
            OrderedFloat(self.estimated_complexity).cmp(&OrderedFloat(other.estimated_complexity))
        })
    }
}

/// Estimates task complexity from its payload.
///
/// Looks for explicit hints (`complexity`, `cyclomaticComplexity`,
/// `linesOfCode`) and otherwise falls back to the serialized payload size.
/// The result is clamped to [1, 10].
pub fn estimate_complexity(payload: &serde_json::Value) -> f64 {
    let hinted = payload
        .get("complexity")
        .or_else(|| payload.get("cyclomaticComplexity"))
        .and_then(serde_json::Value::as_f64)
        .or_else(|| {
            payload
                .get("linesOfCode")
                .and_then(serde_json::Value::as_f64)
                .map(|lines| lines / 100.0)
        });

    let raw = match hinted {
        Some(value) => value,
        None => {
            let size = serde_json::to_string(payload).map(|s| s.len()).unwrap_or(0);
            size as f64 / 1000.0
        }
    };

    if raw.is_finite() {
        raw.clamp(MIN_COMPLEXITY, MAX_COMPLEXITY)
    } else {
        MIN_COMPLEXITY
    }
}

/// A task that finished successfully.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedTask {
    /// ID of the task.
    pub task_id: String,
    /// Batch the task belongs to.
    pub batch_id: String,
    /// Worker that produced the result.
    pub worker_id: usize,
    /// Opaque executor output.
    pub output: serde_json::Value,
    /// Wall-clock duration of the successful attempt.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Total number of attempts, including the successful one.
    pub attempts: u32,
}

/// A task that exhausted its retries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTask {
    /// ID of the task.
    pub task_id: String,
    /// Batch the task belongs to.
    pub batch_id: String,
    /// Error from the final attempt.
    pub error: String,
    /// Total number of attempts.
    pub attempts: u32,
}

/// Serializes a `Duration` as integer milliseconds.
pub(crate) mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_weights() {
        assert_eq!(Priority::High.weight(), 3);
        assert_eq!(Priority::Normal.weight(), 2);
        assert_eq!(Priority::Low.weight(), 1);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
        assert_eq!("low".parse::<Priority>(), Ok(Priority::Low));
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_task_from_spec() {
        let spec = TaskSpec::new("task-1")
            .with_priority(Priority::High)
            .with_complexity(7.5)
            .with_payload(json!({"file": "src/legacy.py"}));
        let task = Task::from_spec(spec, "batch-1");

        assert_eq!(task.id, "task-1");
        assert_eq!(task.batch_id, "batch-1");
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.estimated_complexity, 7.5);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.attempt(), 1);
    }

    #[test]
    fn test_complexity_estimated_from_hints() {
        assert_eq!(estimate_complexity(&json!({"complexity": 4})), 4.0);
        assert_eq!(estimate_complexity(&json!({"cyclomaticComplexity": 42})), 10.0);
        assert_eq!(estimate_complexity(&json!({"linesOfCode": 350})), 3.5);
        assert_eq!(estimate_complexity(&serde_json::Value::Null), 1.0);
    }

    #[test]
    fn test_complexity_estimated_from_size() {
        let big = json!({"source": "x".repeat(5_000)});
        let estimated = estimate_complexity(&big);
        assert!(estimated > 4.9 && estimated < 5.1);
    }

    #[test]
    fn test_schedule_order() {
        let low = Task::from_spec(TaskSpec::new("a").with_priority(Priority::Low), "b");
        let high = Task::from_spec(TaskSpec::new("b").with_priority(Priority::High), "b");
        let light = Task::from_spec(TaskSpec::new("c").with_complexity(2.0), "b");
        let heavy = Task::from_spec(TaskSpec::new("d").with_complexity(8.0), "b");

        assert_eq!(high.schedule_cmp(&low), Ordering::Greater);
        assert_eq!(heavy.schedule_cmp(&light), Ordering::Greater);
        assert_eq!(light.schedule_cmp(&light.clone()), Ordering::Equal);
    }

    #[test]
    fn test_task_spec_deserialize_defaults() {
        let spec: TaskSpec = serde_json::from_value(json!({"id": "t-1"})).expect("valid spec");
        assert_eq!(spec.priority, Priority::Normal);
        assert!(spec.estimated_complexity.is_none());
        assert!(spec.payload.is_null());

        let spec: TaskSpec = serde_json::from_value(json!({
            "id": "t-2",
            "priority": "high",
            "estimatedComplexity": 6.0,
            "payload": {"command": "true"}
        }))
        .expect("valid spec");
        assert_eq!(spec.priority, Priority::High);
        assert_eq!(spec.estimated_complexity, Some(6.0));
    }
}

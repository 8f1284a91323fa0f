//! Conflict detection on completed task output.
//!
//! Executors report regressions through well-known fields of their JSON
//! output. Each detected regression becomes an immutable [`ConflictRecord`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Performance degradation (percent) above which a conflict is high severity.
const HIGH_DEGRADATION_PERCENT: f64 = 50.0;

/// Performance degradation (percent) above which a conflict is medium severity.
const MEDIUM_DEGRADATION_PERCENT: f64 = 20.0;

/// Quality improvement below which a quality regression is reported.
const QUALITY_REGRESSION_THRESHOLD: f64 = -10.0;

/// Kind of regression detected in a task result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// The refactored code is not functionally equivalent.
    FunctionalEquivalence,
    /// The refactored code is measurably slower.
    PerformanceRegression,
    /// Code quality got worse.
    QualityRegression,
    /// The change was classified as a high-risk migration.
    MigrationRisk,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictType::FunctionalEquivalence => "functional_equivalence",
            ConflictType::PerformanceRegression => "performance_regression",
            ConflictType::QualityRegression => "quality_regression",
            ConflictType::MigrationRisk => "migration_risk",
        };
        write!(f, "{}", name)
    }
}

/// Conflict severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
}

impl fmt::Display for ConflictSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictSeverity::Low => write!(f, "low"),
            ConflictSeverity::Medium => write!(f, "medium"),
            ConflictSeverity::High => write!(f, "high"),
        }
    }
}

/// A regression found in one completed task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// Task the conflict was found in.
    pub task_id: String,
    /// Batch of that task.
    pub batch_id: String,
    /// Kind of regression.
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    /// Severity.
    pub severity: ConflictSeverity,
    /// Human-readable details.
    pub details: String,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
}

/// Detects conflicts in a completed task's output.
///
/// Recognized fields:
/// - `functionalEquivalence`: `false`, or an object with `equivalent: false`
/// - `performanceComparison.degradation`: percent slowdown
/// - `qualityImprovement`: number, or an object with `overall`
/// - `migrationRisk`: `"high"`, or an object with `level: "high"`
pub fn detect_conflicts(task_id: &str, batch_id: &str, output: &Value) -> Vec<ConflictRecord> {
    let mut found: Vec<(ConflictType, ConflictSeverity, String)> = Vec::new();

    if let Some(equivalent) = functional_equivalence(output) {
        if !equivalent {
            found.push((
                ConflictType::FunctionalEquivalence,
                ConflictSeverity::High,
                "refactored code is not functionally equivalent".to_string(),
            ));
        }
    }

    if let Some(degradation) = output
        .pointer("/performanceComparison/degradation")
        .and_then(Value::as_f64)
    {
        let severity = if degradation > HIGH_DEGRADATION_PERCENT {
            Some(ConflictSeverity::High)
        } else if degradation > MEDIUM_DEGRADATION_PERCENT {
            Some(ConflictSeverity::Medium)
        } else {
            None
        };
        if let Some(severity) = severity {
            found.push((
                ConflictType::PerformanceRegression,
                severity,
                format!("performance degraded by {:.1}%", degradation),
            ));
        }
    }

    if let Some(improvement) = quality_improvement(output) {
        if improvement < QUALITY_REGRESSION_THRESHOLD {
            found.push((
                ConflictType::QualityRegression,
                ConflictSeverity::Medium,
                format!("quality changed by {:.1}", improvement),
            ));
        }
    }

    if migration_risk(output).is_some_and(|level| level.eq_ignore_ascii_case("high")) {
        found.push((
            ConflictType::MigrationRisk,
            ConflictSeverity::Medium,
            "migration risk classified as high".to_string(),
        ));
    }

    let detected_at = Utc::now();
    found
        .into_iter()
        .map(|(conflict_type, severity, details)| ConflictRecord {
            task_id: task_id.to_string(),
            batch_id: batch_id.to_string(),
            conflict_type,
            severity,
            details,
            detected_at,
        })
        .collect()
}

fn functional_equivalence(output: &Value) -> Option<bool> {
    match output.get("functionalEquivalence")? {
        Value::Bool(equivalent) => Some(*equivalent),
        Value::Object(map) => map.get("equivalent").and_then(Value::as_bool),
        _ => None,
    }
}

fn quality_improvement(output: &Value) -> Option<f64> {
    match output.get("qualityImprovement")? {
        Value::Object(map) => map.get("overall").and_then(Value::as_f64),
        other => other.as_f64(),
    }
}

fn migration_risk(output: &Value) -> Option<&str> {
    match output.get("migrationRisk")? {
        Value::String(level) => Some(level.as_str()),
        Value::Object(map) => map.get("level").and_then(Value::as_str),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kinds(output: Value) -> Vec<(ConflictType, ConflictSeverity)> {
        detect_conflicts("t", "b", &output)
            .into_iter()
            .map(|c| (c.conflict_type, c.severity))
            .collect()
    }

    #[test]
    fn test_performance_regression_severity() {
        assert_eq!(
            kinds(json!({"performanceComparison": {"degradation": 60}})),
            vec![(ConflictType::PerformanceRegression, ConflictSeverity::High)]
        );
        assert_eq!(
            kinds(json!({"performanceComparison": {"degradation": 25}})),
            vec![(ConflictType::PerformanceRegression, ConflictSeverity::Medium)]
        );
        assert!(kinds(json!({"performanceComparison": {"degradation": 20}})).is_empty());
    }

    #[test]
    fn test_functional_equivalence_failure() {
        assert_eq!(
            kinds(json!({"functionalEquivalence": false})),
            vec![(ConflictType::FunctionalEquivalence, ConflictSeverity::High)]
        );
        assert_eq!(
            kinds(json!({"functionalEquivalence": {"equivalent": false}})),
            vec![(ConflictType::FunctionalEquivalence, ConflictSeverity::High)]
        );
        assert!(kinds(json!({"functionalEquivalence": true})).is_empty());
    }

    #[test]
    fn test_quality_and_migration_risk() {
        assert_eq!(
            kinds(json!({"qualityImprovement": -15.0, "migrationRisk": "HIGH"})),
            vec![
                (ConflictType::QualityRegression, ConflictSeverity::Medium),
                (ConflictType::MigrationRisk, ConflictSeverity::Medium),
            ]
        );
        assert!(kinds(json!({"qualityImprovement": {"overall": -5.0}})).is_empty());
        assert!(kinds(json!({"migrationRisk": {"level": "low"}})).is_empty());
    }

    #[test]
    fn test_opaque_output_has_no_conflicts() {
        assert!(kinds(Value::Null).is_empty());
        assert!(kinds(json!({"exitCode": 0, "stdout": "ok"})).is_empty());
    }

    #[test]
    fn test_conflict_serialization() {
        let conflict = detect_conflicts(
            "t-1",
            "b-1",
            &json!({"performanceComparison": {"degradation": 60}}),
        )
        .remove(0);
        let value = serde_json::to_value(&conflict).expect("serializable");
        assert_eq!(value["type"], "performance_regression");
        assert_eq!(value["severity"], "high");
        assert_eq!(value["taskId"], "t-1");
    }
}

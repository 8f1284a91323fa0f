//! Conflict resolution strategies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::conflict::{ConflictRecord, ConflictSeverity, ConflictType};

/// How detected conflicts are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolutionStrategy {
    /// Accept the result anyway and log a warning.
    #[default]
    LatestWins,
    /// Flag the result for a human reviewer.
    ManualReview,
    /// Produce a rollback plan for the change.
    AutomaticRollback,
    /// Reject high-severity conflicts, accept the rest with a warning.
    QualityThreshold,
}

impl fmt::Display for ConflictResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictResolutionStrategy::LatestWins => write!(f, "latest_wins"),
            ConflictResolutionStrategy::ManualReview => write!(f, "manual_review"),
            ConflictResolutionStrategy::AutomaticRollback => write!(f, "automatic_rollback"),
            ConflictResolutionStrategy::QualityThreshold => write!(f, "quality_threshold"),
        }
    }
}

impl FromStr for ConflictResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "latest_wins" => Ok(ConflictResolutionStrategy::LatestWins),
            "manual_review" => Ok(ConflictResolutionStrategy::ManualReview),
            "automatic_rollback" => Ok(ConflictResolutionStrategy::AutomaticRollback),
            "quality_threshold" => Ok(ConflictResolutionStrategy::QualityThreshold),
            other => Err(format!(
                "unknown conflict resolution strategy '{}' (expected latest_wins, manual_review, automatic_rollback or quality_threshold)",
                other
            )),
        }
    }
}

/// Urgency of a manual review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewPriority {
    Normal,
    Urgent,
}

/// What to do with a conflicting result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResolutionAction {
    /// Keep the result but surface the conflict.
    AcceptWithWarning,
    /// Hold the result for a reviewer.
    ManualReview { priority: ReviewPriority },
    /// Undo the change.
    Rollback { steps: Vec<String> },
    /// Discard the result.
    Reject,
}

/// Outcome of resolving one conflict. The conflict itself is not modified.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// Task the conflict belongs to.
    pub task_id: String,
    /// Kind of the resolved conflict.
    pub conflict_type: ConflictType,
    /// Strategy that produced this resolution.
    pub strategy: ConflictResolutionStrategy,
    /// Chosen action.
    #[serde(flatten)]
    pub action: ResolutionAction,
    /// Why the action was chosen.
    pub rationale: String,
}

impl ConflictResolutionStrategy {
    /// Resolves `conflict` according to this strategy.
    pub fn resolve(&self, conflict: &ConflictRecord) -> Resolution {
        let (action, rationale) = match self {
            ConflictResolutionStrategy::LatestWins => (
                ResolutionAction::AcceptWithWarning,
                format!(
                    "latest result kept despite {} conflict: {}",
                    conflict.severity, conflict.details
                ),
            ),
            ConflictResolutionStrategy::ManualReview => {
                let priority = if conflict.severity == ConflictSeverity::High {
                    ReviewPriority::Urgent
                } else {
                    ReviewPriority::Normal
                };
                (
                    ResolutionAction::ManualReview { priority },
                    format!("{} flagged for review: {}", conflict.conflict_type, conflict.details),
                )
            }
            ConflictResolutionStrategy::AutomaticRollback => (
                ResolutionAction::Rollback {
                    steps: rollback_steps(conflict),
                },
                format!("rolling back task {}: {}", conflict.task_id, conflict.details),
            ),
            ConflictResolutionStrategy::QualityThreshold => {
                if conflict.severity == ConflictSeverity::High {
                    (
                        ResolutionAction::Reject,
                        format!("high severity {} rejected", conflict.conflict_type),
                    )
                } else {
                    (
                        ResolutionAction::AcceptWithWarning,
                        format!(
                            "{} severity {} within threshold",
                            conflict.severity, conflict.conflict_type
                        ),
                    )
                }
            }
        };

        Resolution {
            task_id: conflict.task_id.clone(),
            conflict_type: conflict.conflict_type,
            strategy: *self,
            action,
            rationale,
        }
    }
}

fn rollback_steps(conflict: &ConflictRecord) -> Vec<String> {
    let mut steps = vec![
        format!("restore the original code of task {}", conflict.task_id),
        "re-run the test suite against the restored code".to_string(),
    ];
    match conflict.conflict_type {
        ConflictType::PerformanceRegression => {
            steps.push("re-run performance benchmarks to confirm the baseline".to_string())
        }
        ConflictType::MigrationRisk => {
            steps.push("revert dependent migrations in reverse order".to_string())
        }
        ConflictType::FunctionalEquivalence | ConflictType::QualityRegression => {}
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn conflict(severity: ConflictSeverity) -> ConflictRecord {
        ConflictRecord {
            task_id: "t-1".to_string(),
            batch_id: "b-1".to_string(),
            conflict_type: ConflictType::PerformanceRegression,
            severity,
            details: "performance degraded by 60.0%".to_string(),
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "manual_review".parse::<ConflictResolutionStrategy>(),
            Ok(ConflictResolutionStrategy::ManualReview)
        );
        assert_eq!(
            "Automatic-Rollback".parse::<ConflictResolutionStrategy>(),
            Ok(ConflictResolutionStrategy::AutomaticRollback)
        );
        assert!("whatever".parse::<ConflictResolutionStrategy>().is_err());
        assert_eq!(ConflictResolutionStrategy::default().to_string(), "latest_wins");
    }

    #[test]
    fn test_latest_wins_accepts() {
        let resolution = ConflictResolutionStrategy::LatestWins.resolve(&conflict(ConflictSeverity::High));
        assert_eq!(resolution.action, ResolutionAction::AcceptWithWarning);
    }

    #[test]
    fn test_manual_review_priority() {
        let high = ConflictResolutionStrategy::ManualReview.resolve(&conflict(ConflictSeverity::High));
        assert_eq!(
            high.action,
            ResolutionAction::ManualReview {
                priority: ReviewPriority::Urgent
            }
        );
        let medium =
            ConflictResolutionStrategy::ManualReview.resolve(&conflict(ConflictSeverity::Medium));
        assert_eq!(
            medium.action,
            ResolutionAction::ManualReview {
                priority: ReviewPriority::Normal
            }
        );
    }

    #[test]
    fn test_quality_threshold() {
        let strategy = ConflictResolutionStrategy::QualityThreshold;
        assert_eq!(
            strategy.resolve(&conflict(ConflictSeverity::High)).action,
            ResolutionAction::Reject
        );
        assert_eq!(
            strategy.resolve(&conflict(ConflictSeverity::Medium)).action,
            ResolutionAction::AcceptWithWarning
        );
    }

    #[test]
    fn test_rollback_plan() {
        let original = conflict(ConflictSeverity::Medium);
        let snapshot = original.clone();
        let resolution = ConflictResolutionStrategy::AutomaticRollback.resolve(&original);
        match resolution.action {
            ResolutionAction::Rollback { steps } => {
                assert_eq!(steps.len(), 3);
                assert!(steps[0].contains("t-1"));
            }
            other => panic!("expected rollback, got {:?}", other),
        }
        assert_eq!(original, snapshot);
    }

    #[test]
    fn test_resolution_serialization() {
        let resolution =
            ConflictResolutionStrategy::ManualReview.resolve(&conflict(ConflictSeverity::High));
        let value = serde_json::to_value(&resolution).expect("serializable");
        assert_eq!(value["action"], "manual_review");
        assert_eq!(value["priority"], "urgent");
        assert_eq!(value["strategy"], "manual_review");
    }
}

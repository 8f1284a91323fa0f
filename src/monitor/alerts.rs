//! Threshold alerts with per-kind cooldown.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::source::RawMetrics;

/// Kind of resource pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// CPU usage above the configured maximum.
    HighCpu,
    /// Memory usage above the configured maximum.
    HighMemory,
    /// Load average above twice the core count.
    HighLoad,
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertType::HighCpu => write!(f, "high_cpu"),
            AlertType::HighMemory => write!(f, "high_memory"),
            AlertType::HighLoad => write!(f, "high_load"),
        }
    }
}

/// How far a metric is over its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Above the configured maximum.
    Warning,
    /// Above the midpoint between the configured maximum and 100%.
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// A raised resource alert. Alerts are advisory and never block tasks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAlert {
    /// Kind of alert.
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    /// Severity.
    pub severity: AlertSeverity,
    /// Observed value.
    pub value: f64,
    /// Threshold that was crossed.
    pub threshold: f64,
    /// Human-readable description.
    pub message: String,
    /// When the alert was raised.
    pub timestamp: DateTime<Utc>,
}

/// Evaluates thresholds and suppresses repeats within a cooldown window.
#[derive(Debug)]
pub struct AlertManager {
    max_cpu_usage_percent: f64,
    max_memory_usage_percent: f64,
    cooldown: Duration,
    last_raised: HashMap<(AlertType, AlertSeverity), Instant>,
}

impl AlertManager {
    /// Creates a manager with the given thresholds and cooldown.
    pub fn new(max_cpu_usage_percent: f64, max_memory_usage_percent: f64, cooldown: Duration) -> Self {
        Self {
            max_cpu_usage_percent,
            max_memory_usage_percent,
            cooldown,
            last_raised: HashMap::new(),
        }
    }

    /// Returns the alerts `metrics` warrant, ignoring cooldown.
    pub fn evaluate(&self, metrics: &RawMetrics) -> Vec<ResourceAlert> {
        let mut alerts = Vec::new();
        let now = Utc::now();

        if let Some(severity) = severity_for(metrics.cpu_usage, self.max_cpu_usage_percent) {
            alerts.push(ResourceAlert {
                alert_type: AlertType::HighCpu,
                severity,
                value: metrics.cpu_usage,
                threshold: self.max_cpu_usage_percent,
                message: format!(
                    "CPU usage {:.1}% exceeds {:.1}%",
                    metrics.cpu_usage, self.max_cpu_usage_percent
                ),
                timestamp: now,
            });
        }

        if let Some(severity) = severity_for(metrics.memory_usage, self.max_memory_usage_percent) {
            alerts.push(ResourceAlert {
                alert_type: AlertType::HighMemory,
                severity,
                value: metrics.memory_usage,
                threshold: self.max_memory_usage_percent,
                message: format!(
                    "Memory usage {:.1}% exceeds {:.1}%",
                    metrics.memory_usage, self.max_memory_usage_percent
                ),
                timestamp: now,
            });
        }

        let load_threshold = (metrics.cpu_cores.max(1) * 2) as f64;
        if metrics.load_average > load_threshold {
            alerts.push(ResourceAlert {
                alert_type: AlertType::HighLoad,
                severity: AlertSeverity::Warning,
                value: metrics.load_average,
                threshold: load_threshold,
                message: format!(
                    "Load average {:.2} exceeds {:.0}",
                    metrics.load_average, load_threshold
                ),
                timestamp: now,
            });
        }

        alerts
    }

    /// Returns the alerts to raise now, dropping any whose type and severity
    /// was already raised within the cooldown window.
    pub fn check(&mut self, metrics: &RawMetrics, now: Instant) -> Vec<ResourceAlert> {
        let cooldown = self.cooldown;
        let candidates = self.evaluate(metrics);
        candidates
            .into_iter()
            .filter(|alert| {
                let key = (alert.alert_type, alert.severity);
                match self.last_raised.get(&key) {
                    Some(last) if now.saturating_duration_since(*last) < cooldown => false,
                    _ => {
                        self.last_raised.insert(key, now);
                        true
                    }
                }
            })
            .collect()
    }
}

/// Warning above `max`, critical above the midpoint between `max` and 100.
fn severity_for(value: f64, max: f64) -> Option<AlertSeverity> {
    let critical = max + (100.0 - max) / 2.0;
    if value > critical {
        Some(AlertSeverity::Critical)
    } else if value > max {
        Some(AlertSeverity::Warning)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(cpu: f64, memory: f64, load: f64) -> RawMetrics {
        RawMetrics {
            cpu_usage: cpu,
            memory_usage: memory,
            total_memory: 8 * 1024 * 1024 * 1024,
            load_average: load,
            cpu_cores: 4,
        }
    }

    #[test]
    fn test_severity_levels() {
        assert_eq!(severity_for(70.0, 80.0), None);
        assert_eq!(severity_for(85.0, 80.0), Some(AlertSeverity::Warning));
        assert_eq!(severity_for(90.0, 80.0), Some(AlertSeverity::Warning));
        assert_eq!(severity_for(95.0, 80.0), Some(AlertSeverity::Critical));
    }

    #[test]
    fn test_evaluate_all_kinds() {
        let manager = AlertManager::new(80.0, 75.0, Duration::from_secs(30));
        let alerts = manager.evaluate(&metrics(95.0, 80.0, 9.0));

        let kinds: Vec<(AlertType, AlertSeverity)> =
            alerts.iter().map(|a| (a.alert_type, a.severity)).collect();
        assert_eq!(
            kinds,
            vec![
                (AlertType::HighCpu, AlertSeverity::Critical),
                (AlertType::HighMemory, AlertSeverity::Warning),
                (AlertType::HighLoad, AlertSeverity::Warning),
            ]
        );
        assert!(manager.evaluate(&metrics(10.0, 10.0, 0.5)).is_empty());
    }

    #[test]
    fn test_cooldown_suppresses_repeats() {
        let mut manager = AlertManager::new(80.0, 75.0, Duration::from_secs(30));
        let start = Instant::now();

        assert_eq!(manager.check(&metrics(95.0, 10.0, 0.0), start).len(), 1);
        assert!(manager
            .check(&metrics(96.0, 10.0, 0.0), start + Duration::from_secs(10))
            .is_empty());
        // A different severity is a different alert.
        assert_eq!(
            manager
                .check(&metrics(85.0, 10.0, 0.0), start + Duration::from_secs(11))
                .len(),
            1
        );
        // After the window the same alert fires again.
        assert_eq!(
            manager
                .check(&metrics(95.0, 10.0, 0.0), start + Duration::from_secs(31))
                .len(),
            1
        );
    }

    #[test]
    fn test_alert_serialization() {
        let manager = AlertManager::new(80.0, 75.0, Duration::from_secs(30));
        let alert = manager
            .evaluate(&metrics(95.0, 10.0, 0.0))
            .pop()
            .expect("cpu alert");
        let value = serde_json::to_value(&alert).expect("serializable");
        assert_eq!(value["type"], "high_cpu");
        assert_eq!(value["severity"], "critical");
    }
}

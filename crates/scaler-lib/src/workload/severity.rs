//! Workload severity classification

use crate::models::SystemSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered load level, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    VeryLow,
    Low,
    Moderate,
    High,
    VeryHigh,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::VeryLow => "very_low",
            Severity::Low => "low",
            Severity::Moderate => "moderate",
            Severity::High => "high",
            Severity::VeryHigh => "very_high",
            Severity::Critical => "critical",
        }
    }

    /// Numeric level for gauges, 0 for very_low through 5 for critical
    pub fn level(&self) -> i64 {
        *self as i64
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configurable thresholds for the `high` level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeverityThresholds {
    pub queue_length: usize,
    pub wait_time_secs: f64,
    pub cpu_percent: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            queue_length: 10,
            wait_time_secs: 30.0,
            cpu_percent: 80.0,
        }
    }
}

/// Classify a snapshot; the most severe matching level wins
pub fn classify(snapshot: &SystemSnapshot, thresholds: &SeverityThresholds) -> Severity {
    let queue = snapshot.queue_length;
    let wait = snapshot.average_wait_time;
    let cpu = snapshot.system_cpu;

    if snapshot.error_rate > 0.15 || wait > 120.0 || cpu > 95.0 || snapshot.system_memory > 95.0 {
        return Severity::Critical;
    }

    if queue > 20 || wait > 60.0 || cpu > 85.0 || snapshot.overloaded_fraction() > 0.6 {
        return Severity::VeryHigh;
    }

    if queue > thresholds.queue_length
        || wait > thresholds.wait_time_secs
        || cpu > thresholds.cpu_percent
        || snapshot.idle_fraction() < 0.2
    {
        return Severity::High;
    }

    if queue > 3 || wait > 10.0 || cpu > 60.0 || snapshot.active_fraction() > 0.7 {
        return Severity::Moderate;
    }

    if queue > 1 || snapshot.active_fraction() > 0.3 {
        return Severity::Low;
    }

    Severity::VeryLow
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> SystemSnapshot {
        SystemSnapshot {
            total_agents: 10,
            idle_agents: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_levels_are_ordered() {
        assert!(Severity::VeryLow < Severity::Low);
        assert!(Severity::Low < Severity::Moderate);
        assert!(Severity::Moderate < Severity::High);
        assert!(Severity::High < Severity::VeryHigh);
        assert!(Severity::VeryHigh < Severity::Critical);
        assert_eq!(Severity::Critical.level(), 5);
    }

    #[test]
    fn test_idle_system_is_very_low() {
        assert_eq!(classify(&snapshot(), &SeverityThresholds::default()), Severity::VeryLow);
    }

    #[test]
    fn test_critical_on_error_rate_or_memory() {
        let thresholds = SeverityThresholds::default();
        let s = SystemSnapshot {
            error_rate: 0.2,
            ..snapshot()
        };
        assert_eq!(classify(&s, &thresholds), Severity::Critical);

        let s = SystemSnapshot {
            system_memory: 96.0,
            ..snapshot()
        };
        assert_eq!(classify(&s, &thresholds), Severity::Critical);
    }

    #[test]
    fn test_very_high_on_overloaded_agents() {
        let s = SystemSnapshot {
            idle_agents: 3,
            overloaded_agents: 7,
            ..snapshot()
        };
        assert_eq!(classify(&s, &SeverityThresholds::default()), Severity::VeryHigh);
    }

    #[test]
    fn test_high_uses_configured_thresholds() {
        let s = SystemSnapshot {
            queue_length: 12,
            ..snapshot()
        };
        assert_eq!(classify(&s, &SeverityThresholds::default()), Severity::High);

        let relaxed = SeverityThresholds {
            queue_length: 15,
            ..Default::default()
        };
        assert_eq!(classify(&s, &relaxed), Severity::Moderate);
    }

    #[test]
    fn test_high_when_few_idle_agents() {
        let s = SystemSnapshot {
            idle_agents: 1,
            busy_agents: 9,
            ..snapshot()
        };
        assert_eq!(classify(&s, &SeverityThresholds::default()), Severity::High);
    }

    #[test]
    fn test_moderate_and_low() {
        let thresholds = SeverityThresholds::default();
        let s = SystemSnapshot {
            queue_length: 4,
            ..snapshot()
        };
        assert_eq!(classify(&s, &thresholds), Severity::Moderate);

        let s = SystemSnapshot {
            queue_length: 2,
            ..snapshot()
        };
        assert_eq!(classify(&s, &thresholds), Severity::Low);

        let s = SystemSnapshot {
            idle_agents: 6,
            busy_agents: 4,
            ..snapshot()
        };
        assert_eq!(classify(&s, &thresholds), Severity::Low);
    }

    #[test]
    fn test_classification_is_idempotent() {
        let thresholds = SeverityThresholds::default();
        let s = SystemSnapshot {
            queue_length: 5,
            average_wait_time: 12.0,
            ..snapshot()
        };
        let first = classify(&s, &thresholds);
        for _ in 0..10 {
            assert_eq!(classify(&s, &thresholds), first);
        }
    }
}

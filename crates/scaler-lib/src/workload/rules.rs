//! Workload-driven scale rules
//!
//! Pure functions over a `WorkloadView` and a `ScaleGate`. The collector
//! wraps them for convenience and the workload strategy calls them
//! directly, so both see identical verdicts for identical inputs.

use super::severity::{classify, Severity, SeverityThresholds};
use crate::config::ScalerConfig;
use crate::models::{seconds_between, SystemSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Snapshots considered for the sustained-idle check
pub const SUSTAINED_WINDOW: usize = 5;

/// Idle snapshots required inside the window before scaling down
pub const SUSTAINED_REQUIRED: usize = 3;

/// Idle fraction that marks a snapshot as idle
pub const IDLE_FRACTION_FOR_SCALE_DOWN: f64 = 0.7;

/// Bounds, cooldowns and thresholds shared by all workload checks
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleRules {
    pub min_agents: usize,
    pub max_agents: usize,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    pub thresholds: SeverityThresholds,
}

impl Default for ScaleRules {
    fn default() -> Self {
        Self {
            min_agents: 1,
            max_agents: 10,
            scale_up_cooldown: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(120),
            thresholds: SeverityThresholds::default(),
        }
    }
}

impl ScaleRules {
    pub fn from_config(config: &ScalerConfig) -> Self {
        Self {
            min_agents: config.min_agents,
            max_agents: config.max_agents,
            scale_up_cooldown: config.scale_up_cooldown(),
            scale_down_cooldown: config.scale_down_cooldown(),
            thresholds: SeverityThresholds {
                queue_length: config.queue_threshold,
                wait_time_secs: config.wait_time_threshold_seconds,
                cpu_percent: config.cpu_threshold_percent,
            },
        }
    }
}

/// Fleet size and last scale actions at evaluation time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleGate {
    pub current_agents: usize,
    pub last_scale_up: Option<DateTime<Utc>>,
    pub last_scale_down: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl ScaleGate {
    pub fn new(current_agents: usize, now: DateTime<Utc>) -> Self {
        Self {
            current_agents,
            last_scale_up: None,
            last_scale_down: None,
            now,
        }
    }
}

/// Latest snapshot, recent history (oldest first) and its severity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadView {
    pub latest: SystemSnapshot,
    pub recent: Vec<SystemSnapshot>,
    pub severity: Severity,
}

impl WorkloadView {
    /// View with no collected snapshot yet
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            latest: SystemSnapshot {
                timestamp: now,
                ..Default::default()
            },
            recent: Vec::new(),
            severity: Severity::VeryLow,
        }
    }

    /// Build from history, newest last
    pub fn from_history(
        history: &[SystemSnapshot],
        thresholds: &SeverityThresholds,
    ) -> Option<Self> {
        let latest = history.last()?.clone();
        let start = history.len().saturating_sub(SUSTAINED_WINDOW);
        Some(Self {
            severity: classify(&latest, thresholds),
            recent: history[start..].to_vec(),
            latest,
        })
    }
}

/// Outcome of one scale check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleVerdict {
    pub scale: bool,
    pub reason: String,
    /// Suggested number of agents to add or remove
    pub step: usize,
}

impl ScaleVerdict {
    fn yes(step: usize, reason: impl Into<String>) -> Self {
        Self {
            scale: true,
            reason: reason.into(),
            step: step.max(1),
        }
    }

    fn no(reason: impl Into<String>) -> Self {
        Self {
            scale: false,
            reason: reason.into(),
            step: 0,
        }
    }
}

/// Seconds of cooldown left, `None` when the window has passed
pub fn cooldown_remaining(
    last: Option<DateTime<Utc>>,
    cooldown: Duration,
    now: DateTime<Utc>,
) -> Option<f64> {
    let elapsed = seconds_between(last?, now);
    let window = cooldown.as_secs_f64();
    (elapsed < window).then(|| window - elapsed)
}

pub fn evaluate_scale_up(
    view: &WorkloadView,
    gate: &ScaleGate,
    rules: &ScaleRules,
) -> ScaleVerdict {
    if let Some(remaining) =
        cooldown_remaining(gate.last_scale_up, rules.scale_up_cooldown, gate.now)
    {
        return ScaleVerdict::no(format!("scale-up cooldown active ({:.0}s remaining)", remaining));
    }
    if gate.current_agents >= rules.max_agents {
        return ScaleVerdict::no(format!("at maximum agent count ({})", rules.max_agents));
    }
    if gate.current_agents < rules.min_agents {
        return ScaleVerdict::yes(
            rules.min_agents - gate.current_agents,
            format!(
                "below minimum agent count ({} < {})",
                gate.current_agents, rules.min_agents
            ),
        );
    }

    let headroom = rules.max_agents - gate.current_agents;
    let s = &view.latest;

    match view.severity {
        Severity::Critical => ScaleVerdict::yes(
            3.min(headroom),
            format!(
                "critical workload: queue {}, avg wait {:.1}s, error rate {:.1}%",
                s.queue_length,
                s.average_wait_time,
                s.error_rate * 100.0
            ),
        ),
        Severity::VeryHigh => ScaleVerdict::yes(
            2.min(headroom),
            format!(
                "very high workload: queue {}, avg wait {:.1}s, {} overloaded agents",
                s.queue_length, s.average_wait_time, s.overloaded_agents
            ),
        ),
        Severity::High => {
            if s.queue_length > s.total_agents
                || s.average_wait_time > rules.thresholds.wait_time_secs
            {
                ScaleVerdict::yes(
                    1,
                    format!(
                        "high workload: queue {} exceeds {} agents or wait {:.1}s over threshold",
                        s.queue_length, s.total_agents, s.average_wait_time
                    ),
                )
            } else {
                ScaleVerdict::no("high workload but current agents keep up with the queue")
            }
        }
        Severity::Moderate => {
            if s.idle_agents == 0 && s.queue_length > 0 {
                ScaleVerdict::yes(
                    1,
                    format!("moderate workload with no idle agents and {} queued", s.queue_length),
                )
            } else {
                ScaleVerdict::no("moderate workload absorbed by idle agents")
            }
        }
        severity => ScaleVerdict::no(format!("{} workload does not require scale-up", severity)),
    }
}

pub fn evaluate_scale_down(
    view: &WorkloadView,
    gate: &ScaleGate,
    rules: &ScaleRules,
) -> ScaleVerdict {
    if let Some(remaining) =
        cooldown_remaining(gate.last_scale_down, rules.scale_down_cooldown, gate.now)
    {
        return ScaleVerdict::no(format!(
            "scale-down cooldown active ({:.0}s remaining)",
            remaining
        ));
    }
    if gate.current_agents <= rules.min_agents {
        return ScaleVerdict::no(format!("at minimum agent count ({})", rules.min_agents));
    }
    if view.severity > Severity::Low {
        return ScaleVerdict::no(format!("{} workload keeps current agents", view.severity));
    }
    if view.latest.queue_length > 0 {
        return ScaleVerdict::no(format!("{} tasks still queued", view.latest.queue_length));
    }

    let window = &view.recent[view.recent.len().saturating_sub(SUSTAINED_WINDOW)..];
    let idle_snapshots = window
        .iter()
        .filter(|s| s.idle_fraction() >= IDLE_FRACTION_FOR_SCALE_DOWN)
        .count();
    if idle_snapshots < SUSTAINED_REQUIRED {
        return ScaleVerdict::no(format!(
            "low load not sustained ({}/{} recent snapshots idle)",
            idle_snapshots,
            window.len()
        ));
    }

    ScaleVerdict::yes(
        1,
        format!(
            "sustained low workload: {}/{} recent snapshots at least {:.0}% idle",
            idle_snapshots,
            window.len(),
            IDLE_FRACTION_FOR_SCALE_DOWN * 100.0
        ),
    )
}

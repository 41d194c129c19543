//! Workload metrics, severity and workload-driven scale rules

mod collector;
mod rules;
mod severity;

pub use collector::{AgentPerformance, WorkloadCollector};
pub use rules::{
    cooldown_remaining, evaluate_scale_down, evaluate_scale_up, ScaleGate, ScaleRules,
    ScaleVerdict, WorkloadView, IDLE_FRACTION_FOR_SCALE_DOWN, SUSTAINED_REQUIRED,
    SUSTAINED_WINDOW,
};
pub use severity::{classify, Severity, SeverityThresholds};

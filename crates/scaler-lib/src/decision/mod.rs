//! Scaling decisions
//!
//! One `ScalingStrategy` per strategy kind, selected once from
//! configuration. Strategies are pure functions of a `DecisionInput`; the
//! `ScalingEngine` owns cooldown state and the scaling-event history.

mod engine;
mod strategies;

pub use engine::{Notifier, ScalingEngine, ScalingEvent};
pub use strategies::{
    AggressiveStrategy, ConservativeStrategy, GpuMemoryStrategy, HybridStrategy, WorkloadStrategy,
};

use crate::config::ScalerConfig;
use crate::gpu::{GpuSummary, MemoryBudget, ModelProfiles};
use crate::workload::{ScaleGate, ScaleRules, WorkloadView};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    Maintain,
}

impl ScalingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingAction::ScaleUp => "scale_up",
            ScalingAction::ScaleDown => "scale_down",
            ScalingAction::Maintain => "maintain",
        }
    }
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy selected at configuration time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    GpuMemory,
    Workload,
    #[default]
    Hybrid,
    Conservative,
    Aggressive,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::GpuMemory => "gpu_memory",
            StrategyKind::Workload => "workload",
            StrategyKind::Hybrid => "hybrid",
            StrategyKind::Conservative => "conservative",
            StrategyKind::Aggressive => "aggressive",
        }
    }

    /// Decision interval used when none is configured
    pub fn default_check_interval_secs(&self) -> u64 {
        match self {
            StrategyKind::Aggressive => 15,
            _ => 20,
        }
    }

    pub fn build(&self, policy: ScalingPolicy) -> Box<dyn ScalingStrategy> {
        match self {
            StrategyKind::GpuMemory => Box::new(GpuMemoryStrategy::new(policy)),
            StrategyKind::Workload => Box::new(WorkloadStrategy::new(policy)),
            StrategyKind::Hybrid => Box::new(HybridStrategy::new(policy)),
            StrategyKind::Conservative => Box::new(ConservativeStrategy::new(policy)),
            StrategyKind::Aggressive => Box::new(AggressiveStrategy::new(policy)),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict of one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: ScalingAction,
    pub target_count: usize,
    /// Enough to reconstruct why the action was chosen
    pub reason: String,
    pub diagnostics: Map<String, Value>,
}

impl Decision {
    pub fn maintain(current: usize, reason: impl Into<String>) -> Self {
        Self::new(ScalingAction::Maintain, current, reason)
    }

    pub fn scale_up(target: usize, reason: impl Into<String>) -> Self {
        Self::new(ScalingAction::ScaleUp, target, reason)
    }

    pub fn scale_down(target: usize, reason: impl Into<String>) -> Self {
        Self::new(ScalingAction::ScaleDown, target, reason)
    }

    fn new(action: ScalingAction, target_count: usize, reason: impl Into<String>) -> Self {
        Self {
            action,
            target_count,
            reason: reason.into(),
            diagnostics: Map::new(),
        }
    }

    pub fn with_diagnostic(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.diagnostics.insert(key.to_string(), value.into());
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Map<String, Value>) -> Self {
        self.diagnostics.extend(diagnostics);
        self
    }
}

/// Timestamps of the last executed scale actions
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CooldownState {
    pub last_scale_up: Option<DateTime<Utc>>,
    pub last_scale_down: Option<DateTime<Utc>>,
}

/// Everything a strategy may look at
#[derive(Debug, Clone)]
pub struct DecisionInput<'a> {
    pub current_agents: usize,
    pub gpu: &'a GpuSummary,
    pub workload: &'a WorkloadView,
    pub cooldown: CooldownState,
    pub now: DateTime<Utc>,
}

impl DecisionInput<'_> {
    pub fn gate(&self) -> ScaleGate {
        ScaleGate {
            current_agents: self.current_agents,
            last_scale_up: self.cooldown.last_scale_up,
            last_scale_down: self.cooldown.last_scale_down,
            now: self.now,
        }
    }
}

/// Configuration slice shared by all strategies
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    pub min_agents: usize,
    pub max_agents: usize,
    /// Percent of memory utilization above which to add an agent
    pub scale_up_memory_percent: f64,
    /// Percent of memory utilization below which to remove one
    pub scale_down_memory_percent: f64,
    pub budget: MemoryBudget,
    /// Recommended memory of the default model
    pub per_agent_memory_mb: u64,
    pub aggressive_batch_size: usize,
    pub fallback_max_agents: usize,
    pub rules: ScaleRules,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self::from_config(&ScalerConfig::default(), &ModelProfiles::builtin())
    }
}

impl ScalingPolicy {
    pub fn from_config(config: &ScalerConfig, profiles: &ModelProfiles) -> Self {
        Self {
            min_agents: config.min_agents,
            max_agents: config.max_agents,
            scale_up_memory_percent: config.scale_up_threshold * 100.0,
            scale_down_memory_percent: config.scale_down_threshold * 100.0,
            budget: MemoryBudget {
                safety_margin: config.memory_safety_margin,
                buffer_mb: config.memory_buffer_mb,
            },
            per_agent_memory_mb: profiles.recommended_memory_mb(&config.default_model),
            aggressive_batch_size: config.aggressive_batch_size.max(1),
            fallback_max_agents: config.fallback_max_agents,
            rules: ScaleRules::from_config(config),
        }
    }

    /// Ceiling applied while GPU telemetry is unavailable
    pub fn fallback_ceiling(&self) -> usize {
        self.fallback_max_agents
            .max(self.min_agents)
            .min(self.max_agents)
    }
}

/// A scaling strategy; implementations must not hold hidden state
pub trait ScalingStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn evaluate(&self, input: &DecisionInput<'_>) -> Decision;
}

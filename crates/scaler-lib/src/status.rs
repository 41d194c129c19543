//! Read-only status report served by the status endpoint

use crate::decision::{CooldownState, ScalingEvent, StrategyKind};
use crate::gpu::GpuSummary;
use crate::lifecycle::{LifecycleInfo, LifecycleState};
use crate::models::{AgentRole, SystemSnapshot};
use crate::workload::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events returned when the caller does not ask for a count
pub const DEFAULT_STATUS_EVENTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub role: AgentRole,
    pub model: String,
    pub state: LifecycleState,
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&LifecycleInfo> for AgentSummary {
    fn from(info: &LifecycleInfo) -> Self {
        Self {
            agent_id: info.agent_id.clone(),
            role: info.role,
            model: info.model.clone(),
            state: info.state,
            last_activity: info.last_activity,
            error: info.error_message.clone(),
        }
    }
}

/// Snapshot of the whole control loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub strategy: StrategyKind,
    /// Agents counted toward the fleet size
    pub agent_count: usize,
    pub effective_agent_count: usize,
    pub pending_creations: usize,
    pub pending_terminations: usize,
    pub agents: Vec<AgentSummary>,
    /// Most recent scaling events, oldest first
    pub recent_events: Vec<ScalingEvent>,
    pub severity: Severity,
    pub latest_snapshot: Option<SystemSnapshot>,
    /// Includes the last telemetry error
    pub gpu: GpuSummary,
    pub cooldown: CooldownState,
}

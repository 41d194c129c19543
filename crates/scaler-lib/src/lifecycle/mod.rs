//! Agent lifecycle management
//!
//! Agents move `creating → initializing → active ⇄ busy ⇄ idle →
//! terminating → terminated`. Any state that is not yet terminated may
//! fall into `error`. Both `terminated` and `error` are terminal.

mod manager;
mod roles;

pub use manager::{
    CreationOutcome, LifecycleManager, LifecycleSettings, LifecycleStatus, RequestTicket,
};
pub use roles::RolePlanner;

use crate::models::AgentRole;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Creating,
    Initializing,
    Active,
    Busy,
    Idle,
    Terminating,
    Terminated,
    Error,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Creating => "creating",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Active => "active",
            LifecycleState::Busy => "busy",
            LifecycleState::Idle => "idle",
            LifecycleState::Terminating => "terminating",
            LifecycleState::Terminated => "terminated",
            LifecycleState::Error => "error",
        }
    }

    pub const ALL: [LifecycleState; 8] = [
        LifecycleState::Creating,
        LifecycleState::Initializing,
        LifecycleState::Active,
        LifecycleState::Busy,
        LifecycleState::Idle,
        LifecycleState::Terminating,
        LifecycleState::Terminated,
        LifecycleState::Error,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Terminated | LifecycleState::Error)
    }

    /// Serving states an agent oscillates between
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            LifecycleState::Active | LifecycleState::Busy | LifecycleState::Idle
        )
    }

    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Error) => true,
            (Creating, Initializing) => true,
            (Initializing, Active) | (Initializing, Terminating) => true,
            (Active | Busy | Idle, Active | Busy | Idle) => *self != next,
            (Active | Busy | Idle, Terminating) => true,
            (Terminating, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle record of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleInfo {
    pub agent_id: String,
    pub role: AgentRole,
    pub model: String,
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
    pub initialized_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub termination_requested_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub creation_reason: String,
    pub termination_reason: Option<String>,
}

impl LifecycleInfo {
    pub fn new(
        agent_id: String,
        role: AgentRole,
        model: String,
        reason: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id,
            role,
            model,
            state: LifecycleState::Creating,
            created_at: now,
            initialized_at: None,
            last_activity: None,
            termination_requested_at: None,
            terminated_at: None,
            error_message: None,
            creation_reason: reason,
            termination_reason: None,
        }
    }

    /// Whether the agent counts toward the fleet size
    ///
    /// An agent whose teardown failed stays counted, since its resources
    /// may still be held.
    pub fn is_counted(&self) -> bool {
        match self.state {
            LifecycleState::Terminated => false,
            LifecycleState::Error => self.termination_requested_at.is_some(),
            _ => true,
        }
    }
}

/// A live agent as returned by the factory
pub trait AgentHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Whether the agent is in the middle of a task
    fn is_busy(&self) -> bool {
        false
    }
}

/// Creates and tears down agents on the backing runtime
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(
        &self,
        agent_id: &str,
        role: AgentRole,
        model: &str,
    ) -> anyhow::Result<Arc<dyn AgentHandle>>;

    /// Returns `false` when the runtime refused the teardown
    async fn terminate(&self, handle: Arc<dyn AgentHandle>) -> anyhow::Result<bool>;
}

//! Core data models for the scaling core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Number of response times kept per agent
pub const RESPONSE_WINDOW: usize = 10;

/// Accelerator vendor, detected once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Unknown,
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "nvidia"),
            GpuVendor::Amd => write!(f, "amd"),
            GpuVendor::Intel => write!(f, "intel"),
            GpuVendor::Unknown => write!(f, "unknown"),
        }
    }
}

/// One physical accelerator as reported by the last poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub vendor: GpuVendor,
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub free_memory_mb: u64,
    pub utilization_percent: f64,
    pub temperature_c: Option<f64>,
    pub power_watts: Option<f64>,
}

impl DeviceInfo {
    /// Memory utilization in percent, bounded to [0, 100]
    pub fn memory_utilization_percent(&self) -> f64 {
        if self.total_memory_mb == 0 {
            return 0.0;
        }
        let used = self.used_memory_mb.min(self.total_memory_mb);
        (used as f64 / self.total_memory_mb as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// Role of a worker agent in the hive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Queen,
    SubQueen,
    Drone,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Queen => "queen",
            AgentRole::SubQueen => "sub_queen",
            AgentRole::Drone => "drone",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One unit of work tracked by the workload collector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub agent_id: Option<String>,
    pub complexity_score: f64,
    pub priority: u8,
    /// Estimated duration in seconds
    pub estimated_duration: f64,
    /// Actual duration in seconds, set on completion
    pub actual_duration: Option<f64>,
    pub status: TaskStatus,
    pub retry_count: u32,
}

impl TaskRecord {
    pub fn new(
        id: impl Into<String>,
        complexity_score: f64,
        priority: u8,
        estimated_duration: f64,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            submitted_at,
            started_at: None,
            completed_at: None,
            agent_id: None,
            complexity_score,
            priority,
            estimated_duration,
            actual_duration: None,
            status: TaskStatus::Pending,
            retry_count: 0,
        }
    }

    /// Seconds spent waiting before start, or so far if still pending
    pub fn wait_time(&self, now: DateTime<Utc>) -> f64 {
        let until = self.started_at.unwrap_or(now);
        seconds_between(self.submitted_at, until)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Overloaded,
    Error,
}

/// Resource usage reported alongside a task completion
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_usage: f64,
    pub memory_usage: f64,
}

/// Metrics-side view of one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub current_task_id: Option<String>,
    pub active_tasks: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Total processing time in seconds
    pub total_processing_time: f64,
    pub last_activity: DateTime<Utc>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub response_times: VecDeque<f64>,
}

impl AgentRecord {
    pub fn new(id: impl Into<String>, role: AgentRole, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            role,
            status: AgentStatus::Idle,
            current_task_id: None,
            active_tasks: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            total_processing_time: 0.0,
            last_activity: now,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            response_times: VecDeque::with_capacity(RESPONSE_WINDOW),
        }
    }

    /// Fraction of finished tasks that succeeded (1.0 before any task)
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            return 1.0;
        }
        self.tasks_completed as f64 / total as f64
    }

    /// Record a response time, evicting the oldest past the window
    pub fn push_response_time(&mut self, seconds: f64) {
        while self.response_times.len() >= RESPONSE_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times.push_back(seconds);
    }

    pub fn average_response_time(&self) -> f64 {
        if self.response_times.is_empty() {
            return 0.0;
        }
        self.response_times.iter().sum::<f64>() / self.response_times.len() as f64
    }
}

/// Point-in-time rollup of task, agent and host metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_agents: usize,
    pub idle_agents: usize,
    pub busy_agents: usize,
    pub overloaded_agents: usize,
    pub error_agents: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub queue_length: usize,
    /// Seconds
    pub average_wait_time: f64,
    /// Seconds
    pub average_processing_time: f64,
    /// Host CPU percent
    pub system_cpu: f64,
    /// Host memory percent
    pub system_memory: f64,
    /// Completions per second over the trailing minute
    pub throughput: f64,
    /// Failures over finished tasks in the trailing five minutes
    pub error_rate: f64,
}

impl SystemSnapshot {
    /// Idle agents over all agents; 1.0 with no agents
    pub fn idle_fraction(&self) -> f64 {
        if self.total_agents == 0 {
            return 1.0;
        }
        self.idle_agents as f64 / self.total_agents as f64
    }

    /// Busy and overloaded agents over all agents
    pub fn active_fraction(&self) -> f64 {
        if self.total_agents == 0 {
            return 0.0;
        }
        (self.busy_agents + self.overloaded_agents) as f64 / self.total_agents as f64
    }

    pub fn overloaded_fraction(&self) -> f64 {
        if self.total_agents == 0 {
            return 0.0;
        }
        self.overloaded_agents as f64 / self.total_agents as f64
    }
}

/// Seconds from `from` to `to`, never negative
pub fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let millis = (to - from).num_milliseconds();
    (millis.max(0) as f64) / 1000.0
}

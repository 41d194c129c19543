//! Error taxonomy for the scaling core
//!
//! None of these are fatal to the process. Callers log them and fall back
//! to maintaining the current fleet.

use thiserror::Error;

/// Errors produced by telemetry, metrics and lifecycle operations
#[derive(Debug, Error)]
pub enum ScalerError {
    /// No accelerator or vendor tool found
    #[error("GPU telemetry unavailable: {0}")]
    TelemetryUnavailable(String),

    /// A single telemetry line or card could not be parsed
    #[error("failed to parse telemetry line {line:?}: {reason}")]
    Parse { line: String, reason: String },

    /// The vendor tool did not answer in time
    #[error("{program} did not respond within {timeout_secs}s")]
    ProbeTimeout { program: String, timeout_secs: u64 },

    /// The vendor tool could not be spawned or exited with an error
    #[error("{program} failed: {reason}")]
    ProbeFailed { program: String, reason: String },

    /// The agent factory failed to create an agent
    #[error("failed to create agent {agent_id}: {reason}")]
    CreationFailure { agent_id: String, reason: String },

    /// The agent factory failed to tear an agent down
    #[error("failed to terminate agent {agent_id}: {reason}")]
    TerminationFailure { agent_id: String, reason: String },

    /// A lifecycle transition not permitted by the state machine
    #[error("agent {agent_id} cannot move from {from} to {to}")]
    InvalidTransition {
        agent_id: String,
        from: String,
        to: String,
    },

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// A task status change that would move backwards
    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTaskTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ScalerError>;

//! Fleet scaling core for multi-agent LLM runners
//!
//! This crate provides:
//! - GPU telemetry across NVIDIA, AMD and Intel tooling
//! - Workload collection and severity classification
//! - Pluggable scaling strategies behind a cooldown-aware engine
//! - Agent lifecycle management through an injected factory
//! - A control loop with health checks, metrics and a status API

pub mod api;
pub mod config;
pub mod control;
pub mod decision;
pub mod error;
pub mod gpu;
pub mod health;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod status;
pub mod workload;

pub use config::ScalerConfig;
pub use control::{ControlHandle, ControlLoop};
pub use decision::{Decision, ScalingAction, ScalingEngine, ScalingEvent, StrategyKind};
pub use error::{Result, ScalerError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use lifecycle::{AgentFactory, AgentHandle, LifecycleManager, LifecycleState};
pub use models::*;
pub use observability::{ScalerMetrics, StructuredLogger};
pub use status::StatusReport;

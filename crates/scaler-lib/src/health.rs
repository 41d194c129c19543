//! Component health for the scaling control loop
//!
//! Each long-running component reports its own status; `/healthz` returns
//! the worst of them and `/readyz` additionally requires the control loop
//! to have started.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still operating, with reduced fidelity (e.g. no GPU telemetry)
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check: DateTime<Utc>,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across components, healthy when there are none
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const RESOURCE_MONITOR: &str = "resource_monitor";
    pub const WORKLOAD_COLLECTOR: &str = "workload_collector";
    pub const DECISION_ENGINE: &str = "decision_engine";
    pub const LIFECYCLE_MANAGER: &str = "lifecycle_manager";

    pub const ALL: &[&str] = &[
        RESOURCE_MONITOR,
        WORKLOAD_COLLECTOR,
        DECISION_ENGINE,
        LIFECYCLE_MANAGER,
    ];
}

/// Shared registry of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component as healthy
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn register_all(&self) {
        for name in components::ALL {
            self.register(name).await;
        }
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components
            .write()
            .await
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.components.read().await.get(name).cloned()
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        HealthResponse {
            status: HealthResponse::compute_status(&components),
            components,
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let health = self.health().await;

        let reason = if !ready {
            Some("Control loop not yet started".to_string())
        } else if !health.status.is_operational() {
            let failing: Vec<&str> = health
                .components
                .iter()
                .filter(|(_, c)| !c.status.is_operational())
                .map(|(name, _)| name.as_str())
                .collect();
            Some(format!("Unhealthy components: {}", failing.join(", ")))
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_register_all_components() {
        let registry = HealthRegistry::new();
        registry.register_all().await;

        let health = registry.health().await;
        assert_eq!(health.components.len(), 4);
        assert_eq!(
            health.components[components::DECISION_ENGINE].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_worst_status_wins() {
        let registry = HealthRegistry::new();
        registry.register_all().await;

        registry
            .set_degraded(components::RESOURCE_MONITOR, "no GPU telemetry")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry
            .set_unhealthy(components::LIFECYCLE_MANAGER, "teardown failed")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);

        let monitor = registry.component(components::RESOURCE_MONITOR).await.unwrap();
        assert_eq!(monitor.message.as_deref(), Some("no GPU telemetry"));
    }

    #[tokio::test]
    async fn test_readiness() {
        let registry = HealthRegistry::new();
        registry.register_all().await;
        assert!(!registry.readiness().await.ready);

        registry.set_ready(true).await;
        registry
            .set_degraded(components::RESOURCE_MONITOR, "no GPU telemetry")
            .await;
        assert!(registry.readiness().await.ready);

        registry
            .set_unhealthy(components::WORKLOAD_COLLECTOR, "stalled")
            .await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.unwrap().contains("workload_collector"));
    }
}

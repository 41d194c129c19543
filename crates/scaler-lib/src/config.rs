//! Scaling configuration
//!
//! Every option has a default so an empty source yields a working setup.
//! The binary layers a config file and `SCALER_*` environment variables on
//! top of these defaults.

use crate::decision::StrategyKind;
use crate::error::{Result, ScalerError};
use crate::gpu::ModelMemoryProfile;
use crate::models::AgentRole;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Recognized scaling options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    pub strategy: StrategyKind,
    pub min_agents: usize,
    pub max_agents: usize,
    /// Memory utilization fraction above which to scale up
    pub scale_up_threshold: f64,
    /// Memory utilization fraction below which to scale down
    pub scale_down_threshold: f64,
    /// Fraction of free memory held back from the agent budget
    pub memory_safety_margin: f64,
    pub memory_buffer_mb: u64,
    /// Decision interval; the strategy picks one when unset
    pub scale_check_interval_seconds: Option<u64>,
    pub scale_up_cooldown_seconds: u64,
    pub scale_down_cooldown_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub init_timeout_seconds: u64,
    pub graceful_shutdown_timeout_seconds: u64,
    pub batch_creation_size: usize,

    pub default_model: String,
    pub role_models: HashMap<AgentRole, String>,
    pub model_profiles: Vec<ModelMemoryProfile>,
    pub monitor_interval_seconds: u64,
    pub collection_interval_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub probe_timeout_seconds: u64,
    pub aggressive_batch_size: usize,
    /// Agent ceiling used when no GPU telemetry is available
    pub fallback_max_agents: usize,
    pub queue_threshold: usize,
    pub wait_time_threshold_seconds: f64,
    pub cpu_threshold_percent: f64,
    pub drones_per_sub_queen: usize,
    pub event_history_size: usize,
    pub snapshot_history_size: usize,
    pub task_history_size: usize,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Hybrid,
            min_agents: 1,
            max_agents: 10,
            scale_up_threshold: 0.75,
            scale_down_threshold: 0.40,
            memory_safety_margin: 0.15,
            memory_buffer_mb: 1024,
            scale_check_interval_seconds: None,
            scale_up_cooldown_seconds: 60,
            scale_down_cooldown_seconds: 120,
            idle_timeout_seconds: 600,
            init_timeout_seconds: 300,
            graceful_shutdown_timeout_seconds: 30,
            batch_creation_size: 3,
            default_model: "llama3.2:3b".to_string(),
            role_models: HashMap::new(),
            model_profiles: Vec::new(),
            monitor_interval_seconds: 10,
            collection_interval_seconds: 5,
            cleanup_interval_seconds: 60,
            probe_timeout_seconds: 5,
            aggressive_batch_size: 5,
            fallback_max_agents: 2,
            queue_threshold: 10,
            wait_time_threshold_seconds: 30.0,
            cpu_threshold_percent: 80.0,
            drones_per_sub_queen: 4,
            event_history_size: 100,
            snapshot_history_size: 720,
            task_history_size: 1000,
        }
    }
}

impl ScalerConfig {
    /// Reject combinations the control loop cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.max_agents == 0 {
            return Err(ScalerError::Config("max_agents must be at least 1".into()));
        }
        if self.min_agents > self.max_agents {
            return Err(ScalerError::Config(format!(
                "min_agents ({}) exceeds max_agents ({})",
                self.min_agents, self.max_agents
            )));
        }
        for (name, value) in [
            ("scale_up_threshold", self.scale_up_threshold),
            ("scale_down_threshold", self.scale_down_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ScalerError::Config(format!(
                    "{} must be within (0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(ScalerError::Config(format!(
                "scale_down_threshold ({}) must be below scale_up_threshold ({})",
                self.scale_down_threshold, self.scale_up_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.memory_safety_margin) {
            return Err(ScalerError::Config(format!(
                "memory_safety_margin must be within [0, 1), got {}",
                self.memory_safety_margin
            )));
        }
        if self.batch_creation_size == 0 {
            return Err(ScalerError::Config(
                "batch_creation_size must be at least 1".into(),
            ));
        }
        if self.drones_per_sub_queen == 0 {
            return Err(ScalerError::Config(
                "drones_per_sub_queen must be at least 1".into(),
            ));
        }
        // Periodic loops cannot tick on a zero period
        for (name, value) in [
            ("scale_check_interval_seconds", self.scale_check_interval().as_secs()),
            ("monitor_interval_seconds", self.monitor_interval_seconds),
            ("collection_interval_seconds", self.collection_interval_seconds),
            ("cleanup_interval_seconds", self.cleanup_interval_seconds),
            ("probe_timeout_seconds", self.probe_timeout_seconds),
        ] {
            if value == 0 {
                return Err(ScalerError::Config(format!("{} must be at least 1", name)));
            }
        }
        Ok(())
    }

    /// Model used for agents of the given role
    pub fn model_for(&self, role: AgentRole) -> &str {
        self.role_models
            .get(&role)
            .map(String::as_str)
            .unwrap_or(&self.default_model)
    }

    pub fn scale_check_interval(&self) -> Duration {
        let secs = self
            .scale_check_interval_seconds
            .unwrap_or_else(|| self.strategy.default_check_interval_secs());
        Duration::from_secs(secs)
    }

    pub fn scale_up_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_up_cooldown_seconds)
    }

    pub fn scale_down_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_down_cooldown_seconds)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds)
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ScalerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.strategy, StrategyKind::Hybrid);
        assert_eq!(config.scale_check_interval(), Duration::from_secs(20));
    }

    #[test]
    fn test_min_above_max_rejected() {
        let config = ScalerConfig {
            min_agents: 5,
            max_agents: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ScalerError::Config(_))));
    }

    #[test]
    fn test_threshold_order_rejected() {
        let config = ScalerConfig {
            scale_up_threshold: 0.3,
            scale_down_threshold: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let configs = [
            ScalerConfig {
                collection_interval_seconds: 0,
                ..Default::default()
            },
            ScalerConfig {
                monitor_interval_seconds: 0,
                ..Default::default()
            },
            ScalerConfig {
                cleanup_interval_seconds: 0,
                ..Default::default()
            },
            ScalerConfig {
                scale_check_interval_seconds: Some(0),
                ..Default::default()
            },
        ];
        for config in configs {
            match config.validate() {
                Err(ScalerError::Config(message)) => {
                    assert!(message.contains("must be at least 1"))
                }
                other => panic!("expected config error, got {:?}", other),
            }
        }

        let unset = ScalerConfig {
            scale_check_interval_seconds: None,
            ..Default::default()
        };
        assert!(unset.validate().is_ok());
    }

    #[test]
    fn test_model_for_role_falls_back_to_default() {
        let mut config = ScalerConfig::default();
        config
            .role_models
            .insert(AgentRole::Queen, "llama3.1:8b".to_string());
        assert_eq!(config.model_for(AgentRole::Queen), "llama3.1:8b");
        assert_eq!(config.model_for(AgentRole::Drone), "llama3.2:3b");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ScalerConfig =
            serde_json::from_str(r#"{"strategy": "aggressive", "max_agents": 8}"#).unwrap();
        assert_eq!(config.strategy, StrategyKind::Aggressive);
        assert_eq!(config.max_agents, 8);
        assert_eq!(config.min_agents, 1);
        assert_eq!(config.scale_check_interval(), Duration::from_secs(15));
    }
}

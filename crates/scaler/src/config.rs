//! Service configuration
//!
//! Scaling options come from an optional file named by `SCALER_CONFIG_FILE`
//! and from `SCALER_*` environment variables, which win over the file.
//! Nested keys use `__`, e.g. `SCALER_ROLE_MODELS__QUEEN`.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use scaler_lib::ScalerConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

const ENV_PREFIX: &str = "SCALER";
const CONFIG_FILE_VAR: &str = "SCALER_CONFIG_FILE";

/// Service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Instance name used in structured logs
    #[serde(default = "default_instance")]
    pub instance: String,

    /// API server port for health, metrics and status
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Orchestrator that hosts the agents; dry-run when unset
    #[serde(default)]
    pub orchestrator_url: Option<String>,

    #[serde(flatten)]
    pub scaling: ScalerConfig,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "hive-scaler".to_string())
}

fn default_api_port() -> u16 {
    8080
}

impl ServiceConfig {
    /// Load configuration from the environment and optional config file
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_VAR).ok();
        Self::from_sources(file.as_deref().map(Path::new), None)
    }

    /// Layer a config file under environment variables
    ///
    /// `env` replaces the process environment when given.
    pub fn from_sources(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: ServiceConfig = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.scaling.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scaler_lib::{AgentRole, StrategyKind};
    use std::io::Write;

    fn no_env() -> Option<HashMap<String, String>> {
        Some(HashMap::new())
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = ServiceConfig::from_sources(None, no_env()).unwrap();

        assert_eq!(config.api_port, 8080);
        assert!(config.orchestrator_url.is_none());
        assert_eq!(config.scaling.strategy, StrategyKind::Hybrid);
        assert_eq!(config.scaling.min_agents, 1);
        assert_eq!(config.scaling.max_agents, 10);
    }

    #[test]
    fn test_file_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
api_port = 9100
orchestrator_url = "http://orchestrator:7000"
strategy = "conservative"
min_agents = 2
max_agents = 6
scale_up_cooldown_seconds = 90

[role_models]
queen = "llama3.1:8b"
"#
        )
        .unwrap();

        let config = ServiceConfig::from_sources(Some(file.path()), no_env()).unwrap();

        assert_eq!(config.api_port, 9100);
        assert_eq!(config.orchestrator_url.as_deref(), Some("http://orchestrator:7000"));
        assert_eq!(config.scaling.strategy, StrategyKind::Conservative);
        assert_eq!(config.scaling.min_agents, 2);
        assert_eq!(config.scaling.max_agents, 6);
        assert_eq!(config.scaling.scale_up_cooldown_seconds, 90);
        assert_eq!(config.scaling.model_for(AgentRole::Queen), "llama3.1:8b");
        assert_eq!(config.scaling.model_for(AgentRole::Drone), "llama3.2:3b");
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "max_agents = 6\nstrategy = \"workload\"").unwrap();

        let env = HashMap::from([
            ("SCALER_MAX_AGENTS".to_string(), "12".to_string()),
            ("SCALER_API_PORT".to_string(), "9200".to_string()),
        ]);
        let config = ServiceConfig::from_sources(Some(file.path()), Some(env)).unwrap();

        assert_eq!(config.scaling.max_agents, 12);
        assert_eq!(config.api_port, 9200);
        assert_eq!(config.scaling.strategy, StrategyKind::Workload);
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let env = HashMap::from([
            ("SCALER_MIN_AGENTS".to_string(), "5".to_string()),
            ("SCALER_MAX_AGENTS".to_string(), "2".to_string()),
        ]);
        assert!(ServiceConfig::from_sources(None, Some(env)).is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let env = HashMap::from([(
            "SCALER_COLLECTION_INTERVAL_SECONDS".to_string(),
            "0".to_string(),
        )]);
        let err = ServiceConfig::from_sources(None, Some(env)).unwrap_err();
        assert!(err.to_string().contains("collection_interval_seconds"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let missing = Path::new("/nonexistent/hive-scaler.toml");
        assert!(ServiceConfig::from_sources(Some(missing), no_env()).is_err());
    }
}

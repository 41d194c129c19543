//! Hive scaler - GPU- and workload-driven agent fleet scaling
//!
//! Runs the control loop next to the orchestrator and serves health,
//! metrics and status over HTTP.

use anyhow::Result;
use scaler_lib::{
    api::{self, AppState},
    lifecycle::AgentFactory,
    observability::StructuredLogger,
    ControlLoop,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod factory;

const ORCHESTRATOR_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting hive-scaler");

    let config = config::ServiceConfig::load()?;
    info!(
        instance = %config.instance,
        strategy = %config.scaling.strategy,
        "Scaler configured"
    );

    let factory: Arc<dyn AgentFactory> = match &config.orchestrator_url {
        Some(url) => {
            info!(orchestrator = %url, "Using orchestrator agent factory");
            Arc::new(factory::HttpAgentFactory::new(url, ORCHESTRATOR_TIMEOUT)?)
        }
        None => {
            info!("No orchestrator configured, running in dry-run mode");
            Arc::new(factory::DryRunFactory)
        }
    };

    let logger = StructuredLogger::new(&config.instance);
    let control = Arc::new(
        ControlLoop::from_config_with_logger(config.scaling.clone(), factory, None, logger).await?,
    );

    let app_state = Arc::new(AppState::new(control.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let handle = control.start().await;

    let reason = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for SIGINT");
            }
            "SIGINT received"
        }
        result = api_handle => {
            match result {
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task failed"),
                Ok(Ok(())) => info!("API server stopped"),
            }
            "API server exited"
        }
    };

    // Agents are torn down on every exit path
    let terminated = handle.stop(reason).await;
    info!(terminated, "Shutdown complete");

    Ok(())
}

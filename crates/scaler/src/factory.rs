//! Agent factories backing the lifecycle manager

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use scaler_lib::{AgentFactory, AgentHandle, AgentRole};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Agent hosted by the orchestrator
pub struct RemoteAgent {
    id: String,
}

impl AgentHandle for RemoteAgent {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Serialize)]
struct CreateAgentRequest<'a> {
    agent_id: &'a str,
    role: AgentRole,
    model: &'a str,
}

/// Creates agents through the orchestrator's HTTP API
///
/// `POST /agents` starts an agent, `DELETE /agents/{id}` stops it.
pub struct HttpAgentFactory {
    client: Client,
    base_url: Url,
}

impl HttpAgentFactory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid orchestrator URL")?;

        Ok(Self { client, base_url })
    }

    fn agents_url(&self, agent_id: Option<&str>) -> Result<Url> {
        let path = match agent_id {
            Some(id) => format!("agents/{}", id),
            None => "agents".to_string(),
        };
        self.base_url.join(&path).context("Invalid path")
    }
}

#[async_trait]
impl AgentFactory for HttpAgentFactory {
    async fn create(
        &self,
        agent_id: &str,
        role: AgentRole,
        model: &str,
    ) -> Result<Arc<dyn AgentHandle>> {
        let url = self.agents_url(None)?;
        let response = self
            .client
            .post(url)
            .json(&CreateAgentRequest { agent_id, role, model })
            .send()
            .await
            .context("Failed to send create request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Orchestrator error ({}): {}", status, body);
        }

        debug!(agent_id = %agent_id, role = %role, "Orchestrator started agent");
        Ok(Arc::new(RemoteAgent {
            id: agent_id.to_string(),
        }))
    }

    async fn terminate(&self, handle: Arc<dyn AgentHandle>) -> Result<bool> {
        let url = self.agents_url(Some(handle.id()))?;
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .context("Failed to send terminate request")?;

        match response.status() {
            status if status.is_success() => Ok(true),
            // Already gone
            StatusCode::NOT_FOUND => Ok(true),
            StatusCode::CONFLICT => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("Orchestrator error ({}): {}", status, body)
            }
        }
    }
}

/// Logs requested changes without starting anything
#[derive(Debug, Default)]
pub struct DryRunFactory;

#[async_trait]
impl AgentFactory for DryRunFactory {
    async fn create(
        &self,
        agent_id: &str,
        role: AgentRole,
        model: &str,
    ) -> Result<Arc<dyn AgentHandle>> {
        info!(agent_id = %agent_id, role = %role, model = %model, "Dry run: would create agent");
        Ok(Arc::new(RemoteAgent {
            id: agent_id.to_string(),
        }))
    }

    async fn terminate(&self, handle: Arc<dyn AgentHandle>) -> Result<bool> {
        info!(agent_id = %handle.id(), "Dry run: would terminate agent");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory(server: &mockito::ServerGuard) -> HttpAgentFactory {
        HttpAgentFactory::new(&format!("{}/", server.url()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_create_posts_agent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/agents")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "agent_id": "drone-1a2b3c4d",
                "role": "drone",
                "model": "llama3.2:3b",
            })))
            .with_status(201)
            .create_async()
            .await;

        let handle = factory(&server)
            .create("drone-1a2b3c4d", AgentRole::Drone, "llama3.2:3b")
            .await
            .unwrap();

        assert_eq!(handle.id(), "drone-1a2b3c4d");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_surfaces_orchestrator_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/agents")
            .with_status(503)
            .with_body("no capacity")
            .create_async()
            .await;

        let err = factory(&server)
            .create("queen-00000000", AgentRole::Queen, "llama3.2:3b")
            .await
            .err()
            .unwrap();

        assert!(err.to_string().contains("no capacity"));
    }

    #[tokio::test]
    async fn test_terminate_statuses() {
        let mut server = mockito::Server::new_async().await;
        server.mock("DELETE", "/agents/a").with_status(204).create_async().await;
        server.mock("DELETE", "/agents/b").with_status(404).create_async().await;
        server.mock("DELETE", "/agents/c").with_status(409).create_async().await;
        server.mock("DELETE", "/agents/d").with_status(500).create_async().await;

        let factory = factory(&server);
        let handle = |id: &str| -> Arc<dyn AgentHandle> {
            Arc::new(RemoteAgent { id: id.to_string() })
        };

        assert!(factory.terminate(handle("a")).await.unwrap());
        assert!(factory.terminate(handle("b")).await.unwrap());
        assert!(!factory.terminate(handle("c")).await.unwrap());
        assert!(factory.terminate(handle("d")).await.is_err());
    }

    #[tokio::test]
    async fn test_dry_run_always_succeeds() {
        let factory = DryRunFactory;
        let handle = factory.create("drone-x", AgentRole::Drone, "m").await.unwrap();
        assert!(factory.terminate(handle).await.unwrap());
    }
}

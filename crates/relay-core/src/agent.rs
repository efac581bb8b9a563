//! Client for the agent worker running inside a sandbox container.
//!
//! The worker exposes `POST /run` on an internal port; the control plane
//! reaches it through the address the sandbox driver publishes. Agent calls
//! are never retried, the prompt may already have had side effects.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::sandbox::ContainerInspect;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent transport error: {0}")]
    Transport(String),
    #[error("agent returned status {0}: {1}")]
    Status(u16, String),
}

/// Resolved address of one container's agent worker.
#[derive(Debug, Clone)]
pub struct AgentEndpoint {
    pub base_url: String,
}

impl AgentEndpoint {
    /// Prefers the published host port (driver and daemon on the same host),
    /// falling back to the container address when both sides share a
    /// network.
    pub fn from_inspect(inspect: &ContainerInspect, internal_port: u16) -> Option<Self> {
        if let Some(host_port) = inspect.host_port_for_internal(internal_port) {
            return Some(Self {
                base_url: format!("http://127.0.0.1:{host_port}"),
            });
        }
        inspect.ip_address.as_ref().map(|ip| Self {
            base_url: format!("http://{ip}:{internal_port}"),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentRunRequest<'a> {
    text: &'a str,
    run_id: Uuid,
}

/// Final payload of one agent invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
    pub final_text: String,
    #[serde(default)]
    pub diff: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub git_commit: Option<String>,
}

#[async_trait]
pub trait AgentClient: Send + Sync + 'static {
    async fn execute(
        &self,
        endpoint: &AgentEndpoint,
        prompt: &str,
        run_id: Uuid,
    ) -> Result<AgentReply, AgentError>;
}

/// HTTP client for the in-container worker. The overall run timeout is
/// enforced by the caller, so only connection establishment is bounded here.
pub struct HttpAgentClient {
    http: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new() -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|err| AgentError::Transport(err.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn execute(
        &self,
        endpoint: &AgentEndpoint,
        prompt: &str,
        run_id: Uuid,
    ) -> Result<AgentReply, AgentError> {
        let url = format!("{}/run", endpoint.base_url);
        let response = self
            .http
            .post(&url)
            .json(&AgentRunRequest {
                text: prompt,
                run_id,
            })
            .send()
            .await
            .map_err(|err| AgentError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Status(status.as_u16(), body));
        }

        response
            .json::<AgentReply>()
            .await
            .map_err(|err| AgentError::Transport(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn endpoint_prefers_published_host_port() {
        let inspect = ContainerInspect {
            image_name: "relay-workspace:latest".into(),
            image_digest: None,
            ip_address: Some("172.17.0.2".into()),
            ports: HashMap::from([(7000, 32801)]),
        };
        let endpoint = AgentEndpoint::from_inspect(&inspect, 7000).unwrap();
        assert_eq!(endpoint.base_url, "http://127.0.0.1:32801");
    }

    #[test]
    fn endpoint_falls_back_to_container_address() {
        let inspect = ContainerInspect {
            image_name: "relay-workspace:latest".into(),
            image_digest: None,
            ip_address: Some("172.17.0.2".into()),
            ports: HashMap::new(),
        };
        let endpoint = AgentEndpoint::from_inspect(&inspect, 7000).unwrap();
        assert_eq!(endpoint.base_url, "http://172.17.0.2:7000");
    }
}

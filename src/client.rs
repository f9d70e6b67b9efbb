//! Agent-side HTTP client for the control plane.

use std::time::Duration;

use anyhow::{Context, Result};
use icmpmon_model::AssignmentsResponse;
use icmpmon_registry::types::CommandResultBody;
use icmpmon_registry::{AgentRegistration, Heartbeat, HeartbeatResponse, RegistrationResponse};
use reqwest::StatusCode;
use uuid::Uuid;

/// Thin typed wrapper over the control-plane API.
#[derive(Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building http client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    pub async fn register(&self, reg: &AgentRegistration) -> Result<Uuid> {
        let response = self
            .request(reqwest::Method::POST, "/api/v1/agents/register")
            .json(reg)
            .send()
            .await
            .context("register request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("register rejected: {}", response.status());
        }
        let body: RegistrationResponse =
            response.json().await.context("register response unparseable")?;
        Ok(body.agent_id)
    }

    pub async fn heartbeat(&self, agent_id: Uuid, hb: &Heartbeat) -> Result<HeartbeatResponse> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/agents/{agent_id}/heartbeat"),
            )
            .json(hb)
            .send()
            .await
            .context("heartbeat request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("heartbeat rejected: {}", response.status());
        }
        Ok(response.json().await.context("heartbeat response unparseable")?)
    }

    /// Polls the agent's schedule. `since` enables the delta short-circuit.
    pub async fn assignments(
        &self,
        agent_id: Uuid,
        since: Option<i64>,
    ) -> Result<AssignmentsResponse> {
        let mut path = format!("/api/v1/agents/{agent_id}/assignments");
        if let Some(since) = since {
            path.push_str(&format!("?since={since}"));
        }

        let response = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .context("assignments request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("assignments rejected: {}", response.status());
        }
        Ok(response
            .json()
            .await
            .context("assignments response unparseable")?)
    }

    pub async fn post_command_result(
        &self,
        agent_id: Uuid,
        command_id: Uuid,
        body: &CommandResultBody,
    ) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/agents/{agent_id}/commands/{command_id}/result"),
            )
            .json(body)
            .send()
            .await
            .context("command result request failed")?;

        if response.status() != StatusCode::OK && response.status() != StatusCode::ACCEPTED {
            anyhow::bail!("command result rejected: {}", response.status());
        }
        Ok(())
    }
}

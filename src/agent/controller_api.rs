use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::controller::agent::{AgentResponse, AgentState};
use crate::errors::check_status;
use crate::kube::AgentProvider;

/// What the agent's loops need from the controller API.
#[async_trait]
pub trait ControllerClient: Send + Sync {
    async fn register_agent(&self, host_name: &str) -> Result<AgentResponse>;

    /// Runner name and state of the agent record, for the watch loop.
    async fn get_agent(&self, id: &str) -> Result<(String, AgentState)>;

    async fn delete_agent(&self, id: &str) -> Result<()>;
}

pub struct ControllerApi {
    http: reqwest::Client,
    provider: Arc<AgentProvider>,
}

impl ControllerApi {
    pub fn new(provider: Arc<AgentProvider>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, provider })
    }
}

/// Agent ids embed `namespace/pod-name`; the slash must ride in a
/// single path segment.
fn escape_id(id: &str) -> String {
    id.replace('%', "%25").replace('/', "%2F")
}

#[async_trait]
impl ControllerClient for ControllerApi {
    async fn register_agent(&self, host_name: &str) -> Result<AgentResponse> {
        let resp = self
            .http
            .post(self.provider.endpoint("api/v1/agent")?)
            .bearer_auth(self.provider.bearer_token().await?)
            .form(&[("hostName", host_name)])
            .send()
            .await
            .context("POST api/v1/agent")?;
        let resp = check_status(resp)?;
        resp.json().await.context("decode agent response")
    }

    async fn get_agent(&self, id: &str) -> Result<(String, AgentState)> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct AgentStatus {
            runner_name: String,
            state: AgentState,
        }

        let resp = self
            .http
            .get(self.provider.endpoint(&format!("api/v1/agent/{}", escape_id(id)))?)
            .bearer_auth(self.provider.bearer_token().await?)
            .send()
            .await
            .with_context(|| format!("GET api/v1/agent/{id}"))?;
        let resp = check_status(resp)?;
        let status: AgentStatus = resp.json().await.context("decode agent status")?;
        Ok((status.runner_name, status.state))
    }

    async fn delete_agent(&self, id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.provider.endpoint(&format!("api/v1/agent/{}", escape_id(id)))?)
            .bearer_auth(self.provider.bearer_token().await?)
            .send()
            .await
            .with_context(|| format!("DELETE api/v1/agent/{id}"))?;
        check_status(resp)?;
        Ok(())
    }
}

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::http::HeaderMap;

use super::agent::{Agent, AgentResponse};
use crate::errors::AppError;
use crate::github::runners::RunnerInstance;

/// What the environment-specific provider promises about shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// When set, the controller leaves agents alone on exit instead of
    /// draining them.
    pub keep_agents_on_exit: bool,
}

/// The caller of the agent API, as established by the provider's
/// authentication: the pod plus the runner metadata it carries.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub namespace: String,
    pub pod_name: String,
    pub group: String,
    pub labels: Vec<String>,
}

impl AgentIdentity {
    pub fn agent_id(&self) -> String {
        format!("{}/{}", self.namespace, self.pod_name)
    }
}

/// Store of agent records. The controller is the sole writer; updates to
/// the same id are serialized, and the updater sees a copy of the record
/// which the store applies atomically.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn agents(&self) -> Result<Vec<Agent>>;

    async fn get(&self, id: &str) -> Result<Option<Agent>>;

    /// Removes the record. Missing ids are not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Applies `updater` to the current record, if any.
    async fn update(&self, id: &str, updater: &(dyn for<'a> Fn(&'a mut Agent) + Send + Sync)) -> Result<()>;
}

/// Environment-specific half of the controller: agent state storage,
/// request authentication, and pod lifecycle hooks.
#[async_trait]
pub trait Provider: Send + Sync {
    fn state(&self) -> Arc<dyn AgentStore>;

    fn capabilities(&self) -> Capabilities;

    /// Establishes the calling pod's identity from request headers.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<AgentIdentity, AppError>;

    /// Creates and persists the agent record for a registering pod.
    /// Fails without touching stored state when the pod is already
    /// registered.
    async fn register_agent(
        &self,
        identity: &AgentIdentity,
        host_name: &str,
        reg_token: &str,
        target_url: &str,
        disable_update: Option<bool>,
    ) -> Result<AgentResponse>;

    /// Per-tick hook: reconciles pod-level bookkeeping against the
    /// resolved runner instance and may itself move the agent to
    /// `Terminating` (e.g. the pod is being deleted).
    async fn check_agent(&self, agent: &Agent, instance: Option<&RunnerInstance>) -> Result<()>;

    /// Tears down the pod behind a terminating agent. A pod that is
    /// already gone counts as success.
    async fn terminate_agent(&self, agent: &Agent) -> Result<()>;
}

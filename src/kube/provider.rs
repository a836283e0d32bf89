use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DeleteParams;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{reflector, store, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::authenticate_pod;
use super::patch::{add_finalizer_patches, annotation_patch, patch_pod};
use super::state::PodAgentStore;
use super::{
    ANNOTATION_DELETION_COST, ANNOTATION_RUNNER_GROUP, ANNOTATION_RUNNER_LABELS,
    ANNOTATION_SAFE_TO_EVICT, LABEL_RUNNER,
};
use crate::controller::agent::{Agent, AgentResponse, AgentState};
use crate::controller::provider::{AgentIdentity, AgentStore, Capabilities, Provider};
use crate::errors::AppError;
use crate::github::runners::RunnerInstance;

/// Kubernetes-backed provider: watches pods labeled as runners, stores
/// agent state in their annotations, and owns their teardown.
pub struct ControllerProvider {
    client: Client,
    store: Arc<PodAgentStore>,
    pods: Store<Pod>,
    writer: Mutex<Option<Writer<Pod>>>,
}

impl ControllerProvider {
    pub async fn new() -> Result<Arc<Self>> {
        let client = Client::try_default()
            .await
            .context("failed to build Kubernetes client")?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Arc<Self> {
        let (pods, writer) = store();
        Arc::new(Self {
            store: Arc::new(PodAgentStore::new(client.clone(), pods.clone())),
            client,
            pods,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Drives the pod reflector until shutdown. Must run for the
    /// provider's pod cache to fill and stay current.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let writer = self
            .writer
            .lock()
            .expect("reflector writer lock poisoned")
            .take()
            .context("pod reflector already running")?;

        let api: Api<Pod> = Api::all(self.client.clone());
        let config = watcher::Config::default().labels(&format!("{LABEL_RUNNER}=true"));
        let mut stream = reflector(writer, watcher(api, config).default_backoff())
            .touched_objects()
            .boxed();

        info!("starting pod reflector");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = stream.next() => match event {
                    Some(Ok(pod)) => {
                        debug!(
                            namespace = pod.metadata.namespace.as_deref().unwrap_or_default(),
                            name = %pod.name_any(),
                            "pod cache updated"
                        );
                    }
                    Some(Err(err)) => warn!(error = %err, "pod watch error"),
                    None => return Ok(()),
                }
            }
        }
    }

    /// Reconciles the pod-level bookkeeping for a bound runner: busy
    /// runners are made expensive to delete and unsafe to evict.
    async fn update_agent_pod(&self, pod: &Pod, is_busy: bool) -> Result<()> {
        let (deletion_cost, safe_to_evict) = if is_busy { ("100", "false") } else { ("", "") };

        let annotations = pod.annotations();
        let current_cost = annotations
            .get(ANNOTATION_DELETION_COST)
            .map(String::as_str)
            .unwrap_or_default();
        let current_evict = annotations
            .get(ANNOTATION_SAFE_TO_EVICT)
            .map(String::as_str)
            .unwrap_or_default();

        let mut patches = vec![];
        if current_cost != deletion_cost {
            patches.push(annotation_patch(ANNOTATION_DELETION_COST, deletion_cost));
        }
        if current_evict != safe_to_evict {
            patches.push(annotation_patch(ANNOTATION_SAFE_TO_EVICT, safe_to_evict));
        }
        patches.extend(add_finalizer_patches(&pod.metadata, super::FINALIZER));

        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        patch_pod(&api, &pod.name_any(), patches).await
    }
}

#[async_trait]
impl Provider for ControllerProvider {
    fn state(&self) -> Arc<dyn AgentStore> {
        self.store.clone()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            keep_agents_on_exit: false,
        }
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<AgentIdentity, AppError> {
        let pod = authenticate_pod(&self.client, &self.pods, headers).await?;

        if pod.labels().get(LABEL_RUNNER).map(String::as_str) != Some("true") {
            return Err(AppError::Unauthorized("unauthorized runner".into()));
        }

        let annotations = pod.annotations();
        Ok(AgentIdentity {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            pod_name: pod.name_any(),
            group: annotations
                .get(ANNOTATION_RUNNER_GROUP)
                .cloned()
                .unwrap_or_default(),
            labels: annotations
                .get(ANNOTATION_RUNNER_LABELS)
                .map(|labels| {
                    labels
                        .split(',')
                        .map(str::trim)
                        .filter(|label| !label.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    async fn register_agent(
        &self,
        identity: &AgentIdentity,
        host_name: &str,
        reg_token: &str,
        target_url: &str,
        disable_update: Option<bool>,
    ) -> Result<AgentResponse> {
        let pod = self
            .store
            .get_pod(&identity.agent_id())
            .with_context(|| format!("pod not found: {}", identity.agent_id()))?;

        let agent = self.store.make_agent(&pod, host_name).await?;

        info!(
            id = %agent.id,
            runner_name = %agent.runner_name,
            url = target_url,
            group = %identity.group,
            labels = ?identity.labels,
            "registered agent"
        );

        Ok(AgentResponse {
            agent,
            target_url: target_url.to_string(),
            token: reg_token.to_string(),
            group: identity.group.clone(),
            labels: identity.labels.clone(),
            disable_update,
        })
    }

    async fn check_agent(&self, agent: &Agent, instance: Option<&RunnerInstance>) -> Result<()> {
        let pod = self
            .store
            .get_pod(&agent.id)
            .with_context(|| format!("failed to get pod: {}", agent.id))?;

        if pod.metadata.deletion_timestamp.is_some() && agent.state != AgentState::Terminating {
            info!(
                namespace = pod.metadata.namespace.as_deref().unwrap_or_default(),
                name = %pod.name_any(),
                "pod is terminating"
            );
            let now = Utc::now();
            return self
                .store
                .update(&agent.id, &|a: &mut Agent| {
                    a.transition(AgentState::Terminating, now);
                })
                .await;
        }

        match instance {
            None => Ok(()),
            Some(instance) => self.update_agent_pod(&pod, instance.is_busy).await,
        }
    }

    async fn terminate_agent(&self, agent: &Agent) -> Result<()> {
        let Some(pod) = self.store.get_pod(&agent.id) else {
            return Ok(());
        };

        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        info!(namespace, name = %pod.name_any(), "deleting pod");

        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(&pod.name_any(), &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to delete pod {}", agent.id)),
        }
    }
}

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, ResourceExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::warn;

use super::patch::{
    add_finalizer_patches, annotation_patch, patch_pod, pod_is_gone, remove_finalizer_patches,
    test_annotation,
};
use super::{ANNOTATION_RUNNER_STATE, FINALIZER};
use crate::controller::agent::Agent;
use crate::controller::provider::AgentStore;

/// Agent store backed by pod annotations.
///
/// The serialized record lives under the runner-state annotation.
/// Updates are applied as a `test` + `add` JSON patch against the old
/// serialization, so a write that lost a race fails and the next
/// reconciliation tick retries from fresh state.
pub struct PodAgentStore {
    client: Client,
    pods: Store<Pod>,
    // One in-flight mutation at a time; the apiserver-side test op
    // still guards against external writers.
    update_lock: tokio::sync::Mutex<()>,
}

impl PodAgentStore {
    pub(crate) fn new(client: Client, pods: Store<Pod>) -> Self {
        Self {
            client,
            pods,
            update_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn get_pod(&self, id: &str) -> Option<Arc<Pod>> {
        let (namespace, name) = id.split_once('/')?;
        self.pods.get(&ObjectRef::new(name).within(namespace))
    }

    fn pod_api(&self, pod: &Pod) -> Api<Pod> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        Api::namespaced(self.client.clone(), namespace)
    }

    pub(crate) fn decode_state(&self, pod: &Pod) -> Option<Agent> {
        let data = pod.annotations().get(ANNOTATION_RUNNER_STATE)?;
        match serde_json::from_str(data) {
            Ok(agent) => Some(agent),
            Err(err) => {
                warn!(
                    namespace = pod.metadata.namespace.as_deref().unwrap_or_default(),
                    name = %pod.name_any(),
                    error = %err,
                    "invalid runner state"
                );
                None
            }
        }
    }

    /// Creates and persists the record for a registering pod. Refuses
    /// when a state annotation already exists.
    pub(crate) async fn make_agent(&self, pod: &Pod, host_name: &str) -> Result<Agent> {
        let mut runner_name = host_name.to_string();
        let owner = pod
            .metadata
            .owner_references
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|reference| reference.controller == Some(true));
        if owner.is_some_and(|reference| reference.kind == "StatefulSet") {
            // Replacement pods reuse the ordinal host name; a random
            // suffix keeps their runner identities distinct.
            runner_name = format!("{runner_name}-{}", random_suffix(5));
        }

        if let Some(agent) = self.decode_state(pod) {
            bail!("pod is already registered as agent: {}", agent.id);
        }

        let id = format!(
            "{}/{}",
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod.name_any()
        );
        let agent = Agent::new(id, runner_name, Utc::now());

        let data = serde_json::to_string(&agent).context("failed to encode agent state")?;
        let mut patches = vec![annotation_patch(ANNOTATION_RUNNER_STATE, &data)];
        patches.extend(add_finalizer_patches(&pod.metadata, FINALIZER));
        patch_pod(&self.pod_api(pod), &pod.name_any(), patches).await?;

        Ok(agent)
    }
}

#[async_trait]
impl AgentStore for PodAgentStore {
    async fn agents(&self) -> Result<Vec<Agent>> {
        let mut agents: Vec<Agent> = self
            .pods
            .state()
            .iter()
            .filter_map(|pod| self.decode_state(pod))
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn get(&self, id: &str) -> Result<Option<Agent>> {
        Ok(self.get_pod(id).and_then(|pod| self.decode_state(&pod)))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let Some(pod) = self.get_pod(id) else {
            return Ok(());
        };

        // The state annotation is kept so the pod cannot re-register
        // while it finishes terminating; only the finalizer goes.
        let patches = remove_finalizer_patches(&pod.metadata, FINALIZER);
        match patch_pod(&self.pod_api(&pod), &pod.name_any(), patches).await {
            Ok(()) => Ok(()),
            Err(err) if pod_is_gone(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn update(&self, id: &str, updater: &(dyn for<'a> Fn(&'a mut Agent) + Send + Sync)) -> Result<()> {
        let _guard = self.update_lock.lock().await;

        let Some(pod) = self.get_pod(id) else {
            return Ok(());
        };
        let Some(current) = self.decode_state(&pod) else {
            return Ok(());
        };

        let mut updated = current.clone();
        updater(&mut updated);

        let old = serde_json::to_string(&current).context("failed to encode agent state")?;
        let new = serde_json::to_string(&updated).context("failed to encode agent state")?;
        if old == new {
            return Ok(());
        }

        let patches = vec![
            test_annotation(ANNOTATION_RUNNER_STATE, &old),
            annotation_patch(ANNOTATION_RUNNER_STATE, &new),
        ];
        match patch_pod(&self.pod_api(&pod), &pod.name_any(), patches).await {
            Ok(()) => Ok(()),
            Err(err) if pod_is_gone(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .take(len)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_suffix_is_lowercase_alphanumeric() {
        let suffix = random_suffix(5);
        assert_eq!(suffix.len(), 5);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn random_suffixes_differ() {
        // Two replacement pods of the same ordinal must get distinct
        // runner names; 5 alphanumeric chars make collisions unlikely
        // enough that equality here means a broken generator.
        assert_ne!(random_suffix(5), random_suffix(5));
    }
}

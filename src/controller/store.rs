use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use super::agent::Agent;
use super::provider::AgentStore;

/// Agent store backed by process memory. The production store lives in
/// pod annotations (`kube::state`); this variant backs local runs and
/// the test double provider.
#[derive(Default)]
pub struct InMemoryAgentStore {
    agents: RwLock<HashMap<String, Agent>>,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record directly, failing if the id is taken.
    pub fn insert(&self, agent: Agent) -> Result<()> {
        let mut agents = self.agents.write().expect("agent store lock poisoned");
        if agents.contains_key(&agent.id) {
            anyhow::bail!("pod is already registered as agent: {}", agent.id);
        }
        agents.insert(agent.id.clone(), agent);
        Ok(())
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn agents(&self) -> Result<Vec<Agent>> {
        let agents = self.agents.read().expect("agent store lock poisoned");
        let mut list: Vec<Agent> = agents.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn get(&self, id: &str) -> Result<Option<Agent>> {
        let agents = self.agents.read().expect("agent store lock poisoned");
        Ok(agents.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut agents = self.agents.write().expect("agent store lock poisoned");
        agents.remove(id);
        Ok(())
    }

    async fn update(&self, id: &str, updater: &(dyn for<'a> Fn(&'a mut Agent) + Send + Sync)) -> Result<()> {
        // The write lock spans read-modify-write, which serializes
        // updates per id (and, coarsely, across ids).
        let mut agents = self.agents.write().expect("agent store lock poisoned");
        if let Some(existing) = agents.get(id) {
            let mut copy = existing.clone();
            updater(&mut copy);
            agents.insert(id.to_string(), copy);
        }
        Ok(())
    }
}

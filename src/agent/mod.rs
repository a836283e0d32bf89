//! The per-pod agent: an executer that owns the runner subprocess and a
//! watcher that follows the controller's view of this agent, joined by
//! a single-value channel so watching strictly follows registration.

pub mod controller_api;
pub mod executer;
pub mod watcher;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use controller_api::ControllerApi;
use executer::Executer;
use watcher::Watcher;

use crate::config::AgentProcessConfig;
use crate::kube::AgentProvider;

pub fn build(config: &AgentProcessConfig, provider: Arc<AgentProvider>) -> Result<(Executer, Watcher)> {
    let api = Arc::new(ControllerApi::new(Arc::clone(&provider))?);
    let (agent_tx, agent_rx) = mpsc::channel(1);

    let executer = Executer::new(config.agent.clone(), api.clone(), provider, agent_tx);
    let watcher = Watcher::new(api, config.agent.watch_interval(), agent_rx);

    Ok((executer, watcher))
}

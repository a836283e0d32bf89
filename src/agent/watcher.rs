use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::controller_api::ControllerClient;
use crate::controller::agent::{Agent, AgentState};
use crate::errors::UnexpectedStatus;
use crate::utils::retry::{retry_with_backoff, RetryBackoff};

/// Watches the agent's own record on the controller and owns the
/// authoritative termination signal.
///
/// The watch ends without a terminate call when the controller already
/// knows (record gone, runner name rebound, or state terminating), and
/// with one when this side initiated it (shutdown or runner exit).
pub struct Watcher {
    api: Arc<dyn ControllerClient>,
    watch_interval: Duration,
    agent_rx: mpsc::Receiver<Agent>,
}

impl Watcher {
    pub fn new(
        api: Arc<dyn ControllerClient>,
        watch_interval: Duration,
        agent_rx: mpsc::Receiver<Agent>,
    ) -> Self {
        Self {
            api,
            watch_interval,
            agent_rx,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let agent = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            agent = self.agent_rx.recv() => match agent {
                Some(agent) => agent,
                None => return Ok(()),
            }
        };

        if self.wait(&agent, &shutdown).await {
            self.terminate(&agent.id).await;
        }
        Ok(())
    }

    /// Polls the record until the watch ends. Returns whether the
    /// record still needs a controller-side terminate call.
    async fn wait(&mut self, agent: &Agent, shutdown: &CancellationToken) -> bool {
        info!(id = %agent.id, "watching agent status");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return true,
                // A closed channel means the runner exited.
                _ = self.agent_rx.recv() => return true,
                _ = sleep(self.watch_interval) => {}
            }

            let (runner_name, state) = match self.api.get_agent(&agent.id).await {
                Ok(status) => status,
                Err(err) if UnexpectedStatus::is_not_found(&err) => {
                    info!(id = %agent.id, "agent not found");
                    return false;
                }
                Err(err) => {
                    warn!(error = %err, "failed to get agent status");
                    continue;
                }
            };

            if runner_name != agent.runner_name {
                info!(id = %agent.id, "runner name mismatched");
                return false;
            }
            if state == AgentState::Terminating {
                info!(id = %agent.id, "terminating agent");
                return false;
            }
        }
    }

    /// Deletes the record, retrying until the controller acknowledges.
    /// A 404 means someone else already cleaned up.
    async fn terminate(&self, id: &str) {
        info!(id, "terminating agent");
        let result = retry_with_backoff(
            RetryBackoff::exponential(Duration::from_secs(5), Duration::from_secs(30)),
            None,
            |_| async {
                match self.api.delete_agent(id).await {
                    Ok(()) => Ok(()),
                    Err(err) if UnexpectedStatus::is_not_found(&err) => Ok(()),
                    Err(err) => Err(err),
                }
            },
            |_, err| warn!(error = %err, id, "failed to terminate agent"),
        )
        .await;

        if let Err(err) = result {
            warn!(error = %err, id, "gave up terminating agent");
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::agent::{Agent, AgentState};
use super::manager_api::ManagerClient;
use super::provider::Provider;
use crate::github::runners::RunnerInstance;
use crate::metrics::ControllerMetrics;

/// Periodic reconciliation of agent records against the manager's
/// runner snapshot.
///
/// Timeout transitions and target-side runner deletion only fire when
/// the observed epoch changed since the last tick, so those decisions
/// are never based on a snapshot older than one full manager pass.
pub struct Monitor {
    sync_interval: Duration,
    transition_timeout: chrono::Duration,
    manager: Arc<dyn ManagerClient>,
    provider: Arc<dyn Provider>,
    metrics: Option<ControllerMetrics>,
}

impl Monitor {
    pub fn new(
        sync_interval: Duration,
        transition_timeout: Duration,
        manager: Arc<dyn ManagerClient>,
        provider: Arc<dyn Provider>,
        metrics: Option<ControllerMetrics>,
    ) -> Self {
        Self {
            sync_interval,
            transition_timeout: chrono::Duration::from_std(transition_timeout)
                .unwrap_or(chrono::Duration::MAX),
            manager,
            provider,
            metrics,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut epoch = 0i64;

        loop {
            self.check(&mut epoch).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.sync_interval) => {}
            }
        }

        if self.provider.capabilities().keep_agents_on_exit {
            return Ok(());
        }

        // Drain: move everything to terminating and keep reconciling
        // until the store is empty.
        loop {
            if self.terminate_all().await {
                info!("all agents terminated");
                return Ok(());
            }

            self.check(&mut epoch).await;
            sleep(self.sync_interval).await;
        }
    }

    async fn terminate_all(&self) -> bool {
        let agents = match self.provider.state().agents().await {
            Ok(agents) => agents,
            Err(err) => {
                warn!(error = %err, "failed to get agents");
                return false;
            }
        };

        if agents.is_empty() {
            return true;
        }

        info!(count = agents.len(), "terminating agents");
        let now = Utc::now();
        for agent in agents {
            if agent.state == AgentState::Terminating {
                continue;
            }
            let result = self
                .provider
                .state()
                .update(&agent.id, &|a: &mut Agent| {
                    a.transition(AgentState::Terminating, now);
                })
                .await;
            if let Err(err) = result {
                warn!(error = %err, id = %agent.id, "failed to terminate agent");
            }
        }
        false
    }

    async fn check(&self, last_epoch: &mut i64) {
        let (epoch, instances) = match self.manager.get_runners().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "failed to get runners");
                return;
            }
        };
        let new_epoch = epoch != *last_epoch;
        *last_epoch = epoch;

        let now = Utc::now();
        let agents = match self.provider.state().agents().await {
            Ok(agents) => agents,
            Err(err) => {
                warn!(error = %err, "failed to get agents");
                return;
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.observe_agents(&agents);
        }

        debug!(count = agents.len(), epoch, "checking agents");
        for agent in &agents {
            let instance = instances
                .get(&agent.runner_name)
                .filter(|instance| match agent.runner_id {
                    None => true,
                    Some(id) => id == instance.id,
                });

            if let Err(err) = self.provider.check_agent(agent, instance).await {
                warn!(error = %err, id = %agent.id, "failed to check agent");
                continue;
            }
            if let Err(err) = self.check_agent(agent, now, new_epoch, instance).await {
                warn!(error = %err, id = %agent.id, "failed to check agent");
            }
        }
    }

    async fn check_agent(
        &self,
        agent: &Agent,
        now: DateTime<Utc>,
        new_epoch: bool,
        instance: Option<&RunnerInstance>,
    ) -> anyhow::Result<()> {
        match agent.state {
            AgentState::Pending => self.check_timeout(agent, now, new_epoch).await,

            AgentState::Configuring => match instance {
                Some(instance) => {
                    let runner_id = instance.id;
                    let online = instance.is_online;
                    self.transition(agent, now, move |a, state_now| {
                        a.runner_id = Some(runner_id);
                        if online {
                            a.transition(AgentState::Ready, state_now);
                        } else {
                            a.transition(AgentState::Starting, state_now);
                        }
                    })
                    .await
                }
                None => self.check_timeout(agent, now, new_epoch).await,
            },

            AgentState::Starting => match instance {
                None => {
                    info!(id = %agent.id, "agent is gone");
                    self.transition(agent, now, |a, state_now| {
                        a.transition(AgentState::Terminating, state_now);
                    })
                    .await
                }
                Some(instance) if instance.is_online => {
                    self.transition(agent, now, |a, state_now| {
                        a.transition(AgentState::Ready, state_now);
                    })
                    .await
                }
                Some(_) => self.check_timeout(agent, now, new_epoch).await,
            },

            AgentState::Ready => match instance {
                None => {
                    info!(id = %agent.id, "agent is gone");
                    self.transition(agent, now, |a, state_now| {
                        a.transition(AgentState::Terminating, state_now);
                    })
                    .await
                }
                Some(instance) if !instance.is_online => {
                    info!(id = %agent.id, "agent is offline");
                    self.transition(agent, now, |a, state_now| {
                        a.transition(AgentState::Starting, state_now);
                    })
                    .await
                }
                Some(_) => Ok(()),
            },

            AgentState::Terminating => {
                let mut dead = true;
                if let Some(instance) = instance {
                    dead = false;
                    if new_epoch {
                        info!(
                            runner_id = instance.id,
                            runner_name = %instance.name,
                            "deleting runner"
                        );
                        match self.manager.delete_runner(instance.id).await {
                            Ok(()) => dead = true,
                            Err(err) => {
                                if now - agent.last_transition_time > self.transition_timeout {
                                    warn!(
                                        error = %err,
                                        id = %agent.id,
                                        "failed to delete runner, abandoning agent"
                                    );
                                    dead = true;
                                }
                            }
                        }
                    }
                }

                if let Err(err) = self.provider.terminate_agent(agent).await {
                    info!(error = %err, id = %agent.id, "failed to terminate agent");
                    dead = false;
                }

                if dead {
                    info!(id = %agent.id, "cleaning up agent");
                    self.provider.state().delete(&agent.id).await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn check_timeout(
        &self,
        agent: &Agent,
        now: DateTime<Utc>,
        new_epoch: bool,
    ) -> anyhow::Result<()> {
        if now - agent.last_transition_time < self.transition_timeout {
            return Ok(());
        }
        // Wait for a fresh epoch to confirm the timeout.
        if !new_epoch {
            return Ok(());
        }

        info!(id = %agent.id, runner_name = %agent.runner_name, "agent timed out");
        self.transition(agent, now, |a, state_now| {
            a.transition(AgentState::Terminating, state_now);
        })
        .await
    }

    async fn transition<F>(&self, agent: &Agent, now: DateTime<Utc>, apply: F) -> anyhow::Result<()>
    where
        F: Fn(&mut Agent, DateTime<Utc>) + Send + Sync,
    {
        debug!(id = %agent.id, "agent state transition");
        self.provider
            .state()
            .update(&agent.id, &|a: &mut Agent| apply(a, now))
            .await
    }
}

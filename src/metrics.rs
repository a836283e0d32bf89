//! Prometheus metrics exposed by the manager and controller servers.

use anyhow::{Context, Result};
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::controller::agent::{Agent, AgentState};
use crate::github::runners::RunnerSnapshot;

/// Gauges fed by the runner synchronizer on every published snapshot.
#[derive(Clone)]
pub struct ManagerMetrics {
    epoch: IntGauge,
    runners: IntGauge,
    online: IntGauge,
    busy: IntGauge,
}

impl ManagerMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let epoch = IntGauge::new(
            "runner_sync_epoch",
            "Epoch of the last completed runner synchronization pass",
        )?;
        let runners = IntGauge::new("runners_total", "Runners in the last snapshot")?;
        let online = IntGauge::new("runners_online", "Online runners in the last snapshot")?;
        let busy = IntGauge::new("runners_busy", "Busy runners in the last snapshot")?;

        registry
            .register(Box::new(epoch.clone()))
            .context("register runner_sync_epoch")?;
        registry
            .register(Box::new(runners.clone()))
            .context("register runners_total")?;
        registry
            .register(Box::new(online.clone()))
            .context("register runners_online")?;
        registry
            .register(Box::new(busy.clone()))
            .context("register runners_busy")?;

        Ok(Self {
            epoch,
            runners,
            online,
            busy,
        })
    }

    pub fn observe_snapshot(&self, snapshot: &RunnerSnapshot) {
        self.epoch.set(snapshot.epoch);
        self.runners.set(snapshot.instances.len() as i64);
        self.online.set(
            snapshot
                .instances
                .values()
                .filter(|instance| instance.is_online)
                .count() as i64,
        );
        self.busy.set(
            snapshot
                .instances
                .values()
                .filter(|instance| instance.is_busy)
                .count() as i64,
        );
    }
}

/// Per-state agent gauges fed by the controller's reconciliation loop.
#[derive(Clone)]
pub struct ControllerMetrics {
    agents: IntGaugeVec,
}

impl ControllerMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let agents = IntGaugeVec::new(
            Opts::new("runner_agents", "Registered agents by state"),
            &["state"],
        )?;
        registry
            .register(Box::new(agents.clone()))
            .context("register runner_agents")?;
        Ok(Self { agents })
    }

    pub fn observe_agents(&self, agents: &[Agent]) {
        for state in AgentState::ALL {
            let count = agents.iter().filter(|agent| agent.state == state).count();
            self.agents
                .with_label_values(&[state.as_str()])
                .set(count as i64);
        }
    }
}

/// Renders a registry in the text exposition format.
pub fn render(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("failed to encode metrics")?;
    String::from_utf8(buffer).context("metrics are not valid UTF-8")
}

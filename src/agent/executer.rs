use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::controller_api::ControllerClient;
use crate::controller::agent::{Agent, AgentResponse};
use crate::config::AgentConfig;
use crate::kube::AgentProvider;

const REGISTER_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const CONFIGURE_RETRIES: usize = 10;

/// Owns the runner subprocess: registers with the controller, runs the
/// configure script against the registration token, then supervises the
/// run script to exit.
///
/// The agent record is handed to the watcher over `agent_tx`; dropping
/// the sender after a clean runner exit is the watcher's signal to
/// terminate the record.
pub struct Executer {
    config: AgentConfig,
    api: Arc<dyn ControllerClient>,
    provider: Arc<AgentProvider>,
    agent_tx: Option<mpsc::Sender<Agent>>,
}

impl Executer {
    pub fn new(
        config: AgentConfig,
        api: Arc<dyn ControllerClient>,
        provider: Arc<AgentProvider>,
        agent_tx: mpsc::Sender<Agent>,
    ) -> Self {
        Self {
            config,
            api,
            provider,
            agent_tx: Some(agent_tx),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.execute(&shutdown).await;
        // Once registered, the controller decides when this pod dies.
        self.provider.halt(&shutdown).await;
        Ok(())
    }

    async fn execute(&mut self, shutdown: &CancellationToken) {
        let host_name = match host_name() {
            Ok(name) => name,
            Err(err) => {
                error!(error = %err, "failed to get hostname");
                return;
            }
        };

        info!(runner_name = %host_name, "registering agent");
        let response = loop {
            match self.api.register_agent(&host_name).await {
                Ok(response) => break response,
                Err(err) => error!(error = %err, "failed to register agent"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(REGISTER_RETRY_INTERVAL) => {}
            }
        };

        self.provider.on_registered();
        if let Some(tx) = &self.agent_tx {
            let _ = tx.send(response.agent.clone()).await;
        }

        info!(
            target = %response.target_url,
            group = %response.group,
            labels = ?response.labels,
            "configuring runner"
        );
        if let Err(err) = self.configure(shutdown, &response).await {
            error!(error = %err, "failed to configure runner");
            return;
        }

        info!("starting runner");
        match self.start(shutdown).await {
            Ok(status) if status.success() => info!("runner exited"),
            Ok(status) => {
                error!(code = ?status.code(), "runner exited abnormally");
                return;
            }
            Err(err) => {
                error!(error = %err, "failed to start runner");
                return;
            }
        }

        // Closing the channel tells the watcher the runner is done.
        self.agent_tx.take();
    }

    fn setup_runner_cmd(&self, cmd: &mut Command) {
        cmd.current_dir(&self.config.runner_dir);
        // Own process group, so SIGINT reaches the runner and all of
        // its job processes.
        #[cfg(unix)]
        cmd.process_group(0);
    }

    async fn configure(
        &self,
        shutdown: &CancellationToken,
        response: &AgentResponse,
    ) -> Result<()> {
        let mut retry = CONFIGURE_RETRIES;
        loop {
            let mut cmd = Command::new(self.config.configure_script());
            cmd.args([
                "--unattended",
                "--replace",
                "--ephemeral",
                "--name",
                &response.agent.runner_name,
                "--url",
                &response.target_url,
                "--token",
                &response.token,
                "--work",
                &self.config.work_dir,
            ]);
            if !response.group.is_empty() {
                cmd.args(["--runnergroup", &response.group]);
            }
            if !response.labels.is_empty() {
                cmd.args(["--labels", &response.labels.join(",")]);
            }
            self.setup_runner_cmd(&mut cmd);

            debug!(script = self.config.configure_script(), "starting configure script");
            let result = self.run_in_group(cmd, shutdown).await;
            match result {
                Ok(status) if status.success() => return Ok(()),
                Ok(status) if retry > 0 => {
                    warn!(code = ?status.code(), "failed to configure runner");
                    retry -= 1;
                }
                Ok(status) => anyhow::bail!("configure script failed: {status}"),
                Err(err) if retry > 0 => {
                    warn!(error = %err, "failed to configure runner");
                    retry -= 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn start(&self, shutdown: &CancellationToken) -> Result<ExitStatus> {
        let mut cmd = Command::new(self.config.run_script());
        self.setup_runner_cmd(&mut cmd);

        debug!(script = self.config.run_script(), "starting run script");
        self.run_in_group(cmd, shutdown).await
    }

    /// Runs the command, delivering SIGINT to its process group on
    /// cancellation and waiting for it to exit either way.
    async fn run_in_group(
        &self,
        mut cmd: Command,
        shutdown: &CancellationToken,
    ) -> Result<ExitStatus> {
        let mut child = cmd.spawn().context("failed to spawn script")?;
        let pid = child.id();

        tokio::select! {
            status = child.wait() => Ok(status?),
            _ = shutdown.cancelled() => {
                info!("interrupting runner");
                if let Some(pid) = pid {
                    interrupt_group(pid);
                }
                Ok(child.wait().await?)
            }
        }
    }
}

#[cfg(unix)]
fn interrupt_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGINT) {
        warn!(pid, error = %err, "failed to interrupt process group");
    }
}

#[cfg(not(unix))]
fn interrupt_group(_pid: u32) {}

#[cfg(unix)]
fn host_name() -> Result<String> {
    let name = nix::unistd::gethostname().context("failed to get hostname")?;
    let name = name.to_string_lossy().into_owned();
    Ok(name.strip_suffix(".local").unwrap_or(&name).to_string())
}

#[cfg(not(unix))]
fn host_name() -> Result<String> {
    std::env::var("COMPUTERNAME").context("failed to get hostname")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn host_name_resolves() {
        let name = host_name().unwrap();
        assert!(!name.is_empty());
        assert!(!name.ends_with(".local"));
    }
}

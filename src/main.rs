use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use runner_manager::agent;
use runner_manager::api;
use runner_manager::config::{self, AgentProcessConfig, ControllerProcessConfig, ManagerConfig};
use runner_manager::controller::manager_api::{ManagerApi, ManagerClient};
use runner_manager::controller::monitor::Monitor;
use runner_manager::controller::server::{self as controller_server, ControllerApiState};
use runner_manager::github::client::GithubClient;
use runner_manager::github::reg_token::RegistrationTokenStore;
use runner_manager::github::runners::synchronizer::Synchronizer;
use runner_manager::github::{new_target, Target};
use runner_manager::kube::{AgentProvider, ControllerProvider};
use runner_manager::metrics::{ControllerMetrics, ManagerMetrics};
use runner_manager::runtime::{bind, TaskGroup};

#[derive(Parser)]
#[command(name = "runner-manager", version, about)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Log level filter when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mirror the target's runners and serve the manager API.
    Manager,
    /// Reconcile runner pods against the manager's snapshot.
    Controller,
    /// Register this pod and supervise its runner process.
    Agent,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Manager => run_manager(&cli.config).await,
        Command::Controller => run_controller(&cli.config).await,
        Command::Agent => run_agent(&cli.config).await,
    }
}

async fn run_manager(config_path: &std::path::Path) -> Result<()> {
    let config: ManagerConfig = config::load(config_path)?;

    let registry = prometheus::Registry::new();
    let metrics = ManagerMetrics::new(&registry)?;

    let client = GithubClient::new(&config.github).context("cannot set up GitHub client")?;
    let target: Arc<dyn Target> =
        new_target(client, &config.github.target_url).context("cannot set up GitHub target")?;

    let synchronizer = Arc::new(Synchronizer::new(
        &config.github.runners,
        Arc::clone(&target),
        metrics,
    ));

    let mut group = TaskGroup::new();

    group.spawn("runner-sync", {
        let synchronizer = Arc::clone(&synchronizer);
        let shutdown = group.shutdown();
        async move { synchronizer.run(shutdown).await }
    });

    if !config.api.disabled {
        let state = api::ApiState {
            runners: synchronizer.state(),
            target: Arc::clone(&target),
            reg_token: Arc::new(RegistrationTokenStore::new(Arc::clone(&target))),
            registry,
        };
        let router = api::router(state, config.api.auth_keys.clone());
        let listener = bind(config.api.addr()).await?;
        let shutdown = group.shutdown();
        group.spawn("api-server", async move { api::serve(listener, router, shutdown).await });
    }

    group.run().await
}

async fn run_controller(config_path: &std::path::Path) -> Result<()> {
    let config: ControllerProcessConfig = config::load(config_path)?;
    let config = config.controller;

    let registry = prometheus::Registry::new();
    let metrics = ControllerMetrics::new(&registry)?;

    let provider = ControllerProvider::new()
        .await
        .context("failed to init controller")?;
    let manager: Arc<dyn ManagerClient> = Arc::new(ManagerApi::new(&config)?);

    let monitor = Monitor::new(
        config.sync_interval(),
        config.transition_timeout(),
        Arc::clone(&manager),
        provider.clone(),
        Some(metrics),
    );

    let state = ControllerApiState {
        provider: provider.clone(),
        manager,
        registry,
        disable_update: config.disable_update,
    };
    let router = controller_server::router(state);
    let listener = bind(config.addr()).await?;

    let mut group = TaskGroup::new();

    group.spawn("pod-reflector", {
        let provider = provider.clone();
        let shutdown = group.shutdown();
        async move { provider.run(shutdown).await }
    });

    group.spawn("monitor", {
        let shutdown = group.shutdown();
        async move { monitor.run(shutdown).await }
    });

    group.spawn("api-server", {
        let shutdown = group.shutdown();
        async move { controller_server::serve(listener, router, shutdown).await }
    });

    group.run().await
}

async fn run_agent(config_path: &std::path::Path) -> Result<()> {
    let config: AgentProcessConfig = config::load(config_path)?;

    let provider = Arc::new(AgentProvider::new(&config).context("failed to init agent")?);
    let (executer, watcher) = agent::build(&config, provider)?;

    let mut group = TaskGroup::new();

    group.spawn("executer", {
        let shutdown = group.shutdown();
        async move { executer.run(shutdown).await }
    });

    group.spawn("watcher", {
        let shutdown = group.shutdown();
        async move { watcher.run(shutdown).await }
    });

    group.run().await
}

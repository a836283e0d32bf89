//! Process runtime: named long-lived tasks under one cancellation
//! token. The first task error cancels the rest; SIGINT/SIGTERM cancel
//! everything and the process exits once every task has returned.

use anyhow::{Context, Result};
use std::future::Future;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct TaskGroup {
    tasks: JoinSet<(&'static str, Result<()>)>,
    shutdown: CancellationToken,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token shared by every task in this group.
    pub fn shutdown(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, future: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.spawn(async move { (name, future.await) });
    }

    /// Runs until every task finished. Returns the first task error,
    /// if any.
    pub async fn run(mut self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("exiting...");
            shutdown.cancel();
        });

        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(task = name, "task finished"),
                Ok((name, Err(err))) => {
                    error!(task = name, error = %err, "task failed");
                    if first_error.is_none() {
                        first_error = Some(err.context(format!("task {name} failed")));
                    }
                    self.shutdown.cancel();
                }
                Err(err) => {
                    error!(error = %err, "task panicked");
                    if first_error.is_none() {
                        first_error = Some(anyhow::Error::new(err).context("task panicked"));
                    }
                    self.shutdown.cancel();
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            None
        }
    };

    match terminate.as_mut() {
        Some(terminate) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => log_ctrl_c(result),
                _ = terminate.recv() => {}
            }
        }
        None => log_ctrl_c(tokio::signal::ctrl_c().await),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    log_ctrl_c(tokio::signal::ctrl_c().await);
}

fn log_ctrl_c(result: std::io::Result<()>) {
    if let Err(err) = result {
        warn!(error = %err, "failed to listen for Ctrl-C");
    }
}

/// Binds a listener up front so address errors are startup failures.
pub async fn bind(addr: &str) -> Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn group_waits_for_all_tasks() {
        let mut group = TaskGroup::new();
        group.spawn("a", async { Ok(()) });
        group.spawn("b", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        });
        group.run().await.unwrap();
    }

    #[tokio::test]
    async fn first_error_cancels_the_group_and_is_returned() {
        let mut group = TaskGroup::new();
        let token = group.shutdown();
        group.spawn("looper", async move {
            token.cancelled().await;
            Ok(())
        });
        group.spawn("failer", async { anyhow::bail!("boom") });

        let err = group.run().await.unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
    }

    #[tokio::test]
    async fn cancelling_the_token_stops_loopers() {
        let mut group = TaskGroup::new();
        let token = group.shutdown();
        group.spawn("looper", {
            let token = token.clone();
            async move {
                token.cancelled().await;
                Ok(())
            }
        });

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), group.run())
            .await
            .expect("group should stop")
            .unwrap();
    }
}

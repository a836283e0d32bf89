use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::AgentProcessConfig;

/// Pod-side provider for the agent process: locates the controller and
/// presents the pod's projected service-account token.
pub struct AgentProvider {
    base: Url,
    token_path: PathBuf,
    should_halt: AtomicBool,
}

impl AgentProvider {
    pub fn new(config: &AgentProcessConfig) -> Result<Self> {
        let base = Url::parse(&config.controller_url)
            .with_context(|| format!("invalid controller URL: {}", config.controller_url))?;
        Ok(Self {
            base,
            token_path: config.token_path.clone(),
            should_halt: AtomicBool::new(false),
        })
    }

    /// Once registered, the controller owns pod deletion; the process
    /// must stay up until told to stop.
    pub fn on_registered(&self) {
        self.should_halt.store(true, Ordering::SeqCst);
    }

    /// Blocks until cancellation when a registration happened, so the
    /// pod is torn down by the controller rather than by process exit.
    pub async fn halt(&self, shutdown: &CancellationToken) {
        if self.should_halt.load(Ordering::SeqCst) {
            shutdown.cancelled().await;
        }
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("invalid controller path: {path}"))
    }

    /// The projected token is rotated by the kubelet; read it fresh for
    /// every request.
    pub(crate) async fn bearer_token(&self) -> Result<String> {
        let token = tokio::fs::read_to_string(&self.token_path)
            .await
            .with_context(|| format!("failed to read token: {}", self.token_path.display()))?;
        Ok(token.trim().to_string())
    }
}

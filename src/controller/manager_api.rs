use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::config::ControllerConfig;
use crate::errors::check_status;
use crate::github::runners::RunnerInstance;

/// What the controller needs from the manager's HTTP API.
#[async_trait]
pub trait ManagerClient: Send + Sync {
    /// Current registration token and the target URL it belongs to.
    async fn get_registration_token(&self) -> Result<(String, String)>;

    /// Latest snapshot: epoch plus instances keyed by runner name.
    async fn get_runners(&self) -> Result<(i64, HashMap<String, RunnerInstance>)>;

    /// Removes a runner from the target via the manager.
    async fn delete_runner(&self, id: i64) -> Result<()>;
}

pub struct ManagerApi {
    http: reqwest::Client,
    base: Url,
    key: String,
}

impl ManagerApi {
    pub fn new(config: &ControllerConfig) -> Result<Self> {
        let base = Url::parse(&config.manager_url)
            .with_context(|| format!("invalid manager URL: {}", config.manager_url))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base,
            key: config.manager_auth_key.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("invalid manager path: {path}"))
    }
}

#[async_trait]
impl ManagerClient for ManagerApi {
    async fn get_registration_token(&self) -> Result<(String, String)> {
        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
            url: String,
        }

        let resp = self
            .http
            .get(self.endpoint("/api/v1/token")?)
            .bearer_auth(&self.key)
            .send()
            .await
            .context("GET /api/v1/token")?;
        let resp = check_status(resp)?;
        let decoded: TokenResponse = resp.json().await.context("decode /api/v1/token")?;
        Ok((decoded.token, decoded.url))
    }

    async fn get_runners(&self) -> Result<(i64, HashMap<String, RunnerInstance>)> {
        #[derive(Deserialize)]
        struct RunnersResponse {
            epoch: i64,
            #[serde(default)]
            runners: Vec<RunnerInstance>,
        }

        let resp = self
            .http
            .get(self.endpoint("/api/v1/runners")?)
            .bearer_auth(&self.key)
            .send()
            .await
            .context("GET /api/v1/runners")?;
        let resp = check_status(resp)?;
        let decoded: RunnersResponse = resp.json().await.context("decode /api/v1/runners")?;

        let instances = decoded
            .runners
            .into_iter()
            .map(|instance| (instance.name.clone(), instance))
            .collect();
        Ok((decoded.epoch, instances))
    }

    async fn delete_runner(&self, id: i64) -> Result<()> {
        let resp = self
            .http
            .delete(self.endpoint(&format!("/api/v1/runners/{id}"))?)
            .bearer_auth(&self.key)
            .send()
            .await
            .with_context(|| format!("DELETE /api/v1/runners/{id}"))?;
        check_status(resp)?;
        Ok(())
    }
}

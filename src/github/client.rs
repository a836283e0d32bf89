use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::{AuthConfig, GithubConfig};
use crate::errors::check_status;
use crate::utils::ratelimit::RateLimiter;

const API_BASE: &str = "https://api.github.com";

/// Authenticated REST client for the target API. All calls pass the
/// token-bucket limiter before hitting the wire and are bounded by the
/// configured request timeout.
pub struct GithubClient {
    http: reqwest::Client,
    base: Url,
    limiter: RateLimiter,
}

impl GithubClient {
    pub fn new(config: &GithubConfig) -> Result<Self> {
        let AuthConfig::Token { token } = &config.auth;

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("invalid auth token")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("runner-manager"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.http_timeout())
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base: Url::parse(API_BASE).expect("static API base URL"),
            limiter: RateLimiter::new(config.rps(), config.burst()),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("invalid API path: {path}"))
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        self.limiter.acquire().await;
        let resp = self
            .http
            .get(self.endpoint(path)?)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        let resp = check_status(resp)?;
        resp.json().await.with_context(|| format!("decode {path}"))
    }

    pub(crate) async fn post_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.limiter.acquire().await;
        let resp = self
            .http
            .post(self.endpoint(path)?)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        let resp = check_status(resp)?;
        resp.json().await.with_context(|| format!("decode {path}"))
    }

    pub(crate) async fn delete(&self, path: &str) -> Result<()> {
        self.limiter.acquire().await;
        let resp = self
            .http
            .delete(self.endpoint(path)?)
            .send()
            .await
            .with_context(|| format!("DELETE {path}"))?;
        check_status(resp)?;
        Ok(())
    }
}

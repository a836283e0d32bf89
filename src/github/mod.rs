//! Client side of the target: URL resolution, the runners API, and the
//! registration-token cache.

pub mod client;
pub mod reg_token;
pub mod runners;
pub mod types;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use url::Url;

use client::GithubClient;
use types::{RegistrationTokenPayload, RunnerPayload, RunnersPage};

/// A repository or organization the runners are registered against.
#[async_trait]
pub trait Target: Send + Sync {
    /// Canonical URL the runner binary registers against.
    fn url(&self) -> String;

    /// One page of registered runners, plus the next page number when
    /// the listing is not yet exhausted.
    async fn get_runners(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<RunnerPayload>, Option<u32>)>;

    /// Mints a short-lived registration token.
    async fn get_registration_token(&self) -> Result<RegistrationTokenPayload>;

    /// Removes a registered runner by id.
    async fn delete_runner(&self, id: i64) -> Result<()>;
}

/// Resolves a target URL (`https://github.com/owner/repo` or
/// `https://github.com/org`) into the matching [`Target`] variant.
pub fn new_target(client: GithubClient, target_url: &str) -> Result<Arc<dyn Target>> {
    let url = Url::parse(target_url).with_context(|| format!("invalid target URL: {target_url}"))?;
    if url.scheme() != "https" || url.host_str() != Some("github.com") {
        bail!("unsupported target URL: {target_url}");
    }

    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    let client = Arc::new(client);
    match segments.as_slice() {
        [owner, name] => Ok(Arc::new(RepositoryTarget {
            client,
            owner: (*owner).to_string(),
            name: (*name).to_string(),
        })),
        [org] => Ok(Arc::new(OrganizationTarget {
            client,
            name: (*org).to_string(),
        })),
        _ => bail!("unsupported target URL: {target_url}"),
    }
}

pub struct RepositoryTarget {
    client: Arc<GithubClient>,
    owner: String,
    name: String,
}

#[async_trait]
impl Target for RepositoryTarget {
    fn url(&self) -> String {
        format!("https://github.com/{}/{}", self.owner, self.name)
    }

    async fn get_runners(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<RunnerPayload>, Option<u32>)> {
        let path = format!("/repos/{}/{}/actions/runners", self.owner, self.name);
        list_runners(&self.client, &path, page, page_size).await
    }

    async fn get_registration_token(&self) -> Result<RegistrationTokenPayload> {
        let path = format!(
            "/repos/{}/{}/actions/runners/registration-token",
            self.owner, self.name
        );
        self.client.post_json(&path).await
    }

    async fn delete_runner(&self, id: i64) -> Result<()> {
        let path = format!("/repos/{}/{}/actions/runners/{id}", self.owner, self.name);
        self.client.delete(&path).await
    }
}

pub struct OrganizationTarget {
    client: Arc<GithubClient>,
    name: String,
}

#[async_trait]
impl Target for OrganizationTarget {
    fn url(&self) -> String {
        format!("https://github.com/{}", self.name)
    }

    async fn get_runners(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<RunnerPayload>, Option<u32>)> {
        let path = format!("/orgs/{}/actions/runners", self.name);
        list_runners(&self.client, &path, page, page_size).await
    }

    async fn get_registration_token(&self) -> Result<RegistrationTokenPayload> {
        let path = format!("/orgs/{}/actions/runners/registration-token", self.name);
        self.client.post_json(&path).await
    }

    async fn delete_runner(&self, id: i64) -> Result<()> {
        let path = format!("/orgs/{}/actions/runners/{id}", self.name);
        self.client.delete(&path).await
    }
}

async fn list_runners(
    client: &GithubClient,
    path: &str,
    page: u32,
    page_size: u32,
) -> Result<(Vec<RunnerPayload>, Option<u32>)> {
    let listing: RunnersPage = client
        .get_json(
            path,
            &[("per_page", page_size.to_string()), ("page", page.to_string())],
        )
        .await?;

    // The endpoint reports the total count; there is a next page while
    // the pages seen so far cannot have covered it.
    let seen = i64::from(page) * i64::from(page_size);
    let next_page = (seen < listing.total_count).then(|| page + 1);

    Ok((listing.runners, next_page))
}

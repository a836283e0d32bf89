//! Layered process configuration: one TOML file per process, overridden
//! by `MANAGER__*` environment variables (double underscore between
//! nesting levels, e.g. `MANAGER__GITHUB__TARGET_URL`). Unknown keys are
//! ignored; missing or invalid required keys abort startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Environment, File, FileFormat};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use validator::{Validate, ValidationError};

const ENV_PREFIX: &str = "MANAGER";

pub fn load<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Validate,
{
    let raw = config::Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to read config from {}", path.display()))?;

    let parsed: T = raw
        .try_deserialize()
        .context("failed to decode config")?;
    parsed.validate().context("invalid config")?;
    Ok(parsed)
}

/// Configuration of the manager process.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ManagerConfig {
    #[validate(nested)]
    pub github: GithubConfig,
    #[serde(default)]
    #[validate(nested)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct GithubConfig {
    #[validate(url)]
    pub target_url: String,
    pub rps: Option<f64>,
    pub burst: Option<u32>,
    pub http_timeout_secs: Option<u64>,
    pub auth: AuthConfig,
    #[serde(default)]
    #[validate(nested)]
    pub runners: RunnersConfig,
}

impl GithubConfig {
    pub fn rps(&self) -> f64 {
        self.rps.unwrap_or(1.0)
    }

    pub fn burst(&self) -> u32 {
        self.burst.unwrap_or(60)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.unwrap_or(10))
    }
}

/// Authentication against the target. Only personal access tokens are
/// supported; any other `type` fails config decoding at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    Token { token: String },
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct RunnersConfig {
    pub sync_interval_secs: Option<u64>,
    #[validate(range(min = 1, max = 100))]
    pub sync_page_size: Option<u32>,
}

impl RunnersConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.unwrap_or(10))
    }

    pub fn sync_page_size(&self) -> u32 {
        self.sync_page_size.unwrap_or(100)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[validate(schema(function = "validate_api_config"))]
pub struct ApiConfig {
    #[serde(default)]
    pub disabled: bool,
    pub addr: Option<String>,
    #[serde(default)]
    pub auth_keys: Vec<String>,
}

impl ApiConfig {
    pub fn addr(&self) -> &str {
        self.addr.as_deref().unwrap_or("127.0.0.1:8002")
    }
}

fn validate_api_config(config: &ApiConfig) -> Result<(), ValidationError> {
    if !config.disabled && config.auth_keys.is_empty() {
        return Err(ValidationError::new("auth_keys")
            .with_message("api.auth_keys must be set unless api.disabled".into()));
    }
    Ok(())
}

/// Configuration of the controller process.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ControllerProcessConfig {
    #[validate(nested)]
    pub controller: ControllerConfig,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ControllerConfig {
    #[validate(url)]
    pub manager_url: String,
    #[validate(length(min = 1))]
    pub manager_auth_key: String,
    pub addr: Option<String>,
    pub sync_interval_secs: Option<u64>,
    pub transition_timeout_secs: Option<u64>,
    pub disable_update: Option<bool>,
}

impl ControllerConfig {
    pub fn addr(&self) -> &str {
        self.addr.as_deref().unwrap_or("127.0.0.1:8007")
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.unwrap_or(5))
    }

    pub fn transition_timeout(&self) -> Duration {
        Duration::from_secs(self.transition_timeout_secs.unwrap_or(60))
    }
}

/// Configuration of the per-pod agent process.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AgentProcessConfig {
    #[validate(url)]
    pub controller_url: String,
    pub token_path: PathBuf,
    #[validate(nested)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AgentConfig {
    #[validate(length(min = 1))]
    pub runner_dir: String,
    #[validate(length(min = 1))]
    pub work_dir: String,
    pub configure_script: Option<String>,
    pub run_script: Option<String>,
    pub watch_interval_secs: Option<u64>,
}

impl AgentConfig {
    pub fn configure_script(&self) -> &str {
        self.configure_script.as_deref().unwrap_or("./config.sh")
    }

    pub fn run_script(&self) -> &str {
        self.run_script.as_deref().unwrap_or("./run.sh")
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs.unwrap_or(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode<T: DeserializeOwned + Validate>(toml: &str) -> Result<T> {
        let raw = config::Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        let parsed: T = raw.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    #[test]
    fn manager_config_defaults() {
        let config: ManagerConfig = decode(
            r#"
            [github]
            target_url = "https://github.com/acme/widgets"

            [github.auth]
            type = "token"
            token = "ghp_testtoken"

            [api]
            auth_keys = ["k1"]
            "#,
        )
        .unwrap();

        assert_eq!(config.github.rps(), 1.0);
        assert_eq!(config.github.burst(), 60);
        assert_eq!(config.github.http_timeout(), Duration::from_secs(10));
        assert_eq!(config.github.runners.sync_interval(), Duration::from_secs(10));
        assert_eq!(config.github.runners.sync_page_size(), 100);
        assert_eq!(config.api.addr(), "127.0.0.1:8002");
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config: ManagerConfig = decode(
            r#"
            [github]
            target_url = "https://github.com/acme/widgets"

            [github.auth]
            type = "token"
            token = "ghp_testtoken"

            [api]
            auth_keys = ["k1"]

            [dashboard]
            addr = "127.0.0.1:8001"

            [slack]
            disabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.github.target_url, "https://github.com/acme/widgets");
    }

    #[test]
    fn missing_target_url_is_rejected() {
        let result: Result<ManagerConfig> = decode(
            r#"
            [github.auth]
            type = "token"
            token = "ghp_testtoken"

            [api]
            auth_keys = ["k1"]
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_auth_type_is_rejected() {
        let result: Result<ManagerConfig> = decode(
            r#"
            [github]
            target_url = "https://github.com/acme/widgets"

            [github.auth]
            type = "kerberos"

            [api]
            auth_keys = ["k1"]
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn api_requires_keys_unless_disabled() {
        let result: Result<ManagerConfig> = decode(
            r#"
            [github]
            target_url = "https://github.com/acme/widgets"

            [github.auth]
            type = "token"
            token = "ghp_testtoken"
            "#,
        );
        assert!(result.is_err());

        let config: ManagerConfig = decode(
            r#"
            [github]
            target_url = "https://github.com/acme/widgets"

            [github.auth]
            type = "token"
            token = "ghp_testtoken"

            [api]
            disabled = true
            "#,
        )
        .unwrap();
        assert!(config.api.disabled);
    }

    #[test]
    fn controller_config_defaults() {
        let config: ControllerProcessConfig = decode(
            r#"
            [controller]
            manager_url = "http://manager:8002"
            manager_auth_key = "k1"
            "#,
        )
        .unwrap();

        assert_eq!(config.controller.addr(), "127.0.0.1:8007");
        assert_eq!(config.controller.sync_interval(), Duration::from_secs(5));
        assert_eq!(
            config.controller.transition_timeout(),
            Duration::from_secs(60)
        );
        assert_eq!(config.controller.disable_update, None);
    }

    #[test]
    fn agent_config_defaults() {
        let config: AgentProcessConfig = decode(
            r#"
            controller_url = "https://controller:8007"
            token_path = "/var/run/secrets/tokens/manager"

            [agent]
            runner_dir = "/runner"
            work_dir = "/runner/_work"
            "#,
        )
        .unwrap();

        assert_eq!(config.agent.configure_script(), "./config.sh");
        assert_eq!(config.agent.run_script(), "./run.sh");
        assert_eq!(config.agent.watch_interval(), Duration::from_secs(5));
    }

    #[test]
    fn sync_page_size_bounds() {
        let result: Result<ManagerConfig> = decode(
            r#"
            [github]
            target_url = "https://github.com/acme/widgets"

            [github.auth]
            type = "token"
            token = "ghp_testtoken"

            [github.runners]
            sync_page_size = 500

            [api]
            auth_keys = ["k1"]
            "#,
        );
        assert!(result.is_err());
    }
}

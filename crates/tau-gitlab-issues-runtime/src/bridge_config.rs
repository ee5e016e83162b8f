//! TOML configuration for the GitLab issue bridge.
//!
//! ```toml
//! [bridge]
//! comment_grace_period_ms = 500
//!
//! [matrix]
//! homeserver_url = "https://matrix.example.com"
//! server_name = "example.com"
//! as_token = "..."
//! hs_token = "..."
//!
//! [gitlab.instances.main]
//! url = "https://gitlab.example.com"
//! webhook_secret = "..."
//! ```

use std::{collections::BTreeMap, path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tau_gitlab_issues::{
    canonical_issue_url, GitlabIssueConnectionState, DEFAULT_LEDGER_MIN_RETENTION,
};

use crate::appservice_identity::{CredentialDirectory, CredentialRecord};

pub const DEFAULT_COMMENT_GRACE_PERIOD_MS: u64 = 500;
pub const DEFAULT_LEDGER_CAPACITY: usize = 10_000;
pub const DEFAULT_USER_PREFIX: &str = "_gitlab_";

fn default_comment_grace_period_ms() -> u64 {
    DEFAULT_COMMENT_GRACE_PERIOD_MS
}

fn default_ledger_capacity() -> usize {
    DEFAULT_LEDGER_CAPACITY
}

fn default_ledger_min_retention_secs() -> u64 {
    DEFAULT_LEDGER_MIN_RETENTION.as_secs()
}

fn default_user_prefix() -> String {
    DEFAULT_USER_PREFIX.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeSection {
    #[serde(default = "default_comment_grace_period_ms")]
    pub comment_grace_period_ms: u64,
    /// `0` keeps every ledger entry for the lifetime of the process.
    #[serde(default = "default_ledger_capacity")]
    pub ledger_capacity: usize,
    #[serde(default = "default_ledger_min_retention_secs")]
    pub ledger_min_retention_secs: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            comment_grace_period_ms: default_comment_grace_period_ms(),
            ledger_capacity: default_ledger_capacity(),
            ledger_min_retention_secs: default_ledger_min_retention_secs(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatrixSection {
    pub homeserver_url: String,
    pub server_name: String,
    pub as_token: String,
    pub hs_token: String,
    #[serde(default = "default_user_prefix")]
    pub user_prefix: String,
}

impl std::fmt::Debug for MatrixSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixSection")
            .field("homeserver_url", &self.homeserver_url)
            .field("server_name", &self.server_name)
            .field("as_token", &"<redacted>")
            .field("hs_token", &"<redacted>")
            .field("user_prefix", &self.user_prefix)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitlabInstanceConfig {
    pub url: String,
    pub webhook_secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitlabSection {
    #[serde(default)]
    pub instances: BTreeMap<String, GitlabInstanceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialEntry {
    pub matrix_user: String,
    pub instance_url: String,
    pub token: String,
    #[serde(default)]
    pub revoked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionEntry {
    pub room_id: String,
    #[serde(default)]
    pub state_key: Option<String>,
    pub state: GitlabIssueConnectionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bridge: BridgeSection,
    pub matrix: MatrixSection,
    #[serde(default)]
    pub gitlab: GitlabSection,
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
    #[serde(default)]
    pub connections: Vec<ConnectionEntry>,
}

fn require_non_empty(value: &str, key: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("config key '{key}' cannot be empty");
    }
    Ok(())
}

fn require_http_url(value: &str, key: &str) -> Result<()> {
    require_non_empty(value, key)?;
    let parsed = reqwest::Url::parse(value.trim())
        .with_context(|| format!("config key '{key}' is not a valid url"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("config key '{key}' must use http or https");
    }
    Ok(())
}

pub fn load_bridge_config(path: &Path) -> Result<BridgeConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read bridge config {}", path.display()))?;
    BridgeConfig::from_toml_str(&raw)
        .with_context(|| format!("invalid bridge config {}", path.display()))
}

impl BridgeConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        require_http_url(&self.matrix.homeserver_url, "matrix.homeserver_url")?;
        require_non_empty(&self.matrix.server_name, "matrix.server_name")?;
        require_non_empty(&self.matrix.as_token, "matrix.as_token")?;
        require_non_empty(&self.matrix.hs_token, "matrix.hs_token")?;
        if self.bridge.ledger_capacity > 0 && self.bridge.ledger_min_retention_secs == 0 {
            bail!(
                "config key 'bridge.ledger_min_retention_secs' must be positive when \
                 'bridge.ledger_capacity' bounds the ledger"
            );
        }
        if self.gitlab.instances.is_empty() {
            bail!("config key 'gitlab.instances' must declare at least one instance");
        }
        for (name, instance) in &self.gitlab.instances {
            require_http_url(&instance.url, &format!("gitlab.instances.{name}.url"))?;
            require_non_empty(
                &instance.webhook_secret,
                &format!("gitlab.instances.{name}.webhook_secret"),
            )?;
        }
        for (index, credential) in self.credentials.iter().enumerate() {
            require_non_empty(
                &credential.matrix_user,
                &format!("credentials[{index}].matrix_user"),
            )?;
            require_http_url(
                &credential.instance_url,
                &format!("credentials[{index}].instance_url"),
            )?;
            if !credential.revoked {
                require_non_empty(&credential.token, &format!("credentials[{index}].token"))?;
            }
        }
        for (index, connection) in self.connections.iter().enumerate() {
            if !connection.room_id.trim().starts_with('!') {
                bail!("config key 'connections[{index}].room_id' must be a Matrix room id");
            }
            if !self.gitlab.instances.contains_key(&connection.state.instance) {
                bail!(
                    "config key 'connections[{index}].state.instance' names unknown gitlab \
                     instance '{}'",
                    connection.state.instance
                );
            }
            if let Some(state_key) = connection.state_key.as_deref() {
                require_non_empty(state_key, &format!("connections[{index}].state_key"))?;
            }
        }
        Ok(())
    }

    pub fn comment_grace_period(&self) -> Duration {
        Duration::from_millis(self.bridge.comment_grace_period_ms)
    }

    pub fn ledger_min_retention(&self) -> Duration {
        Duration::from_secs(self.bridge.ledger_min_retention_secs)
    }

    pub fn instance(&self, name: &str) -> Option<&GitlabInstanceConfig> {
        self.gitlab.instances.get(name)
    }

    /// Explicit state key, or the canonical issue URL on the connection's instance.
    pub fn connection_state_key(&self, connection: &ConnectionEntry) -> Option<String> {
        if let Some(state_key) = connection.state_key.as_deref() {
            return Some(state_key.trim().to_string());
        }
        let instance = self.instance(&connection.state.instance)?;
        Some(canonical_issue_url(
            &instance.url,
            &connection.state.projects,
            connection.state.iid,
        ))
    }

    pub fn credential_directory(&self) -> CredentialDirectory {
        let mut directory = CredentialDirectory::new();
        for credential in &self.credentials {
            directory.insert(
                &credential.matrix_user,
                &credential.instance_url,
                CredentialRecord {
                    token: Some(credential.token.clone()),
                    revoked: credential.revoked,
                },
            );
        }
        directory
    }
}

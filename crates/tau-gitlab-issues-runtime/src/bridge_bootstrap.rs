//! Wiring of configured collaborators and connections.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tau_gitlab_issues::{CommentLedger, InMemoryCommentLedger, PlainBodyRenderer};

use crate::appservice_identity::AppserviceIdentityResolver;
use crate::bridge_config::BridgeConfig;
use crate::connection_registry::ConnectionRegistry;
use crate::gitlab_api_client::GitlabApiClient;
use crate::gitlab_issue_connection::{
    GitlabIssueConnection, GitlabIssueConnectionConfig, GitlabIssueConnectionDeps,
};
use crate::matrix_delivery_client::MatrixDeliveryClient;

pub fn build_comment_ledger(config: &BridgeConfig) -> Arc<dyn CommentLedger> {
    if config.bridge.ledger_capacity == 0 {
        return Arc::new(InMemoryCommentLedger::new());
    }
    Arc::new(InMemoryCommentLedger::with_capacity(
        config.bridge.ledger_capacity,
        config.ledger_min_retention(),
    ))
}

/// Collaborators backed by the configured homeserver and GitLab REST API.
pub fn build_bridge_deps(config: &BridgeConfig) -> Result<GitlabIssueConnectionDeps> {
    let identity = AppserviceIdentityResolver::new(
        &config.matrix.server_name,
        &config.matrix.user_prefix,
        config.credential_directory(),
    )?;
    let sink = MatrixDeliveryClient::with_defaults(
        &config.matrix.homeserver_url,
        &config.matrix.as_token,
    )?;
    let tracker = GitlabApiClient::with_defaults()?;
    Ok(GitlabIssueConnectionDeps {
        ledger: build_comment_ledger(config),
        identity: Arc::new(identity),
        sink: Arc::new(sink),
        tracker: Arc::new(tracker),
        renderer: Arc::new(PlainBodyRenderer),
    })
}

/// Builds one connection per `[[connections]]` entry, sharing `deps`. The
/// configured state is the starting point; call
/// [`ConnectionRegistry::restore_persisted_states`] to load what the rooms hold.
pub fn build_connection_registry(
    config: &BridgeConfig,
    deps: &GitlabIssueConnectionDeps,
) -> Result<ConnectionRegistry> {
    let registry = ConnectionRegistry::new();
    for (index, entry) in config.connections.iter().enumerate() {
        let instance = config.instance(&entry.state.instance).ok_or_else(|| {
            anyhow!(
                "connections[{index}] names unknown gitlab instance '{}'",
                entry.state.instance
            )
        })?;
        let state_key = config
            .connection_state_key(entry)
            .with_context(|| format!("connections[{index}] has no state key"))?;
        let mut connection_config = GitlabIssueConnectionConfig::new(instance.url.as_str());
        connection_config.comment_grace_period = config.comment_grace_period();
        registry.register(Arc::new(GitlabIssueConnection::new(
            entry.room_id.trim(),
            entry.state.clone(),
            state_key,
            connection_config,
            deps.clone(),
        )));
    }
    Ok(registry)
}

//! Identity mapping between GitLab users and application-service puppets.
//!
//! GitLab authors are represented in rooms by virtual users named
//! `@{prefix}{localpart}:{server_name}`. Room users post to GitLab with a
//! personal token registered in the [`CredentialDirectory`]; revoked or blank
//! tokens resolve to no credentials so the connection fails closed.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::bridge_collaborators::{IdentityResolver, RoomIdentity, TrackerActor, TrackerCredentials};

#[derive(Debug, Clone, Default)]
pub struct CredentialRecord {
    pub token: Option<String>,
    pub revoked: bool,
}

#[derive(Debug, Clone, Default)]
/// Room user id → GitLab instance URL → credential record.
pub struct CredentialDirectory {
    users: BTreeMap<String, BTreeMap<String, CredentialRecord>>,
}

fn normalize_instance_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn resolve_non_empty_value(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl CredentialDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, matrix_user: &str, instance_url: &str, record: CredentialRecord) {
        self.users
            .entry(matrix_user.trim().to_string())
            .or_default()
            .insert(normalize_instance_url(instance_url), record);
    }

    pub fn len(&self) -> usize {
        self.users.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resolve(&self, matrix_user: &str, instance_url: &str) -> Option<TrackerCredentials> {
        let record = self
            .users
            .get(matrix_user.trim())?
            .get(&normalize_instance_url(instance_url))?;
        if record.revoked {
            return None;
        }
        resolve_non_empty_value(record.token.as_deref()).map(|token| TrackerCredentials { token })
    }
}

/// Encodes a GitLab username as a Matrix localpart.
///
/// Allowed characters pass through lowercased; everything else becomes `=xx`
/// per byte.
pub fn sanitize_localpart(raw: &str) -> String {
    let mut localpart = String::with_capacity(raw.len());
    for byte in raw.trim().bytes() {
        let lowered = byte.to_ascii_lowercase();
        if lowered.is_ascii_lowercase()
            || lowered.is_ascii_digit()
            || matches!(lowered, b'.' | b'_' | b'-' | b'/')
        {
            localpart.push(char::from(lowered));
        } else {
            localpart.push_str(&format!("={byte:02x}"));
        }
    }
    localpart
}

#[derive(Debug, Clone)]
pub struct AppserviceIdentityResolver {
    server_name: String,
    user_prefix: String,
    credentials: CredentialDirectory,
}

impl AppserviceIdentityResolver {
    pub fn new(
        server_name: &str,
        user_prefix: &str,
        credentials: CredentialDirectory,
    ) -> Result<Self> {
        let server_name = server_name.trim();
        if server_name.is_empty() {
            bail!("matrix server_name cannot be empty");
        }
        Ok(Self {
            server_name: server_name.to_string(),
            user_prefix: user_prefix.trim().to_string(),
            credentials,
        })
    }

    pub fn puppet_user_id(&self, username: &str) -> String {
        format!(
            "@{}{}:{}",
            self.user_prefix,
            sanitize_localpart(username),
            self.server_name
        )
    }
}

#[async_trait]
impl IdentityResolver for AppserviceIdentityResolver {
    async fn resolve_room_identity(&self, actor: &TrackerActor) -> Result<RoomIdentity> {
        if actor.username.trim().is_empty() {
            bail!("gitlab actor '{}' has no username", actor.display_name);
        }
        Ok(RoomIdentity {
            user_id: self.puppet_user_id(&actor.username),
            display_name: resolve_non_empty_value(Some(actor.display_name.as_str())),
            avatar_url: actor.avatar_url.clone(),
        })
    }

    async fn resolve_tracker_credentials(
        &self,
        room_actor_id: &str,
        instance_url: &str,
    ) -> Result<Option<TrackerCredentials>> {
        let credentials = self.credentials.resolve(room_actor_id, instance_url);
        if credentials.is_none() {
            tracing::debug!(
                sender = %room_actor_id,
                instance = %instance_url,
                "no gitlab credentials registered"
            );
        }
        Ok(credentials)
    }

    fn is_bridge_user(&self, user_id: &str) -> bool {
        user_id
            .strip_prefix('@')
            .and_then(|rest| rest.strip_prefix(self.user_prefix.as_str()))
            .and_then(|rest| rest.rsplit_once(':'))
            .is_some_and(|(localpart, server)| !localpart.is_empty() && server == self.server_name)
    }
}

//! Connection bridging one GitLab issue with one Matrix room.
//!
//! Two event sources feed a connection: GitLab webhooks (tracker → room) and
//! Matrix room events (room → tracker). Neither is ordered with respect to the
//! other, so a comment posted from the room comes back as a webhook. The
//! comment ledger suppresses that echo:
//!
//! - room → tracker: after GitLab returns the new note id, the ledger entry for
//!   it is marked immediately (unless echo is explicitly allowed);
//! - tracker → room: webhooks carrying the `repository` origin marker wait a
//!   grace period first, giving a concurrent post time to mark the ledger. The
//!   author's virtual user is then prepared in the room, and the note id is
//!   test-and-set in the ledger before delivery.
//!
//! The grace period is a heuristic. A GitLab `create note` call that takes
//! longer than the grace period still lets the echo through.

use std::{
    fmt,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tau_gitlab_issues::{
    is_cleared_state_content, BodyRenderer, CommentLedger, GitlabIssueConnectionState,
    GitlabIssueWebhookEvent, GitlabNoteWebhookEvent, MatrixRoomEvent,
    GITLAB_ISSUE_CANONICAL_EVENT_TYPE, GITLAB_ISSUE_EVENT_TYPES, MATRIX_ROOM_MESSAGE_EVENT_TYPE,
    NOT_BRIDGED_ANNOTATION, RESYNC_COMMAND,
};

use crate::bridge_collaborators::{
    DeliverySink, IdentityResolver, RoomMetadataField, TrackerActor, TrackerClient,
};

pub const DEFAULT_COMMENT_GRACE_PERIOD: Duration = Duration::from_millis(500);

#[derive(Clone)]
/// Shared collaborators handed to every connection.
pub struct GitlabIssueConnectionDeps {
    pub ledger: Arc<dyn CommentLedger>,
    pub identity: Arc<dyn IdentityResolver>,
    pub sink: Arc<dyn DeliverySink>,
    pub tracker: Arc<dyn TrackerClient>,
    pub renderer: Arc<dyn BodyRenderer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitlabIssueConnectionConfig {
    /// Base URL of the GitLab instance named by the connection state.
    pub instance_url: String,
    pub comment_grace_period: Duration,
}

impl GitlabIssueConnectionConfig {
    pub fn new(instance_url: impl Into<String>) -> Self {
        Self {
            instance_url: instance_url.into().trim_end_matches('/').to_string(),
            comment_grace_period: DEFAULT_COMMENT_GRACE_PERIOD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundCommentOutcome {
    Delivered { event_id: Option<String> },
    Duplicate,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommentOutcome {
    Posted { comment_id: String },
    NotBridged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueEditOutcome {
    Updated {
        room_name: bool,
        lifecycle_state: bool,
    },
    NoChanges,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEventOutcome {
    Comment(OutboundCommentOutcome),
    ReservedCommand { command: String },
    Ignored,
}

pub struct GitlabIssueConnection {
    room_id: String,
    state_key: String,
    config: GitlabIssueConnectionConfig,
    state: RwLock<GitlabIssueConnectionState>,
    deps: GitlabIssueConnectionDeps,
}

impl GitlabIssueConnection {
    pub fn new(
        room_id: impl Into<String>,
        state: GitlabIssueConnectionState,
        state_key: impl Into<String>,
        config: GitlabIssueConnectionConfig,
        deps: GitlabIssueConnectionDeps,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            state_key: state_key.into(),
            config,
            state: RwLock::new(state),
            deps,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn state_key(&self) -> &str {
        &self.state_key
    }

    pub fn instance_url(&self) -> &str {
        &self.config.instance_url
    }

    /// Snapshot of the current connection state.
    pub fn state(&self) -> GitlabIssueConnectionState {
        self.read_state().clone()
    }

    pub fn issue_number(&self) -> u64 {
        self.read_state().iid
    }

    pub fn project_path(&self) -> String {
        self.read_state().project_path()
    }

    pub fn is_interested_in_state_event(&self, event_type: &str, state_key: &str) -> bool {
        GITLAB_ISSUE_EVENT_TYPES.contains(&event_type) && self.state_key == state_key
    }

    pub fn matches_issue(&self, instance: &str, path_with_namespace: &str, iid: u64) -> bool {
        self.read_state()
            .matches_issue(instance, path_with_namespace, iid)
    }

    /// Reloads state from a room-state event addressed to this connection.
    /// The issue identity must not change; other fields are last-write-wins.
    pub fn apply_state_content(&self, content: &Value) -> Result<()> {
        let incoming: GitlabIssueConnectionState = serde_json::from_value(content.clone())
            .with_context(|| format!("invalid {GITLAB_ISSUE_CANONICAL_EVENT_TYPE} content"))?;
        let mut state = self.write_state();
        if incoming.instance != state.instance
            || incoming.projects != state.projects
            || incoming.iid != state.iid
        {
            bail!(
                "state event for {}/{}#{} does not describe connection {}",
                incoming.instance,
                incoming.projects,
                incoming.iid,
                self.state_key
            );
        }
        *state = incoming;
        Ok(())
    }

    /// Reloads the state an earlier run persisted in the room. Returns `false`
    /// when the room holds none and the current state stays in effect.
    pub async fn restore_persisted_state(&self) -> Result<bool> {
        let persisted = self
            .deps
            .sink
            .get_room_state(&self.room_id, GITLAB_ISSUE_CANONICAL_EVENT_TYPE, &self.state_key)
            .await
            .with_context(|| format!("failed to read connection state from {}", self.room_id))?;
        let Some(content) = persisted.filter(|content| !is_cleared_state_content(content)) else {
            return Ok(false);
        };
        self.apply_state_content(&content)?;
        let lifecycle_state = self.state().state;
        tracing::info!(
            connection = %self,
            lifecycle_state = %lifecycle_state,
            "restored persisted connection state"
        );
        Ok(true)
    }

    /// Mirrors a GitLab note into the room, at most once per note id.
    pub async fn on_comment_created(
        &self,
        event: &GitlabNoteWebhookEvent,
    ) -> Result<InboundCommentOutcome> {
        let state = self.state();
        let same_issue = event.is_issue_note()
            && event.issue_iid() == Some(state.iid)
            && state.projects.matches_str(&event.project.path_with_namespace);
        if !same_issue {
            tracing::debug!(
                connection = %self,
                project = %event.project.path_with_namespace,
                noteable_type = %event.object_attributes.noteable_type,
                "ignoring note for a different noteable"
            );
            return Ok(InboundCommentOutcome::Ignored);
        }

        let key = state.ledger_key(&event.comment_id());
        if event.has_origin_marker() {
            tokio::time::sleep(self.config.comment_grace_period).await;
        }
        if self.deps.ledger.has_been_processed(&key) {
            tracing::debug!(
                connection = %self,
                comment = %key.as_event_key(),
                "skipping comment already mirrored"
            );
            return Ok(InboundCommentOutcome::Duplicate);
        }

        let identity = self
            .deps
            .identity
            .resolve_room_identity(&TrackerActor::from(&event.user))
            .await
            .with_context(|| {
                format!("failed to resolve room identity for {}", event.user.username)
            })?;
        self.deps
            .sink
            .ensure_room_identity(&self.room_id, &identity)
            .await
            .with_context(|| {
                format!("failed to prepare {} in {}", identity.user_id, self.room_id)
            })?;
        let message = self.deps.renderer.render_tracker_note(event);

        // Mark before send.
        if !self.deps.ledger.mark_processed(&key) {
            return Ok(InboundCommentOutcome::Duplicate);
        }
        let ack = self
            .deps
            .sink
            .send_message(
                &self.room_id,
                &message,
                MATRIX_ROOM_MESSAGE_EVENT_TYPE,
                &identity.user_id,
            )
            .await
            .with_context(|| {
                format!("failed to mirror comment {} into {}", key.comment_id, self.room_id)
            })?;
        tracing::info!(
            connection = %self,
            comment = %key.as_event_key(),
            as_user = %identity.user_id,
            "mirrored gitlab comment into room"
        );
        Ok(InboundCommentOutcome::Delivered {
            event_id: ack.event_id,
        })
    }

    /// Posts a room message as a GitLab note on behalf of its sender.
    pub async fn on_matrix_issue_comment(
        &self,
        event: &MatrixRoomEvent,
        allow_echo: bool,
    ) -> Result<OutboundCommentOutcome> {
        let Some(content) = event.message_content() else {
            bail!("event {} is not a room message", event.event_id);
        };
        let credentials = self
            .deps
            .identity
            .resolve_tracker_credentials(&event.sender, &self.config.instance_url)
            .await
            .with_context(|| format!("failed to resolve gitlab credentials for {}", event.sender))?;
        let Some(credentials) = credentials else {
            self.deps
                .sink
                .send_reaction(&self.room_id, &event.event_id, NOT_BRIDGED_ANNOTATION)
                .await
                .with_context(|| format!("failed to annotate event {}", event.event_id))?;
            tracing::info!(
                connection = %self,
                sender = %event.sender,
                "ignoring comment, user is not authenticated"
            );
            return Ok(OutboundCommentOutcome::NotBridged);
        };

        let state = self.state();
        let body = self.deps.renderer.render_room_message(event, &content);
        let created = self
            .deps
            .tracker
            .create_comment(
                &credentials,
                &self.config.instance_url,
                &state.projects,
                state.iid,
                &body,
            )
            .await
            .with_context(|| format!("failed to create gitlab note for {}", event.event_id))?;

        if !allow_echo {
            self.deps
                .ledger
                .mark_processed(&state.ledger_key(&created.comment_id));
        }
        tracing::info!(
            connection = %self,
            sender = %event.sender,
            comment_id = %created.comment_id,
            allow_echo,
            "posted room message as gitlab note"
        );
        Ok(OutboundCommentOutcome::Posted {
            comment_id: created.comment_id,
        })
    }

    /// Best-effort sync of issue metadata into the room.
    pub async fn on_issue_edited(
        &self,
        event: &GitlabIssueWebhookEvent,
    ) -> Result<IssueEditOutcome> {
        let Some(changes) = event.changes.as_ref().filter(|changes| !changes.is_empty()) else {
            tracing::debug!(connection = %self, "no changes given");
            return Ok(IssueEditOutcome::NoChanges);
        };
        let state = self.state();
        if event.object_attributes.iid != state.iid
            || !state.projects.matches_str(&event.project.path_with_namespace)
        {
            return Ok(IssueEditOutcome::Ignored);
        }

        let mut room_name = false;
        if let Some(title_change) = changes.title.as_ref() {
            let title = title_change
                .current
                .as_deref()
                .unwrap_or(event.object_attributes.title.as_str());
            let name = self
                .deps
                .renderer
                .render_room_name(&state.projects, state.iid, title);
            self.deps
                .sink
                .set_room_metadata(&self.room_id, RoomMetadataField::Name, &name)
                .await
                .with_context(|| format!("failed to rename {}", self.room_id))?;
            room_name = true;
        }

        let mut lifecycle_state = false;
        if let Some(next) = event.lifecycle_change().filter(|next| *next != state.state) {
            let updated = {
                let mut guard = self.write_state();
                guard.state = next;
                guard.clone()
            };
            let issue_url = event
                .object_attributes
                .url
                .as_deref()
                .unwrap_or(self.state_key.as_str());
            let topic = self.deps.renderer.render_room_topic(&updated.state, issue_url);
            self.deps
                .sink
                .set_room_metadata(&self.room_id, RoomMetadataField::Topic, &topic)
                .await
                .with_context(|| format!("failed to update topic of {}", self.room_id))?;
            let content =
                serde_json::to_value(&updated).context("failed to encode connection state")?;
            self.deps
                .sink
                .set_room_state(
                    &self.room_id,
                    GITLAB_ISSUE_CANONICAL_EVENT_TYPE,
                    &self.state_key,
                    &content,
                )
                .await
                .with_context(|| {
                    format!("failed to persist connection state in {}", self.room_id)
                })?;
            lifecycle_state = true;
        }

        if !room_name && !lifecycle_state {
            tracing::debug!(connection = %self, "no bridged fields changed");
            return Ok(IssueEditOutcome::NoChanges);
        }
        Ok(IssueEditOutcome::Updated {
            room_name,
            lifecycle_state,
        })
    }

    /// Entry point for room messages addressed to this connection.
    pub async fn on_message_event(&self, event: &MatrixRoomEvent) -> Result<MessageEventOutcome> {
        if self.deps.identity.is_bridge_user(&event.sender) {
            return Ok(MessageEventOutcome::Ignored);
        }
        let Some(content) = event.message_content() else {
            return Ok(MessageEventOutcome::Ignored);
        };
        if content.body.trim() == RESYNC_COMMAND {
            tracing::info!(connection = %self, sender = %event.sender, "resync is not supported");
            return Ok(MessageEventOutcome::ReservedCommand {
                command: RESYNC_COMMAND.to_string(),
            });
        }
        let outcome = self.on_matrix_issue_comment(event, false).await?;
        Ok(MessageEventOutcome::Comment(outcome))
    }

    fn read_state(&self) -> RwLockReadGuard<'_, GitlabIssueConnectionState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, GitlabIssueConnectionState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Display for GitlabIssueConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read_state();
        write!(
            f,
            "GitLabIssue {}/{}#{}",
            self.config.instance_url, state.projects, state.iid
        )
    }
}

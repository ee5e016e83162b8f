//! Collaborator contracts consumed by [`crate::GitlabIssueConnection`].
//!
//! The connection never talks to GitLab or the homeserver directly. Concrete
//! implementations live in [`crate::gitlab_api_client`],
//! [`crate::matrix_delivery_client`] and [`crate::appservice_identity`].

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tau_gitlab_issues::{GitlabUser, MatrixMessageContent, ProjectPath};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Tracker-side author of a mirrored comment.
pub struct TrackerActor {
    pub display_name: String,
    pub username: String,
    pub avatar_url: Option<String>,
}

impl From<&GitlabUser> for TrackerActor {
    fn from(user: &GitlabUser) -> Self {
        Self {
            display_name: user.name.clone(),
            username: user.username.clone(),
            avatar_url: user.avatar_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Room-side virtual identity that mirrored messages are attributed to.
pub struct RoomIdentity {
    pub user_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct TrackerCredentials {
    pub token: String,
}

impl std::fmt::Debug for TrackerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerCredentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedComment {
    pub comment_id: String,
    pub web_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Acknowledgement of a room delivery; carries the homeserver event id when known.
pub struct DeliveryAck {
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomMetadataField {
    Name,
    Topic,
}

impl RoomMetadataField {
    pub fn event_type(self) -> &'static str {
        match self {
            Self::Name => tau_gitlab_issues::MATRIX_ROOM_NAME_EVENT_TYPE,
            Self::Topic => tau_gitlab_issues::MATRIX_ROOM_TOPIC_EVENT_TYPE,
        }
    }

    pub fn content_key(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Topic => "topic",
        }
    }
}

#[async_trait]
/// Maps actors across the bridge.
pub trait IdentityResolver: Send + Sync {
    async fn resolve_room_identity(&self, actor: &TrackerActor) -> Result<RoomIdentity>;

    /// `Ok(None)` means the room user has not linked a tracker account.
    async fn resolve_tracker_credentials(
        &self,
        room_actor_id: &str,
        instance_url: &str,
    ) -> Result<Option<TrackerCredentials>>;

    /// True for user ids owned by the bridge itself.
    fn is_bridge_user(&self, _user_id: &str) -> bool {
        false
    }
}

#[async_trait]
/// Outbound channel into the Matrix room.
pub trait DeliverySink: Send + Sync {
    /// Makes `identity` able to post in `room_id`: the virtual user exists,
    /// carries the actor's profile and has joined the room. Idempotent.
    async fn ensure_room_identity(&self, room_id: &str, identity: &RoomIdentity) -> Result<()>;

    async fn send_message(
        &self,
        room_id: &str,
        message: &MatrixMessageContent,
        event_type: &str,
        as_user: &str,
    ) -> Result<DeliveryAck>;

    async fn send_reaction(
        &self,
        room_id: &str,
        relates_to_event_id: &str,
        annotation: &str,
    ) -> Result<DeliveryAck>;

    async fn set_room_metadata(
        &self,
        room_id: &str,
        field: RoomMetadataField,
        value: &str,
    ) -> Result<()>;

    async fn set_room_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<()>;

    /// `Ok(None)` when the room holds no entry for `(event_type, state_key)`.
    async fn get_room_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>>;
}

#[async_trait]
/// Issue-tracker API used for room → tracker comments.
pub trait TrackerClient: Send + Sync {
    async fn create_comment(
        &self,
        credentials: &TrackerCredentials,
        instance_url: &str,
        projects: &ProjectPath,
        issue_iid: u64,
        body: &str,
    ) -> Result<CreatedComment>;
}

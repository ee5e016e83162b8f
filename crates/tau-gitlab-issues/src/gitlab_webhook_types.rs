//! GitLab webhook payload models consumed by the issue bridge.
//!
//! Only the fields the bridge reads are modelled; everything else in the
//! payload is ignored by serde.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::issue_connection_state::IssueLifecycleState;

pub const GITLAB_NOTEABLE_TYPE_ISSUE: &str = "Issue";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
/// GitLab actor attached to a webhook.
pub struct GitlabUser {
    pub name: String,
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GitlabProject {
    pub path_with_namespace: String,
    #[serde(default)]
    pub web_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GitlabRepository {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GitlabNoteAttributes {
    pub id: u64,
    pub note: String,
    pub noteable_type: String,
    #[serde(default)]
    pub noteable_id: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GitlabNoteIssue {
    pub id: u64,
    pub iid: u64,
    pub title: String,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
/// `object_kind = "note"` webhook.
pub struct GitlabNoteWebhookEvent {
    pub user: GitlabUser,
    pub project: GitlabProject,
    /// Origin marker. Present on notes delivered through project hooks, which
    /// are the deliveries that can race a bridge-originated post.
    #[serde(default)]
    pub repository: Option<GitlabRepository>,
    pub object_attributes: GitlabNoteAttributes,
    #[serde(default)]
    pub issue: Option<GitlabNoteIssue>,
}

impl GitlabNoteWebhookEvent {
    pub fn is_issue_note(&self) -> bool {
        self.object_attributes.noteable_type == GITLAB_NOTEABLE_TYPE_ISSUE && self.issue.is_some()
    }

    pub fn has_origin_marker(&self) -> bool {
        self.repository.is_some()
    }

    pub fn comment_id(&self) -> String {
        self.object_attributes.id.to_string()
    }

    pub fn issue_iid(&self) -> Option<u64> {
        self.issue.as_ref().map(|issue| issue.iid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GitlabIssueAttributes {
    pub id: u64,
    pub iid: u64,
    pub title: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GitlabChange<T> {
    #[serde(default)]
    pub previous: Option<T>,
    #[serde(default)]
    pub current: Option<T>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
/// `changes` block of an issue webhook.
pub struct GitlabIssueChanges {
    #[serde(default)]
    pub title: Option<GitlabChange<String>>,
    #[serde(default)]
    pub state_id: Option<GitlabChange<u64>>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl GitlabIssueChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.state_id.is_none() && self.other.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
/// `object_kind = "issue"` webhook.
pub struct GitlabIssueWebhookEvent {
    pub user: GitlabUser,
    pub project: GitlabProject,
    pub object_attributes: GitlabIssueAttributes,
    #[serde(default)]
    pub changes: Option<GitlabIssueChanges>,
}

impl GitlabIssueWebhookEvent {
    /// Lifecycle transition carried by the event, if any.
    pub fn lifecycle_change(&self) -> Option<IssueLifecycleState> {
        if let Some(state_id) = self
            .changes
            .as_ref()
            .and_then(|changes| changes.state_id.as_ref())
            .and_then(|change| change.current)
        {
            return Some(IssueLifecycleState::from_state_id(state_id));
        }
        match self.object_attributes.action.as_deref() {
            Some("close") => Some(IssueLifecycleState::Closed),
            Some("reopen") => Some(IssueLifecycleState::Opened),
            _ => None,
        }
    }

    pub fn title_change(&self) -> Option<&GitlabChange<String>> {
        self.changes.as_ref().and_then(|changes| changes.title.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GitlabWebhookPayload {
    Note(Box<GitlabNoteWebhookEvent>),
    Issue(Box<GitlabIssueWebhookEvent>),
    Unsupported { object_kind: String },
}

impl GitlabWebhookPayload {
    pub fn kind(&self) -> &str {
        match self {
            Self::Note(_) => "note",
            Self::Issue(_) => "issue",
            Self::Unsupported { object_kind } => object_kind.as_str(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WebhookParseError {
    #[error("webhook body is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("webhook payload is missing object_kind")]
    MissingObjectKind,
    #[error("failed to decode gitlab {object_kind} webhook: {source}")]
    Decode {
        object_kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Classifies a decoded webhook body by its `object_kind`.
pub fn parse_gitlab_webhook_payload(
    raw: &Value,
) -> Result<GitlabWebhookPayload, WebhookParseError> {
    let object_kind = raw
        .get("object_kind")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|kind| !kind.is_empty())
        .ok_or(WebhookParseError::MissingObjectKind)?;
    let decode_error = |source: serde_json::Error| WebhookParseError::Decode {
        object_kind: object_kind.to_string(),
        source,
    };
    match object_kind {
        "note" => serde_json::from_value::<GitlabNoteWebhookEvent>(raw.clone())
            .map(|event| GitlabWebhookPayload::Note(Box::new(event)))
            .map_err(decode_error),
        "issue" => serde_json::from_value::<GitlabIssueWebhookEvent>(raw.clone())
            .map(|event| GitlabWebhookPayload::Issue(Box::new(event)))
            .map_err(decode_error),
        other => Ok(GitlabWebhookPayload::Unsupported {
            object_kind: other.to_string(),
        }),
    }
}

pub fn parse_gitlab_webhook_json(raw: &str) -> Result<GitlabWebhookPayload, WebhookParseError> {
    let value = serde_json::from_str::<Value>(raw)?;
    parse_gitlab_webhook_payload(&value)
}

//! Persisted state for a Matrix room bridged to one GitLab issue.
//!
//! The state is stored verbatim as room-state content under
//! [`GITLAB_ISSUE_CANONICAL_EVENT_TYPE`] with the issue web URL as state key,
//! so it survives bridge restarts.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::comment_ledger::CommentLedgerKey;

pub const GITLAB_ISSUE_CANONICAL_EVENT_TYPE: &str = "uk.half-shot.matrix-github.gitlab.issue";
pub const GITLAB_ISSUE_EVENT_TYPES: &[&str] = &[GITLAB_ISSUE_CANONICAL_EVENT_TYPE];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectPathError {
    #[error("project path is empty")]
    Empty,
    #[error("project path '{raw}' has an empty segment at index {index}")]
    EmptySegment { raw: String, index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
/// Ordered namespace segments of a GitLab project, e.g. `["org", "group", "repo"]`.
pub struct ProjectPath(Vec<String>);

impl ProjectPath {
    pub fn new(segments: Vec<String>) -> Result<Self, ProjectPathError> {
        if segments.is_empty() {
            return Err(ProjectPathError::Empty);
        }
        if let Some(index) = segments
            .iter()
            .position(|segment| segment.trim().is_empty())
        {
            return Err(ProjectPathError::EmptySegment {
                raw: segments.join("/"),
                index,
            });
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn joined(&self) -> String {
        self.0.join("/")
    }

    /// Compares against a `path_with_namespace` string from a webhook.
    pub fn matches_str(&self, raw: &str) -> bool {
        let mut parts = raw.trim().trim_matches('/').split('/');
        self.0
            .iter()
            .all(|segment| parts.next() == Some(segment.as_str()))
            && parts.next().is_none()
    }
}

impl TryFrom<Vec<String>> for ProjectPath {
    type Error = ProjectPathError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProjectPath> for Vec<String> {
    fn from(value: ProjectPath) -> Self {
        value.0
    }
}

impl FromStr for ProjectPath {
    type Err = ProjectPathError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Err(ProjectPathError::Empty);
        }
        Self::new(trimmed.split('/').map(ToOwned::to_owned).collect())
    }
}

impl fmt::Display for ProjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
/// GitLab issue lifecycle state. Any spelling other than `opened` or `closed`
/// is preserved verbatim so persisted content round-trips unchanged.
pub enum IssueLifecycleState {
    Opened,
    Closed,
    Other(String),
}

impl IssueLifecycleState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Opened => "opened",
            Self::Closed => "closed",
            Self::Other(value) => value.as_str(),
        }
    }

    /// Maps GitLab's numeric `state_id` (1 opened, 2 closed, 3 merged, 4 locked).
    pub fn from_state_id(state_id: u64) -> Self {
        match state_id {
            1 => Self::Opened,
            2 => Self::Closed,
            3 => Self::Other("merged".to_string()),
            4 => Self::Other("locked".to_string()),
            other => Self::Other(format!("state_{other}")),
        }
    }
}

impl From<String> for IssueLifecycleState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "opened" => Self::Opened,
            "closed" => Self::Closed,
            _ => Self::Other(value),
        }
    }
}

impl From<IssueLifecycleState> for String {
    fn from(value: IssueLifecycleState) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for IssueLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Room-state payload describing which GitLab issue a room mirrors.
pub struct GitlabIssueConnectionState {
    pub instance: String,
    pub projects: ProjectPath,
    pub state: IssueLifecycleState,
    pub iid: u64,
    pub id: u64,
}

impl GitlabIssueConnectionState {
    pub fn project_path(&self) -> String {
        self.projects.joined()
    }

    pub fn matches_issue(&self, instance: &str, path_with_namespace: &str, iid: u64) -> bool {
        self.instance == instance
            && self.iid == iid
            && self.projects.matches_str(path_with_namespace)
    }

    pub fn ledger_key(&self, comment_id: &str) -> CommentLedgerKey {
        CommentLedgerKey::new(
            self.instance.as_str(),
            self.project_path(),
            self.iid.to_string(),
            comment_id,
        )
    }
}

/// Room-state content that unbridges a room: `null` or an empty object.
pub fn is_cleared_state_content(content: &Value) -> bool {
    match content {
        Value::Null => true,
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

/// Canonical web URL for an issue, used as the connection state key.
pub fn canonical_issue_url(instance_url: &str, projects: &ProjectPath, iid: u64) -> String {
    format!(
        "{}/{}/-/issues/{}",
        instance_url.trim_end_matches('/'),
        projects.joined(),
        iid
    )
}

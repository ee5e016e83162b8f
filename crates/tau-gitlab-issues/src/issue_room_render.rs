//! Rendering helpers for bridged issue rooms and mirrored comment bodies.

use crate::gitlab_webhook_types::GitlabNoteWebhookEvent;
use crate::issue_connection_state::{IssueLifecycleState, ProjectPath};
use crate::matrix_event_types::{
    MatrixMessageContent, MatrixRoomEvent, MATRIX_MSGTYPE_EMOTE, MATRIX_MSGTYPE_TEXT,
};

pub const NOT_BRIDGED_ANNOTATION: &str = "⚠️ Not bridged";
pub const RESYNC_COMMAND: &str = "!sync";

pub fn format_issue_reference(projects: &ProjectPath, iid: u64) -> String {
    format!("{}#{}", projects.joined(), iid)
}

pub fn format_issue_room_name(projects: &ProjectPath, iid: u64, title: &str) -> String {
    let title = title.trim();
    if title.is_empty() {
        return format_issue_reference(projects, iid);
    }
    format!("{}: {}", format_issue_reference(projects, iid), title)
}

pub fn format_issue_room_topic(state: &IssueLifecycleState, issue_url: &str) -> String {
    format!("State: {} | {}", state, issue_url.trim())
}

/// Converts bodies between GitLab notes and Matrix messages.
pub trait BodyRenderer: Send + Sync {
    fn render_tracker_note(&self, event: &GitlabNoteWebhookEvent) -> MatrixMessageContent;

    fn render_room_message(&self, event: &MatrixRoomEvent, content: &MatrixMessageContent)
        -> String;

    fn render_room_name(&self, projects: &ProjectPath, iid: u64, title: &str) -> String {
        format_issue_room_name(projects, iid, title)
    }

    fn render_room_topic(&self, state: &IssueLifecycleState, issue_url: &str) -> String {
        format_issue_room_topic(state, issue_url)
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Plain-text renderer. Markdown is passed through untouched.
pub struct PlainBodyRenderer;

impl BodyRenderer for PlainBodyRenderer {
    fn render_tracker_note(&self, event: &GitlabNoteWebhookEvent) -> MatrixMessageContent {
        MatrixMessageContent {
            msgtype: MATRIX_MSGTYPE_TEXT.to_string(),
            body: event.object_attributes.note.trim().to_string(),
            format: None,
            formatted_body: None,
            external_url: event.object_attributes.url.clone(),
        }
    }

    fn render_room_message(
        &self,
        event: &MatrixRoomEvent,
        content: &MatrixMessageContent,
    ) -> String {
        let body = content.body.trim();
        if content.msgtype == MATRIX_MSGTYPE_EMOTE {
            return format!("* {} {}", event.sender, body);
        }
        body.to_string()
    }
}

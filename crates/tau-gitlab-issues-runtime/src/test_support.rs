//! In-memory collaborators shared by the runtime tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tau_gitlab_issues::{
    GitlabIssueConnectionState, GitlabNoteWebhookEvent, InMemoryCommentLedger,
    IssueLifecycleState, MatrixMessageContent, MatrixRoomEvent, PlainBodyRenderer, ProjectPath,
};

use crate::bridge_collaborators::{
    CreatedComment, DeliveryAck, DeliverySink, IdentityResolver, RoomIdentity, RoomMetadataField,
    TrackerActor, TrackerClient, TrackerCredentials,
};
use crate::gitlab_issue_connection::{
    GitlabIssueConnection, GitlabIssueConnectionConfig, GitlabIssueConnectionDeps,
};

pub(crate) const ROOM_ID: &str = "!issue:example.com";
pub(crate) const STATE_KEY: &str = "https://example.com/org/repo/issues/42";
pub(crate) const INSTANCE_URL: &str = "https://example.com";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SinkCall {
    Identity {
        room_id: String,
        user_id: String,
        display_name: Option<String>,
    },
    Message {
        room_id: String,
        body: String,
        as_user: String,
    },
    Reaction {
        event_id: String,
        annotation: String,
    },
    Metadata {
        field: RoomMetadataField,
        value: String,
    },
    State {
        event_type: String,
        state_key: String,
        content: Value,
    },
}

type RoomStateKey = (String, String, String);

#[derive(Default)]
pub(crate) struct RecordingSink {
    pub(crate) calls: Mutex<Vec<SinkCall>>,
    pub(crate) fail_messages: bool,
    pub(crate) fail_identities: bool,
    pub(crate) room_state: Mutex<HashMap<RoomStateKey, Value>>,
}

impl RecordingSink {
    pub(crate) fn persist_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
    ) {
        self.room_state.lock().expect("room state").insert(
            (room_id.to_string(), event_type.to_string(), state_key.to_string()),
            content,
        );
    }

    pub(crate) fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().expect("sink calls").clone()
    }

    pub(crate) fn messages(&self) -> Vec<SinkCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, SinkCall::Message { .. }))
            .collect()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn ensure_room_identity(&self, room_id: &str, identity: &RoomIdentity) -> Result<()> {
        if self.fail_identities {
            return Err(anyhow!("matrix api join room failed with status 403"));
        }
        self.calls.lock().expect("sink calls").push(SinkCall::Identity {
            room_id: room_id.to_string(),
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
        });
        Ok(())
    }

    async fn send_message(
        &self,
        room_id: &str,
        message: &MatrixMessageContent,
        _event_type: &str,
        as_user: &str,
    ) -> Result<DeliveryAck> {
        if self.fail_messages {
            return Err(anyhow!("homeserver unavailable"));
        }
        let mut calls = self.calls.lock().expect("sink calls");
        calls.push(SinkCall::Message {
            room_id: room_id.to_string(),
            body: message.body.clone(),
            as_user: as_user.to_string(),
        });
        Ok(DeliveryAck {
            event_id: Some(format!("$sent{}", calls.len())),
        })
    }

    async fn send_reaction(
        &self,
        _room_id: &str,
        relates_to_event_id: &str,
        annotation: &str,
    ) -> Result<DeliveryAck> {
        self.calls.lock().expect("sink calls").push(SinkCall::Reaction {
            event_id: relates_to_event_id.to_string(),
            annotation: annotation.to_string(),
        });
        Ok(DeliveryAck { event_id: None })
    }

    async fn set_room_metadata(
        &self,
        _room_id: &str,
        field: RoomMetadataField,
        value: &str,
    ) -> Result<()> {
        self.calls.lock().expect("sink calls").push(SinkCall::Metadata {
            field,
            value: value.to_string(),
        });
        Ok(())
    }

    async fn set_room_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<()> {
        self.calls.lock().expect("sink calls").push(SinkCall::State {
            event_type: event_type.to_string(),
            state_key: state_key.to_string(),
            content: content.clone(),
        });
        self.persist_state(room_id, event_type, state_key, content.clone());
        Ok(())
    }

    async fn get_room_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>> {
        let key = (room_id.to_string(), event_type.to_string(), state_key.to_string());
        Ok(self.room_state.lock().expect("room state").get(&key).cloned())
    }
}

pub(crate) struct StaticIdentity {
    tokens: HashMap<String, String>,
}

impl StaticIdentity {
    pub(crate) fn with_user(user_id: &str, token: &str) -> Self {
        Self {
            tokens: HashMap::from([(user_id.to_string(), token.to_string())]),
        }
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentity {
    async fn resolve_room_identity(&self, actor: &TrackerActor) -> Result<RoomIdentity> {
        Ok(RoomIdentity {
            user_id: format!("@_gitlab_{}:example.com", actor.username),
            display_name: Some(actor.display_name.clone()),
            avatar_url: actor.avatar_url.clone(),
        })
    }

    async fn resolve_tracker_credentials(
        &self,
        room_actor_id: &str,
        _instance_url: &str,
    ) -> Result<Option<TrackerCredentials>> {
        Ok(self
            .tokens
            .get(room_actor_id)
            .map(|token| TrackerCredentials {
                token: token.clone(),
            }))
    }

    fn is_bridge_user(&self, user_id: &str) -> bool {
        user_id.starts_with("@_gitlab_")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TrackerCall {
    pub(crate) token: String,
    pub(crate) instance_url: String,
    pub(crate) project: String,
    pub(crate) iid: u64,
    pub(crate) body: String,
}

/// Tracker returning queued comment ids; an empty queue fails like a 500.
pub(crate) struct ScriptedTracker {
    comment_ids: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<TrackerCall>>,
    latency: Duration,
}

impl ScriptedTracker {
    pub(crate) fn new(comment_ids: &[&str]) -> Self {
        Self::with_latency(comment_ids, Duration::ZERO)
    }

    pub(crate) fn with_latency(comment_ids: &[&str], latency: Duration) -> Self {
        Self {
            comment_ids: Mutex::new(comment_ids.iter().map(|id| id.to_string()).collect()),
            calls: Mutex::new(Vec::new()),
            latency,
        }
    }

    pub(crate) fn calls(&self) -> Vec<TrackerCall> {
        self.calls.lock().expect("tracker calls").clone()
    }
}

#[async_trait]
impl TrackerClient for ScriptedTracker {
    async fn create_comment(
        &self,
        credentials: &TrackerCredentials,
        instance_url: &str,
        projects: &ProjectPath,
        issue_iid: u64,
        body: &str,
    ) -> Result<CreatedComment> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.calls.lock().expect("tracker calls").push(TrackerCall {
            token: credentials.token.clone(),
            instance_url: instance_url.to_string(),
            project: projects.joined(),
            iid: issue_iid,
            body: body.to_string(),
        });
        let comment_id = self
            .comment_ids
            .lock()
            .expect("comment ids")
            .pop_front()
            .ok_or_else(|| anyhow!("gitlab api create note failed with status 500"))?;
        Ok(CreatedComment {
            comment_id,
            web_url: None,
        })
    }
}

pub(crate) struct Harness {
    pub(crate) connection: Arc<GitlabIssueConnection>,
    pub(crate) ledger: Arc<InMemoryCommentLedger>,
    pub(crate) sink: Arc<RecordingSink>,
    pub(crate) tracker: Arc<ScriptedTracker>,
    pub(crate) deps: GitlabIssueConnectionDeps,
}

pub(crate) fn sample_state() -> GitlabIssueConnectionState {
    GitlabIssueConnectionState {
        instance: "main".to_string(),
        projects: "org/repo".parse().expect("project path"),
        state: IssueLifecycleState::Opened,
        iid: 42,
        id: 1042,
    }
}

pub(crate) fn harness_with(sink: RecordingSink, tracker: ScriptedTracker) -> Harness {
    let ledger = Arc::new(InMemoryCommentLedger::new());
    let sink = Arc::new(sink);
    let tracker = Arc::new(tracker);
    let deps = GitlabIssueConnectionDeps {
        ledger: ledger.clone(),
        identity: Arc::new(StaticIdentity::with_user("@alice:example.com", "glpat-alice")),
        sink: sink.clone(),
        tracker: tracker.clone(),
        renderer: Arc::new(PlainBodyRenderer),
    };
    let connection = Arc::new(GitlabIssueConnection::new(
        ROOM_ID,
        sample_state(),
        STATE_KEY,
        GitlabIssueConnectionConfig::new(INSTANCE_URL),
        deps.clone(),
    ));
    Harness {
        connection,
        ledger,
        sink,
        tracker,
        deps,
    }
}

pub(crate) fn harness(comment_ids: &[&str]) -> Harness {
    harness_with(RecordingSink::default(), ScriptedTracker::new(comment_ids))
}

pub(crate) fn note_payload(note_id: u64, with_origin_marker: bool) -> Value {
    let mut payload = json!({
        "object_kind": "note",
        "user": {
            "name": "Bob Builder",
            "username": "bob",
            "avatar_url": "https://example.com/bob.png"
        },
        "project": { "path_with_namespace": "org/repo" },
        "object_attributes": {
            "id": note_id,
            "note": format!("comment {note_id}"),
            "noteable_type": "Issue",
            "url": format!("{STATE_KEY}#note_{note_id}")
        },
        "issue": { "id": 1042, "iid": 42, "title": "Crash on start" }
    });
    if with_origin_marker {
        payload["repository"] = json!({ "name": "repo" });
    }
    payload
}

pub(crate) fn note_event(note_id: u64, with_origin_marker: bool) -> GitlabNoteWebhookEvent {
    serde_json::from_value(note_payload(note_id, with_origin_marker)).expect("note event")
}

pub(crate) fn room_message(event_id: &str, sender: &str, body: &str) -> MatrixRoomEvent {
    MatrixRoomEvent {
        event_id: event_id.to_string(),
        room_id: ROOM_ID.to_string(),
        sender: sender.to_string(),
        event_type: "m.room.message".to_string(),
        state_key: None,
        content: json!({ "msgtype": "m.text", "body": body }),
    }
}

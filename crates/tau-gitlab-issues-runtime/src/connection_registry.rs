//! Routing of GitLab webhooks and Matrix room events to issue connections.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tau_gitlab_issues::{is_cleared_state_content, GitlabWebhookPayload, MatrixRoomEvent};

use crate::gitlab_issue_connection::GitlabIssueConnection;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Counts of connections an event was routed to.
pub struct DispatchReport {
    pub matched: usize,
    pub failed: usize,
}

impl DispatchReport {
    fn record<T>(&mut self, connection: &GitlabIssueConnection, result: anyhow::Result<T>) {
        self.matched = self.matched.saturating_add(1);
        if let Err(error) = result {
            self.failed = self.failed.saturating_add(1);
            tracing::warn!(
                connection = %connection,
                room_id = %connection.room_id(),
                error = %format!("{error:#}"),
                "connection handler failed"
            );
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<Vec<Arc<GitlabIssueConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection, replacing any live one with the same room and
    /// state key. Returns the replaced connection.
    pub fn register(
        &self,
        connection: Arc<GitlabIssueConnection>,
    ) -> Option<Arc<GitlabIssueConnection>> {
        let mut connections = self.write_connections();
        let existing = connections.iter().position(|current| {
            current.room_id() == connection.room_id()
                && current.state_key() == connection.state_key()
        });
        tracing::info!(
            connection = %connection,
            room_id = %connection.room_id(),
            replaced = existing.is_some(),
            "registered gitlab issue connection"
        );
        match existing {
            Some(index) => Some(std::mem::replace(&mut connections[index], connection)),
            None => {
                connections.push(connection);
                None
            }
        }
    }

    /// Unregisters the connection for `(room_id, state_key)`, if any.
    pub fn remove(&self, room_id: &str, state_key: &str) -> Option<Arc<GitlabIssueConnection>> {
        let mut connections = self.write_connections();
        let index = connections.iter().position(|current| {
            current.room_id() == room_id && current.state_key() == state_key
        })?;
        Some(connections.remove(index))
    }

    pub fn len(&self) -> usize {
        self.read_connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_connections().is_empty()
    }

    pub fn connections_for_room(&self, room_id: &str) -> Vec<Arc<GitlabIssueConnection>> {
        self.select(|connection| connection.room_id() == room_id)
    }

    pub fn connections_for_issue(
        &self,
        instance: &str,
        path_with_namespace: &str,
        iid: u64,
    ) -> Vec<Arc<GitlabIssueConnection>> {
        self.select(|connection| connection.matches_issue(instance, path_with_namespace, iid))
    }

    /// Reloads every connection's persisted room state. Connections whose room
    /// holds no state, or whose read fails, keep their configured state.
    pub async fn restore_persisted_states(&self) -> DispatchReport {
        let mut report = DispatchReport::default();
        for connection in self.select(|_| true) {
            let result = connection.restore_persisted_state().await;
            report.record(&connection, result);
        }
        report
    }

    /// Routes an authenticated webhook from the named GitLab instance.
    pub async fn dispatch_gitlab_webhook(
        &self,
        instance: &str,
        payload: &GitlabWebhookPayload,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        match payload {
            GitlabWebhookPayload::Note(event) => {
                let Some(iid) = event.issue_iid().filter(|_| event.is_issue_note()) else {
                    tracing::debug!(
                        instance,
                        noteable_type = %event.object_attributes.noteable_type,
                        "ignoring note on unsupported noteable"
                    );
                    return report;
                };
                let targets =
                    self.connections_for_issue(instance, &event.project.path_with_namespace, iid);
                for connection in targets {
                    let result = connection.on_comment_created(event).await;
                    report.record(&connection, result);
                }
            }
            GitlabWebhookPayload::Issue(event) => {
                let targets = self.connections_for_issue(
                    instance,
                    &event.project.path_with_namespace,
                    event.object_attributes.iid,
                );
                for connection in targets {
                    let result = connection.on_issue_edited(event).await;
                    report.record(&connection, result);
                }
            }
            GitlabWebhookPayload::Unsupported { object_kind } => {
                tracing::debug!(instance, object_kind = %object_kind, "ignoring gitlab webhook");
            }
        }
        report
    }

    /// Routes a room event from the homeserver.
    pub async fn dispatch_room_event(&self, event: &MatrixRoomEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        if let Some(state_key) = event.state_key.as_deref() {
            let targets = self.select(|connection| {
                connection.room_id() == event.room_id
                    && connection.is_interested_in_state_event(&event.event_type, state_key)
            });
            let cleared = is_cleared_state_content(&event.content);
            for connection in targets {
                if cleared {
                    self.remove(connection.room_id(), connection.state_key());
                    tracing::info!(
                        connection = %connection,
                        room_id = %connection.room_id(),
                        "removed gitlab issue connection after its room state was cleared"
                    );
                    report.record(&connection, Ok(()));
                    continue;
                }
                let result = connection.apply_state_content(&event.content);
                report.record(&connection, result);
            }
            return report;
        }
        if event.message_content().is_none() {
            return report;
        }
        for connection in self.connections_for_room(&event.room_id) {
            let result = connection.on_message_event(event).await;
            report.record(&connection, result);
        }
        report
    }

    fn select<F>(&self, predicate: F) -> Vec<Arc<GitlabIssueConnection>>
    where
        F: Fn(&GitlabIssueConnection) -> bool,
    {
        self.read_connections()
            .iter()
            .filter(|connection| predicate(connection))
            .cloned()
            .collect()
    }

    fn read_connections(&self) -> RwLockReadGuard<'_, Vec<Arc<GitlabIssueConnection>>> {
        match self.connections.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_connections(&self) -> RwLockWriteGuard<'_, Vec<Arc<GitlabIssueConnection>>> {
        match self.connections.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tau_gitlab_issues::{
        parse_gitlab_webhook_payload, IssueLifecycleState, MatrixRoomEvent,
        GITLAB_ISSUE_CANONICAL_EVENT_TYPE,
    };

    use super::{ConnectionRegistry, DispatchReport};
    use crate::gitlab_issue_connection::{GitlabIssueConnection, GitlabIssueConnectionConfig};
    use crate::test_support::{
        harness, note_payload, room_message, sample_state, SinkCall, INSTANCE_URL, ROOM_ID,
        STATE_KEY,
    };

    #[test]
    fn unit_register_replaces_connection_with_same_room_and_state_key() {
        let harness = harness(&[]);
        let registry = ConnectionRegistry::new();
        assert!(registry.register(harness.connection.clone()).is_none());

        let replacement = Arc::new(GitlabIssueConnection::new(
            ROOM_ID,
            sample_state(),
            STATE_KEY,
            GitlabIssueConnectionConfig::new(INSTANCE_URL),
            harness.deps.clone(),
        ));
        let replaced = registry
            .register(replacement.clone())
            .expect("replaced connection");
        assert!(Arc::ptr_eq(&replaced, &harness.connection));
        assert_eq!(registry.len(), 1);

        let other_room = Arc::new(GitlabIssueConnection::new(
            "!other:example.com",
            sample_state(),
            STATE_KEY,
            GitlabIssueConnectionConfig::new(INSTANCE_URL),
            harness.deps.clone(),
        ));
        assert!(registry.register(other_room).is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.connections_for_issue("main", "org/repo", 42).len(), 2);

        assert!(registry.remove(ROOM_ID, STATE_KEY).is_some());
        assert!(registry.remove(ROOM_ID, STATE_KEY).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn functional_note_webhook_routes_by_instance_path_and_iid() {
        let harness = harness(&[]);
        let registry = ConnectionRegistry::new();
        registry.register(harness.connection.clone());

        let payload = parse_gitlab_webhook_payload(&note_payload(5, false)).expect("note");
        let routed = registry.dispatch_gitlab_webhook("main", &payload).await;
        let other_instance = registry.dispatch_gitlab_webhook("staging", &payload).await;

        let mut other_issue = note_payload(6, false);
        other_issue["issue"]["iid"] = json!(7);
        let other_issue = parse_gitlab_webhook_payload(&other_issue).expect("note");
        let unrouted = registry.dispatch_gitlab_webhook("main", &other_issue).await;

        assert_eq!(routed, DispatchReport { matched: 1, failed: 0 });
        assert_eq!(other_instance, DispatchReport::default());
        assert_eq!(unrouted, DispatchReport::default());
        assert_eq!(harness.sink.messages().len(), 1);
    }

    #[tokio::test]
    async fn functional_issue_webhook_routes_to_on_issue_edited() {
        let harness = harness(&[]);
        let registry = ConnectionRegistry::new();
        registry.register(harness.connection.clone());
        let payload = parse_gitlab_webhook_payload(&json!({
            "object_kind": "issue",
            "user": { "name": "Carol", "username": "carol" },
            "project": { "path_with_namespace": "org/repo" },
            "object_attributes": { "id": 1042, "iid": 42, "title": "New title" },
            "changes": { "title": { "previous": "Old", "current": "New title" } }
        }))
        .expect("issue");

        let report = registry.dispatch_gitlab_webhook("main", &payload).await;

        assert_eq!(report.matched, 1);
        assert_eq!(
            harness.sink.calls(),
            vec![SinkCall::Metadata {
                field: crate::RoomMetadataField::Name,
                value: "org/repo#42: New title".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn functional_room_events_route_messages_and_state_updates() {
        let harness = harness(&["c-1"]);
        let registry = ConnectionRegistry::new();
        registry.register(harness.connection.clone());

        let message = registry
            .dispatch_room_event(&room_message("$m1", "@alice:example.com", "hi"))
            .await;
        assert_eq!(message.matched, 1);
        assert_eq!(harness.tracker.calls().len(), 1);

        let mut content = serde_json::to_value(sample_state()).expect("state");
        content["state"] = json!("closed");
        let state_event = MatrixRoomEvent {
            event_id: "$s1".to_string(),
            room_id: ROOM_ID.to_string(),
            sender: "@alice:example.com".to_string(),
            event_type: GITLAB_ISSUE_CANONICAL_EVENT_TYPE.to_string(),
            state_key: Some(STATE_KEY.to_string()),
            content,
        };
        let state = registry.dispatch_room_event(&state_event).await;
        assert_eq!(state.matched, 1);
        assert_eq!(harness.connection.state().state, IssueLifecycleState::Closed);

        let foreign_key = MatrixRoomEvent {
            state_key: Some("https://example.com/org/repo/issues/1".to_string()),
            ..state_event
        };
        assert_eq!(
            registry.dispatch_room_event(&foreign_key).await,
            DispatchReport::default()
        );
    }

    #[tokio::test]
    async fn regression_handler_failures_are_counted_not_fatal() {
        let harness = harness(&[]);
        let registry = ConnectionRegistry::new();
        registry.register(harness.connection.clone());

        let report = registry
            .dispatch_room_event(&room_message("$m1", "@alice:example.com", "no id queued"))
            .await;

        assert_eq!(report, DispatchReport { matched: 1, failed: 1 });
    }

    #[tokio::test]
    async fn functional_cleared_state_event_unregisters_connection() {
        let harness = harness(&[]);
        let registry = ConnectionRegistry::new();
        registry.register(harness.connection.clone());
        let cleared = MatrixRoomEvent {
            event_id: "$s2".to_string(),
            room_id: ROOM_ID.to_string(),
            sender: "@admin:example.com".to_string(),
            event_type: GITLAB_ISSUE_CANONICAL_EVENT_TYPE.to_string(),
            state_key: Some(STATE_KEY.to_string()),
            content: json!({}),
        };

        let report = registry.dispatch_room_event(&cleared).await;

        assert_eq!(report, DispatchReport { matched: 1, failed: 0 });
        assert!(registry.is_empty());
        let payload = parse_gitlab_webhook_payload(&note_payload(5, false)).expect("note");
        assert_eq!(
            registry.dispatch_gitlab_webhook("main", &payload).await,
            DispatchReport::default()
        );
        assert!(harness.sink.messages().is_empty());
    }

    #[tokio::test]
    async fn functional_restore_persisted_states_prefers_room_state_over_config() {
        let harness = harness(&[]);
        let mut persisted = serde_json::to_value(sample_state()).expect("state");
        persisted["state"] = json!("closed");
        harness.sink.persist_state(
            ROOM_ID,
            GITLAB_ISSUE_CANONICAL_EVENT_TYPE,
            STATE_KEY,
            persisted,
        );
        let unpersisted = Arc::new(GitlabIssueConnection::new(
            "!fresh:example.com",
            sample_state(),
            STATE_KEY,
            GitlabIssueConnectionConfig::new(INSTANCE_URL),
            harness.deps.clone(),
        ));
        let registry = ConnectionRegistry::new();
        registry.register(harness.connection.clone());
        registry.register(unpersisted.clone());

        let report = registry.restore_persisted_states().await;

        assert_eq!(report, DispatchReport { matched: 2, failed: 0 });
        assert_eq!(harness.connection.state().state, IssueLifecycleState::Closed);
        assert_eq!(unpersisted.state().state, IssueLifecycleState::Opened);
    }

    #[tokio::test]
    async fn regression_restore_rejects_state_for_another_issue() {
        let harness = harness(&[]);
        let mut foreign = serde_json::to_value(sample_state()).expect("state");
        foreign["iid"] = json!(7);
        foreign["state"] = json!("closed");
        harness
            .sink
            .persist_state(ROOM_ID, GITLAB_ISSUE_CANONICAL_EVENT_TYPE, STATE_KEY, foreign);
        let registry = ConnectionRegistry::new();
        registry.register(harness.connection.clone());

        let report = registry.restore_persisted_states().await;

        assert_eq!(report, DispatchReport { matched: 1, failed: 1 });
        assert_eq!(harness.connection.state().state, IssueLifecycleState::Opened);
    }
}

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use httpmock::prelude::*;
use serde_json::{json, Value};
use tau_gitlab_issues_runtime::{
    build_bridge_deps, build_bridge_router, build_connection_registry, BridgeConfig,
    BridgeServerState,
};
use tokio::net::TcpListener;

const ROOM_ID: &str = "!issue:example.com";
const HOOK_SECRET: &str = "hook-secret";
const HS_TOKEN: &str = "hs-secret";

fn bridge_config(upstream: &str) -> BridgeConfig {
    BridgeConfig::from_toml_str(&format!(
        r#"
[bridge]
comment_grace_period_ms = 100

[matrix]
homeserver_url = "{upstream}"
server_name = "example.com"
as_token = "as-secret"
hs_token = "{HS_TOKEN}"

[gitlab.instances.main]
url = "{upstream}"
webhook_secret = "{HOOK_SECRET}"

[[credentials]]
matrix_user = "@alice:example.com"
instance_url = "{upstream}"
token = "glpat-alice"

[[connections]]
room_id = "{ROOM_ID}"
state = {{ instance = "main", projects = ["org", "repo"], state = "opened", iid = 42, id = 1042 }}
"#
    ))
    .expect("bridge config")
}

async fn spawn_bridge(config: &BridgeConfig) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let deps = build_bridge_deps(config)?;
    let registry = Arc::new(build_connection_registry(config, &deps)?);
    registry.restore_persisted_states().await;
    let state = Arc::new(BridgeServerState::from_config(registry, config));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind ephemeral listener")?;
    let addr = listener.local_addr().context("resolve listener addr")?;
    let app = build_bridge_router(state);
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    Ok((addr, handle))
}

async fn wait_for_calls(mock: &httpmock::Mock<'_>, expected: usize) {
    for _ in 0..300 {
        if mock.calls() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {expected} calls, observed {}", mock.calls());
}

fn note_webhook(note_id: u64, username: &str, with_origin_marker: bool) -> Value {
    let mut payload = json!({
        "object_kind": "note",
        "user": { "name": username, "username": username },
        "project": { "path_with_namespace": "org/repo" },
        "object_attributes": {
            "id": note_id,
            "note": format!("note {note_id}"),
            "noteable_type": "Issue"
        },
        "issue": { "id": 1042, "iid": 42, "title": "Crash on start" }
    });
    if with_origin_marker {
        payload["repository"] = json!({ "name": "repo" });
    }
    payload
}

async fn post_webhook(client: &reqwest::Client, addr: SocketAddr, payload: &Value) {
    let response = client
        .post(format!("http://{addr}/webhooks/gitlab/main"))
        .header("X-Gitlab-Token", HOOK_SECRET)
        .json(payload)
        .send()
        .await
        .expect("post webhook");
    assert_eq!(response.status().as_u16(), 202);
}

#[tokio::test]
async fn integration_room_comment_echo_is_suppressed_and_new_notes_mirror_once() {
    let upstream = MockServer::start();
    let create_note = upstream.mock(|when, then| {
        when.method(POST)
            .path_includes("/issues/42/notes")
            .header("PRIVATE-TOKEN", "glpat-alice")
            .json_body(json!({ "body": "posted from matrix" }));
        then.status(201).json_body(json!({ "id": 501 }));
    });
    let mirrored = upstream.mock(|when, then| {
        when.method(PUT)
            .path_includes("/send/m.room.message/")
            .query_param("user_id", "@_gitlab_bob:example.com")
            .json_body_includes(json!({ "body": "note 502" }).to_string());
        then.status(200).json_body(json!({ "event_id": "$mirrored" }));
    });
    let register = upstream.mock(|when, then| {
        when.method(POST)
            .path("/_matrix/client/v3/register")
            .json_body_includes(json!({ "username": "_gitlab_bob" }).to_string());
        then.status(200)
            .json_body(json!({ "user_id": "@_gitlab_bob:example.com" }));
    });
    let display_name = upstream.mock(|when, then| {
        when.method(PUT)
            .path_includes("/displayname")
            .json_body(json!({ "displayname": "bob" }));
        then.status(200).json_body(json!({}));
    });
    let join = upstream.mock(|when, then| {
        when.method(POST)
            .path_includes("/join")
            .query_param("user_id", "@_gitlab_bob:example.com");
        then.status(200).json_body(json!({ "room_id": ROOM_ID }));
    });
    let any_room_send = upstream.mock(|when, then| {
        when.method(PUT).path_includes("/send/m.room.message/");
        then.status(200).json_body(json!({ "event_id": "$other" }));
    });

    let config = bridge_config(&upstream.base_url());
    let (addr, handle) = spawn_bridge(&config).await.expect("spawn bridge");
    let client = reqwest::Client::new();

    let transaction = client
        .put(format!("http://{addr}/_matrix/app/v1/transactions/txn-1"))
        .bearer_auth(HS_TOKEN)
        .json(&json!({
            "events": [{
                "event_id": "$m1",
                "room_id": ROOM_ID,
                "sender": "@alice:example.com",
                "type": "m.room.message",
                "content": { "msgtype": "m.text", "body": "posted from matrix" }
            }]
        }))
        .send()
        .await
        .expect("put transaction");
    assert_eq!(transaction.status().as_u16(), 200);
    wait_for_calls(&create_note, 1).await;

    post_webhook(&client, addr, &note_webhook(501, "alice", true)).await;
    post_webhook(&client, addr, &note_webhook(502, "bob", true)).await;
    wait_for_calls(&mirrored, 1).await;

    post_webhook(&client, addr, &note_webhook(502, "bob", false)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(create_note.calls(), 1);
    assert_eq!(register.calls(), 1);
    assert_eq!(display_name.calls(), 1);
    assert_eq!(join.calls(), 1);
    assert_eq!(mirrored.calls(), 1);
    assert_eq!(any_room_send.calls(), 0, "echo of note 501 must not reach the room");
    handle.abort();
}

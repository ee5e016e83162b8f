//! HTTP ingress for GitLab webhooks and homeserver transactions.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    future::Future,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tau_gitlab_issues::{parse_gitlab_webhook_json, MatrixRoomEvent};
use tokio::net::TcpListener;

use crate::bridge_config::BridgeConfig;
use crate::connection_registry::ConnectionRegistry;

pub const GITLAB_WEBHOOK_ENDPOINT: &str = "/webhooks/gitlab/{instance}";
pub const APPSERVICE_TRANSACTION_ENDPOINT: &str = "/_matrix/app/v1/transactions/{txn_id}";
pub const GITLAB_TOKEN_HEADER: &str = "x-gitlab-token";
const SEEN_TRANSACTION_CAPACITY: usize = 1_024;

#[derive(Debug, Default)]
struct SeenTransactions {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenTransactions {
    /// Returns `false` when `txn_id` was already recorded.
    fn insert(&mut self, txn_id: &str) -> bool {
        if self.ids.contains(txn_id) {
            return false;
        }
        self.ids.insert(txn_id.to_string());
        self.order.push_back(txn_id.to_string());
        while self.order.len() > SEEN_TRANSACTION_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }
}

pub struct BridgeServerState {
    registry: Arc<ConnectionRegistry>,
    gitlab_secrets: BTreeMap<String, String>,
    hs_token: String,
    seen_transactions: Mutex<SeenTransactions>,
}

impl BridgeServerState {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        gitlab_secrets: BTreeMap<String, String>,
        hs_token: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            gitlab_secrets,
            hs_token: hs_token.into(),
            seen_transactions: Mutex::new(SeenTransactions::default()),
        }
    }

    pub fn from_config(registry: Arc<ConnectionRegistry>, config: &BridgeConfig) -> Self {
        let gitlab_secrets = config
            .gitlab
            .instances
            .iter()
            .map(|(name, instance)| (name.clone(), instance.webhook_secret.clone()))
            .collect();
        Self::new(registry, gitlab_secrets, config.matrix.hs_token.clone())
    }

    fn record_transaction(&self, txn_id: &str) -> bool {
        let mut seen = match self.seen_transactions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.insert(txn_id)
    }
}

#[derive(Debug, Default, Deserialize)]
struct AccessTokenQuery {
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AppserviceTransaction {
    #[serde(default)]
    events: Vec<Value>,
}

fn gitlab_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "error": { "code": code, "message": message.into() } })),
    )
        .into_response()
}

fn matrix_error(status: StatusCode, errcode: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "errcode": errcode, "error": message.into() })),
    )
        .into_response()
}

fn secret_matches(provided: Option<&str>, expected: &str) -> bool {
    provided.is_some_and(|provided| bool::from(provided.as_bytes().ct_eq(expected.as_bytes())))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

pub fn build_bridge_router(state: Arc<BridgeServerState>) -> Router {
    Router::new()
        .route(GITLAB_WEBHOOK_ENDPOINT, post(handle_gitlab_webhook))
        .route(APPSERVICE_TRANSACTION_ENDPOINT, put(handle_appservice_transaction))
        .with_state(state)
}

async fn handle_gitlab_webhook(
    State(state): State<Arc<BridgeServerState>>,
    Path(instance): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(expected_secret) = state.gitlab_secrets.get(&instance) else {
        return gitlab_error(
            StatusCode::NOT_FOUND,
            "unknown_instance",
            format!("gitlab instance '{instance}' is not configured"),
        );
    };
    let provided = headers
        .get(GITLAB_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    if !secret_matches(provided, expected_secret) {
        tracing::warn!(instance = %instance, "rejected gitlab webhook with invalid token");
        return gitlab_error(
            StatusCode::UNAUTHORIZED,
            "invalid_token",
            "missing or invalid X-Gitlab-Token",
        );
    }
    let payload = match parse_gitlab_webhook_json(&body) {
        Ok(payload) => payload,
        Err(error) => {
            return gitlab_error(StatusCode::BAD_REQUEST, "invalid_payload", error.to_string());
        }
    };

    let object_kind = payload.kind().to_string();
    tracing::debug!(instance = %instance, object_kind = %object_kind, "accepted gitlab webhook");
    let registry = state.registry.clone();
    tokio::spawn(async move {
        let report = registry.dispatch_gitlab_webhook(&instance, &payload).await;
        tracing::debug!(
            instance = %instance,
            matched = report.matched,
            failed = report.failed,
            "dispatched gitlab webhook"
        );
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": true, "object_kind": object_kind })),
    )
        .into_response()
}

async fn handle_appservice_transaction(
    State(state): State<Arc<BridgeServerState>>,
    Path(txn_id): Path<String>,
    Query(query): Query<AccessTokenQuery>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(token) = bearer_token(&headers).or(query.access_token.as_deref()) else {
        return matrix_error(
            StatusCode::UNAUTHORIZED,
            "M_UNAUTHORIZED",
            "missing homeserver token",
        );
    };
    if !secret_matches(Some(token), &state.hs_token) {
        return matrix_error(StatusCode::FORBIDDEN, "M_FORBIDDEN", "invalid homeserver token");
    }
    let transaction: AppserviceTransaction = match serde_json::from_str(&body) {
        Ok(transaction) => transaction,
        Err(error) => {
            return matrix_error(StatusCode::BAD_REQUEST, "M_NOT_JSON", error.to_string());
        }
    };
    if !state.record_transaction(&txn_id) {
        tracing::debug!(txn_id = %txn_id, "skipping replayed transaction");
        return (StatusCode::OK, Json(json!({}))).into_response();
    }

    let events = transaction
        .events
        .into_iter()
        .filter_map(|raw| match serde_json::from_value::<MatrixRoomEvent>(raw) {
            Ok(event) => Some(event),
            Err(error) => {
                tracing::debug!(txn_id = %txn_id, error = %error, "skipping undecodable event");
                None
            }
        })
        .collect::<Vec<_>>();
    let registry = state.registry.clone();
    tokio::spawn(async move {
        for event in events {
            registry.dispatch_room_event(&event).await;
        }
    });
    (StatusCode::OK, Json(json!({}))).into_response()
}

/// Serves the bridge router until `shutdown` resolves.
pub async fn serve_bridge<F>(
    listener: TcpListener,
    state: Arc<BridgeServerState>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_bridge_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("gitlab bridge server exited unexpectedly")
}

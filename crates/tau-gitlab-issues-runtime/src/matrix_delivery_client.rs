//! Application-service delivery into Matrix rooms over the Client-Server API.
//!
//! Mirrored comments are sent as virtual users. Before the first send into a
//! room, a virtual user is registered through the application-service
//! registration flow, given the GitLab author's display name and avatar, and
//! joined to the room. Registration and membership are cached per process;
//! profile updates are re-applied when the GitLab profile changes.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tau_gitlab_issues::{
    reaction_annotation_content, MatrixMessageContent, MATRIX_REACTION_EVENT_TYPE,
};

use crate::bridge_collaborators::{DeliveryAck, DeliverySink, RoomIdentity, RoomMetadataField};
use crate::bridge_transport_helpers::{
    is_retryable_matrix_status, is_retryable_transport_error, parse_retry_after, retry_delay,
    truncate_for_error, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_RETRY_BASE_DELAY_MS,
    DEFAULT_RETRY_MAX_ATTEMPTS,
};

const APPSERVICE_LOGIN_TYPE: &str = "m.login.application_service";
const USER_IN_USE_ERRCODE: &str = "M_USER_IN_USE";
const DEFAULT_AVATAR_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Deserialize)]
struct MatrixEventIdResponse {
    #[serde(default)]
    event_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MatrixErrorResponse {
    #[serde(default)]
    errcode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MatrixContentUploadResponse {
    content_uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Profile last applied to a virtual user, keyed by the GitLab-side values.
struct AppliedProfile {
    display_name: Option<String>,
    avatar_source: Option<String>,
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn user_localpart(user_id: &str) -> Result<&str> {
    user_id
        .strip_prefix('@')
        .and_then(|rest| rest.split_once(':'))
        .map(|(localpart, _)| localpart)
        .filter(|localpart| !localpart.is_empty())
        .ok_or_else(|| anyhow!("invalid matrix user id '{user_id}'"))
}

fn matrix_errcode(body: &str) -> Option<String> {
    serde_json::from_str::<MatrixErrorResponse>(body)
        .ok()
        .and_then(|error| error.errcode)
}

pub struct MatrixDeliveryClient {
    http: reqwest::Client,
    media_http: reqwest::Client,
    homeserver_url: String,
    txn_prefix: String,
    txn_counter: AtomicU64,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
    puppet_profiles: Mutex<HashMap<String, AppliedProfile>>,
    joined_rooms: Mutex<HashSet<(String, String)>>,
}

impl MatrixDeliveryClient {
    pub fn new(
        homeserver_url: &str,
        as_token: &str,
        request_timeout_ms: u64,
        retry_max_attempts: usize,
        retry_base_delay_ms: u64,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("Tau-gitlab-issues-bridge"),
        );
        let auth_header = format!("Bearer {}", as_token.trim());
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&auth_header)
                .context("invalid matrix authorization header")?,
        );
        let timeout = Duration::from_millis(request_timeout_ms.max(1));
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("failed to create matrix delivery client")?;
        // Avatar downloads go to GitLab, never with the appservice token.
        let media_client = reqwest::Client::builder()
            .user_agent("Tau-gitlab-issues-bridge")
            .timeout(timeout)
            .build()
            .context("failed to create avatar download client")?;
        let started_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        Ok(Self {
            http: client,
            media_http: media_client,
            homeserver_url: homeserver_url.trim().trim_end_matches('/').to_string(),
            txn_prefix: format!("tau-{started_unix_ms}"),
            txn_counter: AtomicU64::new(0),
            retry_max_attempts: retry_max_attempts.max(1),
            retry_base_delay_ms: retry_base_delay_ms.max(1),
            puppet_profiles: Mutex::new(HashMap::new()),
            joined_rooms: Mutex::new(HashSet::new()),
        })
    }

    pub fn with_defaults(homeserver_url: &str, as_token: &str) -> Result<Self> {
        Self::new(
            homeserver_url,
            as_token,
            DEFAULT_REQUEST_TIMEOUT_MS,
            DEFAULT_RETRY_MAX_ATTEMPTS,
            DEFAULT_RETRY_BASE_DELAY_MS,
        )
    }

    /// Transaction ids are unique for the lifetime of the process.
    pub fn next_txn_id(&self) -> String {
        let sequence = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{sequence}", self.txn_prefix)
    }

    fn endpoint_url(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.homeserver_url)
            .with_context(|| format!("invalid homeserver url '{}'", self.homeserver_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("homeserver url '{}' cannot be a base", self.homeserver_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn client_url(&self, tail: &[&str]) -> Result<reqwest::Url> {
        let mut segments = vec!["_matrix", "client", "v3"];
        segments.extend_from_slice(tail);
        self.endpoint_url(&segments)
    }

    fn room_url(&self, room_id: &str, tail: &[&str]) -> Result<reqwest::Url> {
        let mut segments = vec!["rooms", room_id];
        segments.extend_from_slice(tail);
        self.client_url(&segments)
    }

    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
        as_user: Option<&str>,
    ) -> Result<DeliveryAck> {
        let txn_id = self.next_txn_id();
        let mut url = self.room_url(room_id, &["send", event_type, txn_id.as_str()])?;
        if let Some(as_user) = as_user {
            url.query_pairs_mut().append_pair("user_id", as_user);
        }
        let response: MatrixEventIdResponse = self
            .request_json("send event", || self.http.put(url.clone()).json(content))
            .await?;
        Ok(DeliveryAck {
            event_id: response.event_id,
        })
    }

    async fn put_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<()> {
        let url = self.room_url(room_id, &["state", event_type, state_key])?;
        self.request_json::<Value, _>("put state", || self.http.put(url.clone()).json(content))
            .await?;
        Ok(())
    }

    /// Registers `user_id` in the appservice namespace. An existing account is
    /// not an error.
    async fn register_puppet(&self, user_id: &str) -> Result<()> {
        let localpart = user_localpart(user_id)?;
        let url = self.client_url(&["register"])?;
        let body = json!({
            "type": APPSERVICE_LOGIN_TYPE,
            "username": localpart,
            "inhibit_login": true,
        });
        let response = self
            .send_with_retry("register", || self.http.post(url.clone()).json(&body))
            .await?;
        let status = response.status();
        if status.is_success() {
            tracing::debug!(user_id, "registered virtual user");
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        if matrix_errcode(&text).as_deref() == Some(USER_IN_USE_ERRCODE) {
            return Ok(());
        }
        bail!(
            "matrix api register failed with status {}: {}",
            status.as_u16(),
            truncate_for_error(&text, 800)
        );
    }

    async fn set_puppet_display_name(&self, user_id: &str, display_name: &str) -> Result<()> {
        let mut url = self.client_url(&["profile", user_id, "displayname"])?;
        url.query_pairs_mut().append_pair("user_id", user_id);
        let body = json!({ "displayname": display_name });
        self.request_json::<Value, _>("set displayname", || self.http.put(url.clone()).json(&body))
            .await?;
        Ok(())
    }

    async fn set_puppet_avatar(&self, user_id: &str, avatar_source: &str) -> Result<()> {
        let content_uri = self.avatar_content_uri(avatar_source).await?;
        let mut url = self.client_url(&["profile", user_id, "avatar_url"])?;
        url.query_pairs_mut().append_pair("user_id", user_id);
        let body = json!({ "avatar_url": content_uri });
        self.request_json::<Value, _>("set avatar_url", || self.http.put(url.clone()).json(&body))
            .await?;
        Ok(())
    }

    /// `mxc://` sources are used as-is; anything else is downloaded and
    /// re-uploaded to the homeserver media repository.
    async fn avatar_content_uri(&self, avatar_source: &str) -> Result<String> {
        if avatar_source.starts_with("mxc://") {
            return Ok(avatar_source.to_string());
        }
        let response = self
            .media_http
            .get(avatar_source)
            .send()
            .await
            .with_context(|| format!("failed to download avatar '{avatar_source}'"))?
            .error_for_status()
            .with_context(|| format!("avatar '{avatar_source}' is unavailable"))?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(DEFAULT_AVATAR_CONTENT_TYPE)
            .to_string();
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed to read avatar '{avatar_source}'"))?;
        let url = self.endpoint_url(&["_matrix", "media", "v3", "upload"])?;
        let uploaded: MatrixContentUploadResponse = self
            .request_json("upload avatar", || {
                self.http
                    .post(url.clone())
                    .header(reqwest::header::CONTENT_TYPE, content_type.as_str())
                    .body(bytes.clone())
            })
            .await?;
        Ok(uploaded.content_uri)
    }

    /// Applies the profile fields that differ from `applied`. Profile failures
    /// are logged and left for the next delivery to retry.
    async fn apply_puppet_profile(
        &self,
        identity: &RoomIdentity,
        applied: &AppliedProfile,
    ) -> AppliedProfile {
        let mut updated = applied.clone();
        if let Some(display_name) = identity
            .display_name
            .as_deref()
            .filter(|name| applied.display_name.as_deref() != Some(*name))
        {
            match self
                .set_puppet_display_name(&identity.user_id, display_name)
                .await
            {
                Ok(()) => updated.display_name = Some(display_name.to_string()),
                Err(error) => tracing::warn!(
                    user_id = %identity.user_id,
                    error = %format!("{error:#}"),
                    "failed to set virtual user display name"
                ),
            }
        }
        if let Some(avatar_source) = identity
            .avatar_url
            .as_deref()
            .map(str::trim)
            .filter(|source| !source.is_empty())
            .filter(|source| applied.avatar_source.as_deref() != Some(*source))
        {
            match self.set_puppet_avatar(&identity.user_id, avatar_source).await {
                Ok(()) => updated.avatar_source = Some(avatar_source.to_string()),
                Err(error) => tracing::warn!(
                    user_id = %identity.user_id,
                    error = %format!("{error:#}"),
                    "failed to set virtual user avatar"
                ),
            }
        }
        updated
    }

    async fn join_room_as(&self, room_id: &str, user_id: &str) -> Result<()> {
        let mut url = self.room_url(room_id, &["join"])?;
        url.query_pairs_mut().append_pair("user_id", user_id);
        self.request_json::<Value, _>("join room", || self.http.post(url.clone()).json(&json!({})))
            .await?;
        tracing::debug!(user_id, room_id, "virtual user joined room");
        Ok(())
    }

    /// Sends with retries on transport failures and retryable statuses.
    /// Returns the final response whatever its status.
    async fn send_with_retry<F>(
        &self,
        operation: &str,
        mut request_builder: F,
    ) -> Result<reqwest::Response>
    where
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = request_builder()
                .header("x-tau-retry-attempt", attempt.saturating_sub(1).to_string())
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if attempt < self.retry_max_attempts
                        && is_retryable_matrix_status(status.as_u16())
                    {
                        let retry_after = parse_retry_after(response.headers());
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }
                    return Ok(response);
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts && is_retryable_transport_error(&error) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("matrix api {operation} request failed"));
                }
            }
        }
    }

    async fn request_json<T, F>(&self, operation: &str, request_builder: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let response = self.send_with_retry(operation, request_builder).await?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .with_context(|| format!("failed to decode matrix {operation}"));
        }
        let body = response.text().await.unwrap_or_default();
        bail!(
            "matrix api {operation} failed with status {}: {}",
            status.as_u16(),
            truncate_for_error(&body, 800)
        );
    }
}

#[async_trait]
impl DeliverySink for MatrixDeliveryClient {
    async fn ensure_room_identity(&self, room_id: &str, identity: &RoomIdentity) -> Result<()> {
        let known = lock_or_recover(&self.puppet_profiles)
            .get(&identity.user_id)
            .cloned();
        let applied = match known {
            Some(applied) => applied,
            None => {
                self.register_puppet(&identity.user_id).await?;
                AppliedProfile::default()
            }
        };
        let updated = self.apply_puppet_profile(identity, &applied).await;
        lock_or_recover(&self.puppet_profiles).insert(identity.user_id.clone(), updated);

        let membership = (identity.user_id.clone(), room_id.to_string());
        let joined = lock_or_recover(&self.joined_rooms).contains(&membership);
        if !joined {
            self.join_room_as(room_id, &identity.user_id).await?;
            lock_or_recover(&self.joined_rooms).insert(membership);
        }
        Ok(())
    }

    async fn send_message(
        &self,
        room_id: &str,
        message: &MatrixMessageContent,
        event_type: &str,
        as_user: &str,
    ) -> Result<DeliveryAck> {
        let content = serde_json::to_value(message).context("failed to encode room message")?;
        self.send_event(room_id, event_type, &content, Some(as_user)).await
    }

    async fn send_reaction(
        &self,
        room_id: &str,
        relates_to_event_id: &str,
        annotation: &str,
    ) -> Result<DeliveryAck> {
        let content = reaction_annotation_content(relates_to_event_id, annotation);
        self.send_event(room_id, MATRIX_REACTION_EVENT_TYPE, &content, None).await
    }

    async fn set_room_metadata(
        &self,
        room_id: &str,
        field: RoomMetadataField,
        value: &str,
    ) -> Result<()> {
        let content = json!({ field.content_key(): value });
        self.put_state(room_id, field.event_type(), "", &content).await
    }

    async fn set_room_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<()> {
        self.put_state(room_id, event_type, state_key, content).await
    }

    async fn get_room_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>> {
        let url = self.room_url(room_id, &["state", event_type, state_key])?;
        let response = self
            .send_with_retry("get state", || self.http.get(url.clone()))
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_success() {
            let content = response
                .json::<Value>()
                .await
                .context("failed to decode matrix get state")?;
            return Ok(Some(content));
        }
        let body = response.text().await.unwrap_or_default();
        bail!(
            "matrix api get state failed with status {}: {}",
            status.as_u16(),
            truncate_for_error(&body, 800)
        );
    }
}

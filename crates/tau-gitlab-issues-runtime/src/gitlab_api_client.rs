//! GitLab REST client used to post room messages as issue notes.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tau_gitlab_issues::{canonical_issue_url, ProjectPath};

use crate::bridge_collaborators::{CreatedComment, TrackerClient, TrackerCredentials};
use crate::bridge_transport_helpers::{
    is_retryable_gitlab_status, is_unsent_transport_error, parse_retry_after, retry_delay,
    truncate_for_error, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_RETRY_BASE_DELAY_MS,
    DEFAULT_RETRY_MAX_ATTEMPTS,
};

#[derive(Debug, Clone, Deserialize)]
struct GitlabNoteCreateResponse {
    id: u64,
}

/// Builds `{instance}/api/v4/projects/{encoded path}/issues/{iid}/notes`.
pub fn gitlab_issue_notes_url(
    instance_url: &str,
    projects: &ProjectPath,
    issue_iid: u64,
) -> Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(instance_url.trim())
        .with_context(|| format!("invalid gitlab instance url '{instance_url}'"))?;
    let iid = issue_iid.to_string();
    let project = projects.joined();
    url.path_segments_mut()
        .map_err(|_| anyhow!("gitlab instance url '{instance_url}' cannot be a base"))?
        .pop_if_empty()
        .extend(["api", "v4", "projects", project.as_str(), "issues", iid.as_str(), "notes"]);
    Ok(url)
}

#[derive(Clone)]
pub struct GitlabApiClient {
    http: reqwest::Client,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl GitlabApiClient {
    pub fn new(
        request_timeout_ms: u64,
        retry_max_attempts: usize,
        retry_base_delay_ms: u64,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("Tau-gitlab-issues-bridge"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create gitlab api client")?;
        Ok(Self {
            http: client,
            retry_max_attempts: retry_max_attempts.max(1),
            retry_base_delay_ms: retry_base_delay_ms.max(1),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(
            DEFAULT_REQUEST_TIMEOUT_MS,
            DEFAULT_RETRY_MAX_ATTEMPTS,
            DEFAULT_RETRY_BASE_DELAY_MS,
        )
    }

    async fn request_json<T, F>(&self, operation: &str, mut request_builder: F) -> Result<T>
    where
        T: DeserializeOwned,
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
                    if status.is_success() {
                        let parsed = response
                            .json::<T>()
                            .await
                            .with_context(|| format!("failed to decode gitlab {operation}"))?;
                        return Ok(parsed);
                    }

                    let retry_after = parse_retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if attempt < self.retry_max_attempts
                        && is_retryable_gitlab_status(status.as_u16())
                    {
                        tracing::warn!(
                            operation,
                            status = status.as_u16(),
                            attempt,
                            "gitlab api rate limited, retrying"
                        );
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }

                    bail!(
                        "gitlab api {operation} failed with status {}: {}",
                        status.as_u16(),
                        truncate_for_error(&body, 800)
                    );
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts && is_unsent_transport_error(&error) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("gitlab api {operation} request failed"));
                }
            }
        }
    }
}

#[async_trait]
impl TrackerClient for GitlabApiClient {
    async fn create_comment(
        &self,
        credentials: &TrackerCredentials,
        instance_url: &str,
        projects: &ProjectPath,
        issue_iid: u64,
        body: &str,
    ) -> Result<CreatedComment> {
        let url = gitlab_issue_notes_url(instance_url, projects, issue_iid)?;
        let payload = json!({ "body": body });
        let token = credentials.token.trim();
        let created: GitlabNoteCreateResponse = self
            .request_json("create note", || {
                self.http
                    .post(url.clone())
                    .header("PRIVATE-TOKEN", token)
                    .json(&payload)
            })
            .await?;
        let issue_url = canonical_issue_url(instance_url, projects, issue_iid);
        Ok(CreatedComment {
            comment_id: created.id.to_string(),
            web_url: Some(format!("{issue_url}#note_{}", created.id)),
        })
    }
}

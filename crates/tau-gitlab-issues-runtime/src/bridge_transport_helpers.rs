use std::time::Duration;

pub(crate) const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub(crate) const DEFAULT_RETRY_MAX_ATTEMPTS: usize = 3;
pub(crate) const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 250;

pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get("retry-after")?.to_str().ok()?;
    let seconds = raw.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}

pub(crate) fn retry_delay(
    base_delay_ms: u64,
    attempt: usize,
    retry_after: Option<Duration>,
) -> Duration {
    if let Some(delay) = retry_after {
        return delay.max(Duration::from_millis(base_delay_ms));
    }
    let exponent = attempt.saturating_sub(1).min(10) as u32;
    let scaled = base_delay_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(scaled.min(30_000))
}

/// Failures where the request never reached the server.
pub(crate) fn is_unsent_transport_error(error: &reqwest::Error) -> bool {
    error.is_connect()
}

/// Failures worth retrying for idempotent requests.
pub(crate) fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

/// Note creation is not idempotent: rate limits only.
pub(crate) fn is_retryable_gitlab_status(status: u16) -> bool {
    status == 429
}

pub(crate) fn is_retryable_matrix_status(status: u16) -> bool {
    status == 429 || status >= 500
}

pub(crate) fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::{
    header::{HeaderMap, RETRY_AFTER},
    Client, RequestBuilder, Response, StatusCode,
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::read_u64_env;

const DEFAULT_INITIAL_BACKOFF_MS: u64 = 250;
const DEFAULT_MAX_BACKOFF_MS: u64 = 4_000;
const MAX_ERROR_MESSAGE_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    pub(crate) fn apply_env(&mut self) {
        if let Some(initial_backoff_ms) = read_u64_env("LYRICS_HTTP_RETRY_INITIAL_BACKOFF_MS") {
            self.initial_backoff_ms = initial_backoff_ms.max(1);
        }

        if let Some(max_backoff_ms) = read_u64_env("LYRICS_HTTP_RETRY_MAX_BACKOFF_MS") {
            self.max_backoff_ms = max_backoff_ms.max(1);
        }

        if self.initial_backoff_ms > self.max_backoff_ms {
            self.initial_backoff_ms = self.max_backoff_ms;
        }
    }
}

/// Retry scheduling for idempotent requests.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    policy: RetryPolicy,
    jitter_seed: u64,
}

impl Backoff {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self::with_jitter_seed(policy, seed_from_clock())
    }

    pub(crate) fn with_jitter_seed(policy: RetryPolicy, jitter_seed: u64) -> Self {
        Self {
            policy,
            jitter_seed,
        }
    }

    pub(crate) fn max_retries(&self) -> u32 {
        self.policy.max_retries
    }

    pub(crate) fn delay(&self, attempt_index: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(delay) = retry_after {
            return delay;
        }

        let growth_factor = 1_u64.checked_shl(attempt_index.min(20)).unwrap_or(u64::MAX);
        let uncapped_ms = self.policy.initial_backoff_ms.saturating_mul(growth_factor);
        let capped_ms = uncapped_ms.min(self.policy.max_backoff_ms).max(1);

        // Equal jitter: the delay lands in [base/2, base].
        let half_ms = capped_ms / 2;
        let jitter_span_ms = capped_ms.saturating_sub(half_ms);
        let jitter_offset = if jitter_span_ms == 0 {
            0
        } else {
            self.pseudo_random(attempt_index) % (jitter_span_ms + 1)
        };

        Duration::from_millis(half_ms.saturating_add(jitter_offset).max(1))
    }

    fn pseudo_random(&self, attempt_index: u32) -> u64 {
        let mut state =
            self.jitter_seed ^ (attempt_index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        state.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

/// A failed request, classified for retry and for the caller's own error type.
#[derive(Debug)]
pub(crate) struct HttpFailure {
    pub status: Option<StatusCode>,
    pub message: String,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
}

pub(crate) fn build_client(timeout_secs: u64) -> Result<Client, reqwest::Error> {
    let timeout = Duration::from_secs(timeout_secs.max(1));
    debug!(timeout_secs = timeout.as_secs(), "building HTTP client");
    Client::builder().timeout(timeout).build()
}

pub(crate) fn transport_failure(error: reqwest::Error) -> HttpFailure {
    HttpFailure {
        status: None,
        retryable: error.is_timeout() || error.is_connect(),
        message: error.to_string(),
        retry_after: None,
    }
}

pub(crate) async fn status_failure(response: Response) -> HttpFailure {
    let status = response.status();
    let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
        parse_retry_after(response.headers())
    } else {
        None
    };
    let body = response.text().await.unwrap_or_default();
    let message = parse_error_message(&body)
        .unwrap_or_else(|| format!("request failed with status {}", status.as_u16()));

    HttpFailure {
        status: Some(status),
        retryable: status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error(),
        message,
        retry_after,
    }
}

/// Sends a request once, mapping transport errors and non-2xx statuses to a failure.
pub(crate) async fn send_once(request: RequestBuilder) -> Result<Response, HttpFailure> {
    let response = request.send().await.map_err(transport_failure)?;
    if response.status().is_success() {
        return Ok(response);
    }

    Err(status_failure(response).await)
}

/// Sends an idempotent request, retrying retryable failures per the backoff schedule.
pub(crate) async fn send_with_retry<F>(
    label: &'static str,
    backoff: &Backoff,
    build_request: F,
) -> Result<Response, HttpFailure>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt_index = 0;
    loop {
        debug!(request = label, attempt = attempt_index + 1, "sending request");
        let failure = match send_once(build_request()).await {
            Ok(response) => return Ok(response),
            Err(failure) => failure,
        };

        if !failure.retryable || attempt_index >= backoff.max_retries() {
            return Err(failure);
        }

        let delay = backoff.delay(attempt_index, failure.retry_after);
        warn!(
            request = label,
            attempt = attempt_index + 1,
            delay_ms = delay.as_millis() as u64,
            status = failure.status.map(|status| status.as_u16()),
            error = %failure.message,
            "retrying request"
        );
        tokio::time::sleep(delay).await;
        attempt_index += 1;
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorEnvelope {
    Nested { error: ErrorBody },
    Flat(ErrorBody),
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, alias = "title", rename = "type")]
    kind: Option<String>,
}

fn parse_error_message(raw_body: &str) -> Option<String> {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(raw_body) {
        let body = match envelope {
            ErrorEnvelope::Nested { error } => error,
            ErrorEnvelope::Flat(body) => body,
        };
        return normalize_optional_string(body.message)
            .or_else(|| normalize_optional_string(body.kind));
    }

    let trimmed = raw_body.trim();
    if trimmed.is_empty() || trimmed.starts_with('{') || trimmed.starts_with('<') {
        return None;
    }

    Some(trimmed.chars().take(MAX_ERROR_MESSAGE_CHARS).collect())
}

pub(crate) fn normalize_optional_string(value: Option<String>) -> Option<String> {
    value.and_then(|content| {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header_value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if header_value.is_empty() {
        return None;
    }

    if let Ok(seconds) = header_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let retry_at = httpdate::parse_http_date(header_value).ok()?;
    Some(
        retry_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::from_secs(0)),
    )
}

fn seed_from_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or(0xA5A5_A5A5_A5A5_A5A5)
}

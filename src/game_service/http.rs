use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use reqwest::{multipart, Body, Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, error, info};

use crate::{
    config::{read_non_empty_env, read_u32_env, read_u64_env},
    http_client::{self, Backoff, HttpFailure, RetryPolicy},
    models::{Attempt, AttemptId, Game, GameId, NewLyricsAttempt, Statistic, User, WrongAttempt},
    submission::{AudioSource, AudioUpload, ProgressSender, UploadProgress},
};

use super::{GameService, ServiceError};

const DEFAULT_GAME_API_URL: &str = "http://localhost:5000";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const UPLOAD_CHUNK_BYTES: usize = 16 * 1024;
pub const GAME_STATUS_HEADER: &str = "x-game-status";
const GAME_STATUS_LOST: &str = "lost";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GameApiConfig {
    pub base_url: String,
    pub access_token: Option<String>,
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for GameApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_GAME_API_URL.to_string(),
            access_token: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            retry: RetryPolicy::default(),
        }
    }
}

impl GameApiConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub(crate) fn apply_env(&mut self) {
        if let Some(base_url) = read_non_empty_env("LYRICS_GAME_API_URL") {
            self.base_url = base_url;
        }

        if let Some(access_token) = read_non_empty_env("LYRICS_GAME_API_TOKEN") {
            self.access_token = Some(access_token);
        }

        if let Some(timeout_secs) = read_u64_env("LYRICS_GAME_API_TIMEOUT_SECS") {
            self.request_timeout_secs = timeout_secs.max(1);
        }

        if let Some(max_retries) = read_u32_env("LYRICS_GAME_API_MAX_RETRIES") {
            self.retry.max_retries = max_retries;
        }

        self.retry.apply_env();
    }
}

#[derive(Debug, Clone)]
pub struct HttpGameService {
    client: Client,
    config: GameApiConfig,
    backoff: Backoff,
}

impl HttpGameService {
    pub fn new(config: GameApiConfig) -> Result<Self, ServiceError> {
        let backoff = Backoff::new(config.retry.clone());
        Self::with_backoff(config, backoff)
    }

    fn with_backoff(config: GameApiConfig, backoff: Backoff) -> Result<Self, ServiceError> {
        let client = http_client::build_client(config.request_timeout_secs)
            .map_err(|error| ServiceError::Request(error.to_string()))?;
        info!(
            base_url = %config.base_url,
            request_timeout_secs = config.request_timeout_secs,
            max_retries = config.retry.max_retries,
            "game service client initialized"
        );

        Ok(Self {
            client,
            config,
            backoff,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.config.access_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        label: &'static str,
        path: &str,
    ) -> Result<T, ServiceError> {
        let url = self.url(path);
        let response = http_client::send_with_retry(label, &self.backoff, || {
            self.authorized(self.client.get(&url))
        })
        .await
        .map_err(|failure| map_failure(label, failure))?;

        response
            .json::<T>()
            .await
            .map_err(|error| ServiceError::InvalidResponse(error.to_string()))
    }

    async fn send_for_game(
        &self,
        label: &'static str,
        request: RequestBuilder,
    ) -> Result<Game, ServiceError> {
        let response = http_client::send_once(self.authorized(request))
            .await
            .map_err(|failure| map_failure(label, failure))?;

        response
            .json::<Game>()
            .await
            .map_err(|error| ServiceError::InvalidResponse(error.to_string()))
    }

    async fn send_for_optional_attempt(
        &self,
        label: &'static str,
        request: RequestBuilder,
    ) -> Result<Option<Attempt>, ServiceError> {
        let response = http_client::send_once(self.authorized(request))
            .await
            .map_err(|failure| map_failure(label, failure))?;

        decode_optional_attempt(response).await
    }
}

#[async_trait]
impl GameService for HttpGameService {
    async fn current_user(&self) -> Result<User, ServiceError> {
        self.get_json("current_user", "/api/user").await
    }

    async fn user_statistics(&self) -> Result<Statistic, ServiceError> {
        self.get_json("user_statistics", "/api/user/statistic").await
    }

    async fn create_game(&self) -> Result<Game, ServiceError> {
        let request = self.client.post(self.url("/api/game"));
        self.send_for_game("create_game", request).await
    }

    async fn end_game(&self, game_id: GameId) -> Result<Game, ServiceError> {
        let request = self.client.put(self.url(&format!("/api/game/{game_id}/end")));
        self.send_for_game("end_game", request).await
    }

    async fn end_game_as_loss(&self, game_id: GameId) -> Result<Game, ServiceError> {
        let request = self.client.put(self.url(&format!("/api/game/{game_id}/lose")));
        self.send_for_game("end_game_as_loss", request).await
    }

    async fn submit_text_attempt(
        &self,
        attempt: NewLyricsAttempt,
    ) -> Result<Option<Attempt>, ServiceError> {
        let request = self.client.post(self.url("/api/attempt")).json(&attempt);
        self.send_for_optional_attempt("submit_text_attempt", request)
            .await
    }

    async fn submit_audio_attempt(
        &self,
        game_id: GameId,
        upload: AudioUpload,
        progress: Option<ProgressSender>,
    ) -> Result<Option<Attempt>, ServiceError> {
        let path = match upload.source {
            AudioSource::Recording => "/api/attempt/voice",
            AudioSource::File => "/api/attempt/file",
        };
        let form = build_audio_form(game_id, upload, progress)?;
        let request = self.client.post(self.url(path)).multipart(form);
        self.send_for_optional_attempt("submit_audio_attempt", request)
            .await
    }

    async fn judge_right(&self, attempt_id: AttemptId) -> Result<Game, ServiceError> {
        let request = self
            .client
            .put(self.url(&format!("/api/attempt/{attempt_id}/right")));
        self.send_for_game("judge_right", request).await
    }

    async fn judge_wrong(&self, attempt: WrongAttempt) -> Result<Option<Attempt>, ServiceError> {
        let request = self.client.put(self.url("/api/attempt/wrong")).json(&attempt);
        self.send_for_optional_attempt("judge_wrong", request).await
    }
}

fn map_failure(label: &'static str, failure: HttpFailure) -> ServiceError {
    error!(
        request = label,
        status = failure.status.map(|status| status.as_u16()),
        error = %failure.message,
        "game service request failed"
    );

    match failure.status {
        Some(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
            ServiceError::Unauthenticated(failure.message)
        }
        Some(status) => ServiceError::Http {
            status: status.as_u16(),
            message: failure.message,
        },
        None => ServiceError::Network(failure.message),
    }
}

async fn decode_optional_attempt(response: Response) -> Result<Option<Attempt>, ServiceError> {
    let status = response.status();
    let lost_header = response
        .headers()
        .get(GAME_STATUS_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case(GAME_STATUS_LOST));
    let body = response
        .text()
        .await
        .map_err(|error| ServiceError::Network(error.to_string()))?;

    parse_optional_attempt(status, lost_header, &body)
}

/// Explicit signals (204, `X-Game-Status: lost`) come first; an empty or `null`
/// body is still honored. Anything else must decode as an attempt.
fn parse_optional_attempt(
    status: StatusCode,
    lost_header: bool,
    body: &str,
) -> Result<Option<Attempt>, ServiceError> {
    if lost_header || status == StatusCode::NO_CONTENT {
        debug!(status = status.as_u16(), lost_header, "explicit terminal signal");
        return Ok(None);
    }

    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "null" {
        debug!(status = status.as_u16(), "empty attempt body treated as terminal signal");
        return Ok(None);
    }

    serde_json::from_str::<Attempt>(trimmed)
        .map(Some)
        .map_err(|error| ServiceError::InvalidResponse(error.to_string()))
}

fn build_audio_form(
    game_id: GameId,
    upload: AudioUpload,
    progress: Option<ProgressSender>,
) -> Result<multipart::Form, ServiceError> {
    let AudioUpload {
        bytes,
        mime_type,
        file_name,
        ..
    } = upload;
    let total_bytes = bytes.len() as u64;
    let chunks: Vec<Bytes> = (0..bytes.len())
        .step_by(UPLOAD_CHUNK_BYTES)
        .map(|start| bytes.slice(start..(start + UPLOAD_CHUNK_BYTES).min(bytes.len())))
        .collect();

    let mut sent_bytes = 0_u64;
    let body_stream = stream::iter(chunks.into_iter().map(move |chunk| {
        sent_bytes += chunk.len() as u64;
        if let Some(progress) = progress.as_ref() {
            let _ = progress.send(UploadProgress {
                sent_bytes,
                total_bytes,
            });
        }
        Ok::<Bytes, std::io::Error>(chunk)
    }));

    let part = multipart::Part::stream_with_length(Body::wrap_stream(body_stream), total_bytes)
        .file_name(file_name)
        .mime_str(&mime_type)
        .map_err(|error| ServiceError::Request(format!("invalid audio mime type: {error}")))?;

    Ok(multipart::Form::new()
        .text("GameId", game_id.to_string())
        .part("FormData", part))
}

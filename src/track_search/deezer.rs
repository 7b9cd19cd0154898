use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    config::{read_non_empty_env, read_u32_env, read_u64_env},
    http_client::{self, normalize_optional_string, Backoff, HttpFailure, RetryPolicy},
};

use super::{SearchError, TrackCandidate, TrackSearch};

const DEFAULT_SEARCH_ENDPOINT: &str = "https://api.deezer.com/search";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RESULT_LIMIT: u32 = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackSearchConfig {
    pub endpoint: String,
    pub request_timeout_secs: u64,
    pub result_limit: u32,
    pub retry: RetryPolicy,
}

impl Default for TrackSearchConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_SEARCH_ENDPOINT.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            result_limit: DEFAULT_RESULT_LIMIT,
            retry: RetryPolicy::default(),
        }
    }
}

impl TrackSearchConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub(crate) fn apply_env(&mut self) {
        if let Some(endpoint) = read_non_empty_env("LYRICS_TRACK_SEARCH_URL") {
            self.endpoint = endpoint;
        }

        if let Some(timeout_secs) = read_u64_env("LYRICS_TRACK_SEARCH_TIMEOUT_SECS") {
            self.request_timeout_secs = timeout_secs.max(1);
        }

        if let Some(max_retries) = read_u32_env("LYRICS_TRACK_SEARCH_MAX_RETRIES") {
            self.retry.max_retries = max_retries;
        }

        self.retry.apply_env();
    }
}

#[derive(Debug, Clone)]
pub struct DeezerTrackSearch {
    client: Client,
    config: TrackSearchConfig,
    backoff: Backoff,
}

impl DeezerTrackSearch {
    pub fn new(config: TrackSearchConfig) -> Result<Self, SearchError> {
        let backoff = Backoff::new(config.retry.clone());
        Self::with_backoff(config, backoff)
    }

    fn with_backoff(config: TrackSearchConfig, backoff: Backoff) -> Result<Self, SearchError> {
        let client = http_client::build_client(config.request_timeout_secs)
            .map_err(|error| SearchError::Provider(error.to_string()))?;
        info!(
            endpoint = %config.endpoint,
            result_limit = config.result_limit,
            "track search client initialized"
        );

        Ok(Self {
            client,
            config,
            backoff,
        })
    }
}

#[async_trait]
impl TrackSearch for DeezerTrackSearch {
    fn name(&self) -> &'static str {
        "deezer"
    }

    async fn search(&self, artist: &str, title: &str) -> Result<Vec<TrackCandidate>, SearchError> {
        let query = build_query(artist, title);
        let limit = self.config.result_limit.to_string();
        let response = http_client::send_with_retry("track_search", &self.backoff, || {
            self.client
                .get(&self.config.endpoint)
                .query(&[("q", query.as_str()), ("limit", limit.as_str())])
        })
        .await
        .map_err(map_failure)?;

        let payload: DeezerSearchResponse = response
            .json()
            .await
            .map_err(|error| SearchError::InvalidResponse(error.to_string()))?;

        // Deezer reports quota and query errors inside a 200 response.
        if let Some(error) = payload.error {
            let message = normalize_optional_string(error.message)
                .or_else(|| normalize_optional_string(error.kind))
                .unwrap_or_else(|| "unknown provider error".to_string());
            warn!(code = ?error.code, %message, "track search provider rejected query");
            return Err(SearchError::Provider(message));
        }

        Ok(payload.data.into_iter().map(TrackCandidate::from).collect())
    }
}

#[derive(Debug, Deserialize)]
struct DeezerSearchResponse {
    #[serde(default)]
    data: Vec<DeezerTrack>,
    #[serde(default)]
    error: Option<DeezerError>,
}

#[derive(Debug, Deserialize)]
struct DeezerTrack {
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    preview: Option<String>,
    #[serde(default)]
    artist: Option<DeezerArtist>,
}

#[derive(Debug, Deserialize)]
struct DeezerArtist {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct DeezerError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    code: Option<i64>,
}

impl From<DeezerTrack> for TrackCandidate {
    fn from(track: DeezerTrack) -> Self {
        Self {
            id: track.id,
            title: track.title,
            artist: track.artist.map(|artist| artist.name).unwrap_or_default(),
            preview_url: normalize_optional_string(track.preview),
            link: normalize_optional_string(track.link),
        }
    }
}

fn build_query(artist: &str, title: &str) -> String {
    let clause = |field: &str, value: &str| {
        let cleaned = value.replace('"', " ");
        let cleaned = cleaned.trim();
        if cleaned.is_empty() {
            None
        } else {
            Some(format!("{field}:\"{cleaned}\""))
        }
    };

    [clause("artist", artist), clause("track", title)]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
}

fn map_failure(failure: HttpFailure) -> SearchError {
    warn!(
        status = failure.status.map(|status| status.as_u16()),
        error = %failure.message,
        "track search request failed"
    );
    match failure.status {
        None => SearchError::Network(failure.message),
        Some(status) if status.is_server_error() => SearchError::Network(failure.message),
        Some(_) => SearchError::Provider(failure.message),
    }
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};

    use super::*;

    fn search_for_test(server: &Server, max_retries: u32) -> DeezerTrackSearch {
        let retry = RetryPolicy {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        };
        let config = TrackSearchConfig {
            endpoint: format!("{}/search", server.url()),
            request_timeout_secs: 5,
            result_limit: 5,
            retry: retry.clone(),
        };
        DeezerTrackSearch::with_backoff(config, Backoff::with_jitter_seed(retry, 7))
            .expect("client should build")
    }

    #[test]
    fn query_uses_field_clauses_and_strips_quotes() {
        assert_eq!(build_query("A", "T"), r#"artist:"A" track:"T""#);
        assert_eq!(build_query(" \"Queen\" ", ""), r#"artist:"Queen""#);
        assert_eq!(build_query("", "Yesterday"), r#"track:"Yesterday""#);
    }

    #[tokio::test]
    async fn search_returns_ranked_candidates() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/search")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("q".to_string(), r#"artist:"A" track:"T""#.to_string()),
                Matcher::UrlEncoded("limit".to_string(), "5".to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "data": [
                        {"id": 99, "title": "T", "preview": "https://cdn.test/99.mp3", "artist": {"name": "A"}},
                        {"id": 100, "title": "T (live)", "artist": {"name": "A"}}
                    ],
                    "total": 2
                }"#,
            )
            .create_async()
            .await;

        let candidates = search_for_test(&server, 0)
            .search("A", "T")
            .await
            .expect("search should succeed");

        mock.assert_async().await;
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].id, 99);
        assert_eq!(candidates[0].artist, "A");
        assert_eq!(
            candidates[0].preview_url.as_deref(),
            Some("https://cdn.test/99.mp3")
        );
        assert_eq!(candidates[1].preview_url, None);
    }

    #[tokio::test]
    async fn empty_result_is_not_an_error() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/search")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data": [], "total": 0}"#)
            .create_async()
            .await;

        let candidates = search_for_test(&server, 0)
            .search("Nobody", "Nothing")
            .await
            .expect("search should succeed");

        mock.assert_async().await;
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn in_band_provider_error_is_reported() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/search")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"error": {"type": "Exception", "message": "Quota limit exceeded", "code": 4}}"#)
            .create_async()
            .await;

        let error = search_for_test(&server, 0)
            .search("A", "T")
            .await
            .expect_err("provider error should fail");

        mock.assert_async().await;
        assert_eq!(
            error,
            SearchError::Provider("Quota limit exceeded".to_string())
        );
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_reported_as_network() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/search")
            .match_query(Matcher::Any)
            .expect(2)
            .with_status(502)
            .create_async()
            .await;

        let error = search_for_test(&server, 1)
            .search("A", "T")
            .await
            .expect_err("search should fail");

        mock.assert_async().await;
        assert!(matches!(error, SearchError::Network(_)));
    }
}

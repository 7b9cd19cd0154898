pub mod deezer;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub type TrackId = u64;

const PLAYER_BASE_URL: &str = "https://www.deezer.com/plugins/player?format=classic&autoplay=false&playlist=true&width=350&height=140&color=ff0000&layout=dark&size=medium&type=tracks&id=";
const PLAYER_APP_ID: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackCandidate {
    pub id: TrackId,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SearchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("track search provider error: {0}")]
    Provider(String),
    #[error("invalid track search response: {0}")]
    InvalidResponse(String),
}

/// Ranked lookup of playable tracks for an artist/title guess.
#[async_trait]
pub trait TrackSearch: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(&self, artist: &str, title: &str) -> Result<Vec<TrackCandidate>, SearchError>;
}

/// Best match plus the ranked list it came from. `best` is `None` when nothing matched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTrack {
    pub best: Option<TrackId>,
    pub candidates: Vec<TrackCandidate>,
}

impl ResolvedTrack {
    pub fn from_candidates(candidates: Vec<TrackCandidate>) -> Self {
        Self {
            best: candidates.first().map(|candidate| candidate.id),
            candidates,
        }
    }

    pub fn player_url(&self) -> Option<String> {
        self.best.map(player_url)
    }
}

pub fn player_url(track_id: TrackId) -> String {
    format!("{PLAYER_BASE_URL}{track_id}&app_id={PLAYER_APP_ID}")
}

#[derive(Clone)]
pub struct TrackResolver {
    search: Arc<dyn TrackSearch>,
}

impl fmt::Debug for TrackResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackResolver")
            .field("search", &self.search.name())
            .finish()
    }
}

impl TrackResolver {
    pub fn new(search: Arc<dyn TrackSearch>) -> Self {
        Self { search }
    }

    pub async fn resolve(&self, artist: &str, title: &str) -> Result<ResolvedTrack, SearchError> {
        let artist = artist.trim();
        let title = title.trim();
        if artist.is_empty() && title.is_empty() {
            debug!("attempt carries no artist or title; nothing to resolve");
            return Ok(ResolvedTrack::default());
        }

        let candidates = self.search.search(artist, title).await?;
        let resolved = ResolvedTrack::from_candidates(candidates);
        debug!(
            provider = self.search.name(),
            artist,
            title,
            candidates = resolved.candidates.len(),
            best = ?resolved.best,
            "resolved track candidates"
        );
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct StubSearch {
        calls: Mutex<Vec<(String, String)>>,
        result: Result<Vec<TrackCandidate>, SearchError>,
    }

    #[async_trait]
    impl TrackSearch for StubSearch {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn search(
            &self,
            artist: &str,
            title: &str,
        ) -> Result<Vec<TrackCandidate>, SearchError> {
            self.calls
                .lock()
                .expect("call lock should not be poisoned")
                .push((artist.to_string(), title.to_string()));
            self.result.clone()
        }
    }

    fn candidate(id: TrackId) -> TrackCandidate {
        TrackCandidate {
            id,
            title: "T".to_string(),
            artist: "A".to_string(),
            preview_url: None,
            link: None,
        }
    }

    #[tokio::test]
    async fn first_candidate_is_the_best_match() {
        let search = Arc::new(StubSearch {
            calls: Mutex::new(Vec::new()),
            result: Ok(vec![candidate(99), candidate(100)]),
        });
        let resolver = TrackResolver::new(search.clone());

        let resolved = resolver
            .resolve("  A ", "T")
            .await
            .expect("resolution should succeed");

        assert_eq!(resolved.best, Some(99));
        assert_eq!(resolved.candidates.len(), 2);
        assert_eq!(
            *search.calls.lock().expect("call lock should not be poisoned"),
            vec![("A".to_string(), "T".to_string())]
        );
    }

    #[tokio::test]
    async fn no_candidates_is_a_valid_empty_resolution() {
        let resolver = TrackResolver::new(Arc::new(StubSearch {
            calls: Mutex::new(Vec::new()),
            result: Ok(Vec::new()),
        }));

        let resolved = resolver
            .resolve("A", "T")
            .await
            .expect("empty result should not be an error");

        assert_eq!(resolved, ResolvedTrack::default());
        assert_eq!(resolved.player_url(), None);
    }

    #[tokio::test]
    async fn blank_guess_skips_the_search() {
        let search = Arc::new(StubSearch {
            calls: Mutex::new(Vec::new()),
            result: Ok(vec![candidate(1)]),
        });
        let resolver = TrackResolver::new(search.clone());

        let resolved = resolver
            .resolve(" ", "")
            .await
            .expect("blank guess should resolve");

        assert_eq!(resolved.best, None);
        assert!(search
            .calls
            .lock()
            .expect("call lock should not be poisoned")
            .is_empty());
    }

    #[tokio::test]
    async fn search_failures_are_reported() {
        let resolver = TrackResolver::new(Arc::new(StubSearch {
            calls: Mutex::new(Vec::new()),
            result: Err(SearchError::Network("timed out".to_string())),
        }));

        let error = resolver
            .resolve("A", "T")
            .await
            .expect_err("failure should propagate");

        assert_eq!(error, SearchError::Network("timed out".to_string()));
    }

    #[test]
    fn player_url_embeds_track_id() {
        let url = player_url(99);

        assert!(url.starts_with("https://www.deezer.com/plugins/player?"));
        assert!(url.ends_with("&type=tracks&id=99&app_id=1"));
    }
}

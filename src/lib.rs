pub mod config;
pub mod game_service;
mod http_client;
pub mod logging;
pub mod microphone;
pub mod models;
pub mod session;
pub mod submission;
pub mod track_search;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub use config::{ClientConfig, ConfigError};
pub use game_service::{http::HttpGameService, GameService, ServiceError};
pub use logging::{LoggingError, LoggingState};
pub use http_client::RetryPolicy;
pub use microphone::{cpal_device::CpalMicrophone, CaptureError, CaptureFormat, Microphone};
pub use session::{
    GameSession, Route, SessionClosed, SessionDependencies, SessionErrorStage, SessionEvent,
    SessionHandle, SessionPhase, SessionState,
};
pub use submission::{AudioUpload, SubmissionResult, UnsupportedFormat, UploadProgress};
pub use track_search::{deezer::DeezerTrackSearch, player_url, SearchError, TrackSearch};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("unable to build game service client: {0}")]
    GameService(#[from] ServiceError),
    #[error("unable to build track search client: {0}")]
    TrackSearch(#[from] SearchError),
    #[error("unable to set up diagnostic logging: {0}")]
    Logging(#[from] LoggingError),
}

/// Wires the HTTP clients and the default microphone into a new session.
///
/// When `config.log_file` is set, the file and stderr subscriber is installed
/// on first use and reused by later sessions. Without it nothing is installed
/// and the caller owns the `tracing` subscriber. A subscriber installed by the
/// caller beforehand is kept; the log file is then not written.
///
/// Must be called from within a Tokio runtime.
pub fn start_session(
    config: &ClientConfig,
) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>), BootstrapError> {
    if let Some(log_file) = config.log_file.as_deref() {
        match logging::ensure_initialized(log_file) {
            Ok(_) => {}
            Err(LoggingError::Install(reason)) => {
                warn!(%reason, "keeping the existing log subscriber");
            }
            Err(error) => return Err(error.into()),
        }
    }

    let game_service = HttpGameService::new(config.game_api.clone())?;
    let track_search = DeezerTrackSearch::new(config.track_search.clone())?;
    info!(
        game_api_url = %config.game_api.base_url,
        sample_rate_hz = config.capture.sample_rate_hz,
        "bootstrapping game session"
    );

    Ok(GameSession::spawn(SessionDependencies {
        game_service: Arc::new(game_service),
        track_search: Arc::new(track_search),
        microphone: Arc::new(CpalMicrophone::default()),
        capture_format: config.capture,
    }))
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    fn unreachable_config(log_file: std::path::PathBuf) -> ClientConfig {
        let mut config = ClientConfig {
            log_file: Some(log_file),
            ..ClientConfig::default()
        };
        config.game_api.base_url = "http://127.0.0.1:1".to_string();
        config
    }

    #[tokio::test]
    async fn start_session_installs_logging_once_and_keeps_starting_sessions() {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("clock should progress")
            .as_nanos();
        let log_file = std::env::temp_dir().join(format!("lyrics-bootstrap-{nanos}.log"));
        let config = unreachable_config(log_file);

        let (first, _first_events) =
            start_session(&config).expect("first session should start");
        let (second, _second_events) =
            start_session(&config).expect("second session should reuse logging");

        let installed = logging::ensure_initialized(
            config.log_file.as_deref().expect("log file is configured"),
        )
        .expect("logging should already be installed");
        assert!(installed.log_file_path().exists());

        first.teardown().await;
        second.teardown().await;
    }
}

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::{
    game_service::http::GameApiConfig, microphone::CaptureFormat,
    track_search::deezer::TrackSearchConfig,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{}`: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config file `{}`: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub game_api: GameApiConfig,
    pub track_search: TrackSearchConfig,
    pub capture: CaptureFormat,
    /// Diagnostic log file; logging is only installed by `start_session` when set.
    pub log_file: Option<PathBuf>,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Reads the optional JSON file first, then lets the environment override it.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => read_config_file(path)?,
            None => Self::default(),
        };
        config.apply_env();

        debug!(
            game_api_url = %config.game_api.base_url,
            has_game_api_token = config.game_api.access_token.is_some(),
            track_search_url = %config.track_search.endpoint,
            sample_rate_hz = config.capture.sample_rate_hz,
            log_file = ?config.log_file,
            "loaded client config"
        );
        Ok(config)
    }

    fn apply_env(&mut self) {
        self.game_api.apply_env();
        self.track_search.apply_env();
        if let Some(log_file) = read_non_empty_env("LYRICS_LOG_FILE") {
            self.log_file = Some(PathBuf::from(log_file));
        }
    }
}

fn read_config_file(path: &Path) -> Result<ClientConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn read_non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

pub(crate) fn read_u64_env(name: &str) -> Option<u64> {
    read_non_empty_env(name).and_then(|value| value.parse::<u64>().ok())
}

pub(crate) fn read_u32_env(name: &str) -> Option<u32> {
    read_non_empty_env(name).and_then(|value| value.parse::<u32>().ok())
}

#[cfg(test)]
mod tests {
    use std::{fs, time::SystemTime};

    use super::*;

    fn temp_config_path(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("clock should progress")
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}-{nanos}.json"))
    }

    #[test]
    fn config_file_fields_override_defaults() {
        let path = temp_config_path("lyrics-config");
        fs::write(
            &path,
            r#"{"game_api":{"base_url":"http://game.test","request_timeout_secs":9}}"#,
        )
        .expect("should write test config");

        let config = read_config_file(&path).expect("config file should parse");

        assert_eq!(config.game_api.base_url, "http://game.test");
        assert_eq!(config.game_api.request_timeout_secs, 9);
        assert_eq!(config.capture, CaptureFormat::default());

        let _ = fs::remove_file(path);
    }

    #[test]
    fn malformed_config_file_reports_parse_error() {
        let path = temp_config_path("lyrics-config-bad");
        fs::write(&path, "{ not json").expect("should write test config");

        let error = read_config_file(&path).expect_err("malformed file should fail");
        assert!(matches!(error, ConfigError::Parse { .. }));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn missing_config_file_reports_read_error() {
        let path = temp_config_path("lyrics-config-missing");

        let error = ClientConfig::load(Some(&path)).expect_err("missing file should fail");
        assert!(matches!(error, ConfigError::Read { .. }));
    }
}

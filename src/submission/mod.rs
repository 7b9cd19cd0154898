use std::{fmt, sync::Arc};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    game_service::{GameService, ServiceError},
    microphone::{EncodedAudio, WAV_MIME_TYPE},
    models::{Attempt, GameId, NewLyricsAttempt},
};

pub const MP3_MIME_TYPE: &str = "audio/mpeg";
const MP3_MIME_ALIAS: &str = "audio/mp3";
const RECORDING_FILE_NAME: &str = "recording.wav";

pub type ProgressSender = mpsc::UnboundedSender<UploadProgress>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSource {
    Recording,
    File,
}

impl AudioSource {
    pub fn accepted_mime_type(self) -> &'static str {
        match self {
            Self::Recording => WAV_MIME_TYPE,
            Self::File => MP3_MIME_TYPE,
        }
    }

    fn accepts(self, mime_type: &str) -> bool {
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match self {
            Self::Recording => essence == WAV_MIME_TYPE,
            Self::File => essence == MP3_MIME_TYPE || essence == MP3_MIME_ALIAS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub sent_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported audio format `{mime_type}`, expected `{expected}`")]
pub struct UnsupportedFormat {
    pub mime_type: String,
    pub expected: &'static str,
}

#[derive(Clone, PartialEq, Eq)]
pub struct AudioUpload {
    pub bytes: Bytes,
    pub mime_type: String,
    pub file_name: String,
    pub source: AudioSource,
}

impl fmt::Debug for AudioUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioUpload")
            .field("bytes", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .field("file_name", &self.file_name)
            .field("source", &self.source)
            .finish()
    }
}

impl AudioUpload {
    pub fn from_recording(audio: EncodedAudio) -> Self {
        Self {
            bytes: Bytes::from(audio.bytes),
            mime_type: audio.mime_type.to_string(),
            file_name: RECORDING_FILE_NAME.to_string(),
            source: AudioSource::Recording,
        }
    }

    pub fn from_file(
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
            file_name: file_name.into(),
            source: AudioSource::File,
        }
    }

    pub fn validate(&self) -> Result<(), UnsupportedFormat> {
        if self.source.accepts(&self.mime_type) {
            return Ok(());
        }

        Err(UnsupportedFormat {
            mime_type: self.mime_type.clone(),
            expected: self.source.accepted_mime_type(),
        })
    }
}

/// Outcome of one submission. Exactly one handling path applies per variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionResult {
    Attempt(Attempt),
    GameLost,
    TransportError(ServiceError),
}

impl From<Result<Option<Attempt>, ServiceError>> for SubmissionResult {
    fn from(result: Result<Option<Attempt>, ServiceError>) -> Self {
        match result {
            Ok(Some(attempt)) => Self::Attempt(attempt),
            Ok(None) => Self::GameLost,
            Err(error) => Self::TransportError(error),
        }
    }
}

#[derive(Clone)]
pub struct SubmissionGateway {
    service: Arc<dyn GameService>,
}

impl fmt::Debug for SubmissionGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionGateway").finish_non_exhaustive()
    }
}

impl SubmissionGateway {
    pub fn new(service: Arc<dyn GameService>) -> Self {
        Self { service }
    }

    pub async fn submit_text(&self, game_id: GameId, lyrics: String) -> SubmissionResult {
        info!(game_id, lyrics_chars = lyrics.chars().count(), "submitting typed lyrics");
        let result = self
            .service
            .submit_text_attempt(NewLyricsAttempt { game_id, lyrics })
            .await
            .into();
        log_result(game_id, &result);
        result
    }

    /// Rejects uploads in the wrong container before anything is sent.
    pub async fn submit_audio(
        &self,
        game_id: GameId,
        upload: AudioUpload,
        progress: Option<ProgressSender>,
    ) -> Result<SubmissionResult, UnsupportedFormat> {
        if let Err(error) = upload.validate() {
            warn!(game_id, error = %error, "rejecting audio upload");
            return Err(error);
        }

        info!(
            game_id,
            source = ?upload.source,
            audio_bytes = upload.bytes.len(),
            "submitting audio attempt"
        );
        let result = self
            .service
            .submit_audio_attempt(game_id, upload, progress)
            .await
            .into();
        log_result(game_id, &result);
        Ok(result)
    }
}

fn log_result(game_id: GameId, result: &SubmissionResult) {
    match result {
        SubmissionResult::Attempt(attempt) => {
            debug!(game_id, attempt_id = attempt.id, "submission produced an attempt")
        }
        SubmissionResult::GameLost => info!(game_id, "submission reported the game as lost"),
        SubmissionResult::TransportError(error) => {
            warn!(game_id, error = %error, "submission failed")
        }
    }
}

pub mod http;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    models::{Attempt, AttemptId, Game, GameId, NewLyricsAttempt, Statistic, User, WrongAttempt},
    submission::{AudioUpload, ProgressSender},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("not signed in: {0}")]
    Unauthenticated(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("game service returned status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("invalid game service response: {0}")]
    InvalidResponse(String),
    #[error("unable to prepare request: {0}")]
    Request(String),
}

/// Remote game and attempt persistence.
///
/// Calls returning `Option<Attempt>` use `None` for the service's terminal
/// signal: the game is lost (submissions) or no attempts remain (judge wrong).
#[async_trait]
pub trait GameService: Send + Sync {
    async fn current_user(&self) -> Result<User, ServiceError>;

    async fn user_statistics(&self) -> Result<Statistic, ServiceError>;

    async fn create_game(&self) -> Result<Game, ServiceError>;

    async fn end_game(&self, game_id: GameId) -> Result<Game, ServiceError>;

    async fn end_game_as_loss(&self, game_id: GameId) -> Result<Game, ServiceError>;

    async fn submit_text_attempt(
        &self,
        attempt: NewLyricsAttempt,
    ) -> Result<Option<Attempt>, ServiceError>;

    async fn submit_audio_attempt(
        &self,
        game_id: GameId,
        upload: AudioUpload,
        progress: Option<ProgressSender>,
    ) -> Result<Option<Attempt>, ServiceError>;

    async fn judge_right(&self, attempt_id: AttemptId) -> Result<Game, ServiceError>;

    async fn judge_wrong(&self, attempt: WrongAttempt) -> Result<Option<Attempt>, ServiceError>;
}

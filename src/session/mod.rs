pub mod state;

use std::{future::Future, sync::Arc};

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    game_service::{GameService, ServiceError},
    microphone::{CaptureError, CaptureFormat, Microphone, RecordingSession},
    models::{Attempt, AttemptId, Game, GameId, LyricsSound, Statistic, User, WrongAttempt},
    submission::{AudioUpload, SubmissionGateway, SubmissionResult, UnsupportedFormat, UploadProgress},
    track_search::{ResolvedTrack, SearchError, TrackResolver, TrackSearch},
};

pub use state::{AttemptOutcome, AttemptTicket, SessionPhase, SessionState};

/// Collaborators a session is built from.
#[derive(Clone)]
pub struct SessionDependencies {
    pub game_service: Arc<dyn GameService>,
    pub track_search: Arc<dyn TrackSearch>,
    pub microphone: Arc<dyn Microphone>,
    pub capture_format: CaptureFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    About,
    Home,
}

impl Route {
    pub fn as_path(&self) -> &'static str {
        match self {
            Self::About => "/about",
            Self::Home => "/",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorStage {
    Identity,
    Statistics,
    GameCreation,
    RecordingStart,
    RecordingStop,
    Submission,
    GameEnd,
    Judgement,
    TrackResolution,
}

impl SessionErrorStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Statistics => "statistics",
            Self::GameCreation => "game_creation",
            Self::RecordingStart => "recording_start",
            Self::RecordingStop => "recording_stop",
            Self::Submission => "submission",
            Self::GameEnd => "game_end",
            Self::Judgement => "judgement",
            Self::TrackResolution => "track_resolution",
        }
    }
}

/// Notifications for the view, in the order the session applied them.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    UserLoaded(User),
    StatisticsLoaded(Statistic),
    GameStarted(Game),
    LoadingChanged(bool),
    RecordingChanged(bool),
    CannotRecord(String),
    RecordingDiscarded,
    UploadProgress(UploadProgress),
    AttemptReceived(Attempt),
    TrackResolved {
        attempt_id: AttemptId,
        track: ResolvedTrack,
    },
    StaleTrackDiscarded {
        attempt_id: AttemptId,
    },
    OutcomeRecorded {
        wrong: bool,
    },
    GameOver(Game),
    NavigateTo(Route),
    Error {
        stage: SessionErrorStage,
        message: String,
    },
    TornDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("game session is no longer running")]
pub struct SessionClosed;

enum SessionCommand {
    ToggleMicrophone,
    SetLyrics(String),
    SubmitLyrics,
    UploadFile(AudioUpload),
    JudgeRight,
    JudgeWrong,
    EndGame,
    Snapshot(oneshot::Sender<SessionState>),
}

enum Completion {
    Statistics(Result<Statistic, ServiceError>),
    Track {
        ticket: AttemptTicket,
        result: Result<ResolvedTrack, SearchError>,
    },
}

pub struct GameSession;

impl GameSession {
    /// Starts the session task. Must be called from within a Tokio runtime.
    pub fn spawn(
        dependencies: SessionDependencies,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let actor = SessionActor {
            service: dependencies.game_service.clone(),
            gateway: SubmissionGateway::new(dependencies.game_service),
            resolver: TrackResolver::new(dependencies.track_search),
            microphone: dependencies.microphone,
            capture_format: dependencies.capture_format,
            state: SessionState::new(),
            recording: None,
            events: event_tx,
            completion_tx,
            completion_rx,
            cancel: cancel.clone(),
        };
        info!(session_id = %actor.state.session_id(), "starting game session");
        let task = tokio::spawn(actor.run(command_rx));

        (
            SessionHandle {
                commands: command_tx,
                cancel,
                task: Some(task),
            },
            event_rx,
        )
    }
}

/// Sends user actions to a running session. Dropping it tears the session down.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn toggle_microphone(&self) -> Result<(), SessionClosed> {
        self.send(SessionCommand::ToggleMicrophone)
    }

    pub fn set_lyrics(&self, lyrics: impl Into<String>) -> Result<(), SessionClosed> {
        self.send(SessionCommand::SetLyrics(lyrics.into()))
    }

    pub fn submit_lyrics(&self) -> Result<(), SessionClosed> {
        self.send(SessionCommand::SubmitLyrics)
    }

    pub fn upload_file(&self, upload: AudioUpload) -> Result<(), SessionClosed> {
        self.send(SessionCommand::UploadFile(upload))
    }

    pub fn judge_right(&self) -> Result<(), SessionClosed> {
        self.send(SessionCommand::JudgeRight)
    }

    pub fn judge_wrong(&self) -> Result<(), SessionClosed> {
        self.send(SessionCommand::JudgeWrong)
    }

    pub fn end_game(&self) -> Result<(), SessionClosed> {
        self.send(SessionCommand::EndGame)
    }

    /// Current state, after every command sent before this call has been applied.
    pub async fn snapshot(&self) -> Result<SessionState, SessionClosed> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(reply_tx))?;
        reply_rx.await.map_err(|_| SessionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.commands.is_closed()
    }

    /// Cancels everything in flight and waits for the recording device to be released.
    pub async fn teardown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                error!(error = %error, "game session task failed during teardown");
            }
        }
    }

    fn send(&self, command: SessionCommand) -> Result<(), SessionClosed> {
        if self.cancel.is_cancelled() {
            return Err(SessionClosed);
        }

        self.commands.send(command).map_err(|_| SessionClosed)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct SessionActor {
    service: Arc<dyn GameService>,
    gateway: SubmissionGateway,
    resolver: TrackResolver,
    microphone: Arc<dyn Microphone>,
    capture_format: CaptureFormat,
    state: SessionState,
    recording: Option<Box<dyn RecordingSession>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    cancel: CancellationToken,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        let cancel = self.cancel.clone();

        if until_cancelled(&cancel, self.initialize()).await.is_some() {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    Some(completion) = self.completion_rx.recv() => self.apply_completion(completion),
                    command = commands.recv() => {
                        let Some(command) = command else {
                            break;
                        };
                        if until_cancelled(&cancel, self.handle_command(command)).await.is_none() {
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown();
    }

    async fn initialize(&mut self) {
        match self.service.current_user().await {
            Ok(user) => {
                info!(user_id = ?user.id, "current user loaded");
                self.state.user_loaded(user.clone());
                self.emit(SessionEvent::UserLoaded(user));
            }
            Err(error) => {
                error!(error = %error, "unable to identify the current user");
                self.emit_error(SessionErrorStage::Identity, error.to_string());
                self.emit(SessionEvent::NavigateTo(Route::About));
                self.cancel.cancel();
                return;
            }
        }

        self.spawn_statistics();

        match self.service.create_game().await {
            Ok(game) => {
                info!(game_id = game.id, "game started");
                if self.state.game_started(game.clone()) {
                    self.emit(SessionEvent::GameStarted(game));
                }
            }
            Err(error) => {
                error!(error = %error, "unable to start a new game");
                self.emit_error(SessionErrorStage::GameCreation, error.to_string());
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::ToggleMicrophone => self.toggle_microphone().await,
            SessionCommand::SetLyrics(lyrics) => self.state.set_lyrics(lyrics),
            SessionCommand::SubmitLyrics => self.submit_lyrics().await,
            SessionCommand::UploadFile(upload) => self.submit_audio(upload).await,
            SessionCommand::JudgeRight => self.judge_right().await,
            SessionCommand::JudgeWrong => self.judge_wrong().await,
            SessionCommand::EndGame => self.end_game().await,
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.state.clone());
            }
        }
    }

    async fn toggle_microphone(&mut self) {
        if self.recording.is_some() {
            self.stop_recording().await;
        } else {
            self.start_recording().await;
        }
    }

    async fn start_recording(&mut self) {
        if self.state.active_game_id().is_none() {
            debug!("ignoring microphone toggle without an active game");
            self.emit(SessionEvent::CannotRecord("no active game".to_string()));
            return;
        }

        let microphone = self.microphone.clone();
        let format = self.capture_format;
        let opened = tokio::task::spawn_blocking(move || {
            let mut recording = microphone.open(format)?;
            recording.start()?;
            Ok::<_, CaptureError>(recording)
        })
        .await
        .unwrap_or_else(|error| Err(CaptureError::Stream(error.to_string())));

        match opened {
            Ok(recording) => {
                self.recording = Some(recording);
                self.state.recording_started();
                info!(
                    sample_rate_hz = format.sample_rate_hz,
                    bitrate_bps = format.bitrate_bps(),
                    "recording started"
                );
                self.emit(SessionEvent::RecordingChanged(true));
            }
            Err(error) => {
                warn!(error = %error, "unable to start recording");
                self.emit_error(SessionErrorStage::RecordingStart, error.to_string());
                self.emit(SessionEvent::CannotRecord(error.to_string()));
            }
        }
    }

    async fn stop_recording(&mut self) {
        let Some(recording) = self.recording.as_mut() else {
            return;
        };

        // Stays in `self.recording` while stopping so teardown can still abort it.
        let stopped = recording.stop().await;
        self.recording = None;
        self.state.recording_stopped();
        self.emit(SessionEvent::RecordingChanged(false));

        let audio = match stopped {
            Ok(audio) => audio,
            Err(error) => {
                error!(error = %error, "unable to finalize recording");
                self.emit_error(SessionErrorStage::RecordingStop, error.to_string());
                return;
            }
        };

        if audio.is_empty() {
            info!("recording captured no audio; discarding");
            self.emit(SessionEvent::RecordingDiscarded);
            return;
        }

        info!(
            duration_ms = audio.duration_ms,
            sample_count = audio.sample_count,
            "recording stopped"
        );
        self.submit_audio(AudioUpload::from_recording(audio)).await;
    }

    async fn submit_lyrics(&mut self) {
        if self.state.lyrics().trim().is_empty() {
            debug!("ignoring submission of empty lyrics");
            return;
        }
        let Some(game_id) = self.begin_submission() else {
            return;
        };

        let lyrics = self.state.lyrics().to_string();
        let result = self.gateway.submit_text(game_id, lyrics).await;
        self.handle_submission(game_id, result).await;
    }

    async fn submit_audio(&mut self, upload: AudioUpload) {
        if let Err(error) = upload.validate() {
            self.reject_upload(error);
            return;
        }
        let Some(game_id) = self.begin_submission() else {
            return;
        };

        let gateway = self.gateway.clone();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let submission = gateway.submit_audio(game_id, upload, Some(progress_tx));
        tokio::pin!(submission);

        let outcome = loop {
            tokio::select! {
                outcome = &mut submission => break outcome,
                Some(progress) = progress_rx.recv() => self.emit(SessionEvent::UploadProgress(progress)),
            }
        };
        while let Ok(progress) = progress_rx.try_recv() {
            self.emit(SessionEvent::UploadProgress(progress));
        }

        match outcome {
            Ok(result) => self.handle_submission(game_id, result).await,
            Err(error) => {
                self.state.finish_loading();
                self.emit(SessionEvent::LoadingChanged(false));
                self.reject_upload(error);
            }
        }
    }

    fn begin_submission(&mut self) -> Option<GameId> {
        let game_id = self.state.active_game_id()?;
        if !self.state.begin_loading() {
            debug!(game_id, "submission already in flight");
            return None;
        }

        self.emit(SessionEvent::LoadingChanged(true));
        Some(game_id)
    }

    fn reject_upload(&self, error: UnsupportedFormat) {
        warn!(error = %error, "audio upload rejected");
        self.emit_error(SessionErrorStage::Submission, error.to_string());
    }

    async fn handle_submission(&mut self, game_id: GameId, result: SubmissionResult) {
        match result {
            SubmissionResult::Attempt(attempt) => {
                let ticket = self.state.attempt_received(attempt.clone());
                self.emit(SessionEvent::LoadingChanged(false));
                if let Some(ticket) = ticket {
                    self.emit(SessionEvent::AttemptReceived(attempt.clone()));
                    self.spawn_track_resolution(ticket, attempt.lyrics_sound);
                }
            }
            SubmissionResult::GameLost => {
                let game = match self.service.end_game_as_loss(game_id).await {
                    Ok(game) => Some(game),
                    Err(error) => {
                        error!(game_id, error = %error, "unable to record the loss");
                        self.emit_error(SessionErrorStage::GameEnd, error.to_string());
                        None
                    }
                };
                self.state.game_lost(game);
                self.emit(SessionEvent::LoadingChanged(false));
                self.emit(SessionEvent::OutcomeRecorded { wrong: true });
                self.game_over();
            }
            SubmissionResult::TransportError(error) => {
                self.state.finish_loading();
                self.emit(SessionEvent::LoadingChanged(false));
                self.emit_error(SessionErrorStage::Submission, error.to_string());
            }
        }
    }

    async fn judge_right(&mut self) {
        let Some(attempt_id) = self.state.current_attempt().map(|attempt| attempt.id) else {
            debug!("no current attempt to judge");
            return;
        };
        if self.begin_submission().is_none() {
            return;
        }

        match self.service.judge_right(attempt_id).await {
            Ok(game) => {
                info!(attempt_id, game_id = game.id, "attempt judged right");
                let ended = game.ended;
                self.state.judged_right(game);
                self.emit(SessionEvent::LoadingChanged(false));
                self.emit(SessionEvent::OutcomeRecorded { wrong: false });
                if ended {
                    self.game_over();
                }
            }
            Err(error) => self.judgement_failed(error),
        }
    }

    async fn judge_wrong(&mut self) {
        let Some(attempt_id) = self.state.current_attempt().map(|attempt| attempt.id) else {
            debug!("no current attempt to judge");
            return;
        };
        let Some(game_id) = self.begin_submission() else {
            return;
        };

        let wrong = WrongAttempt {
            id: attempt_id,
            game_id,
            lyrics: self.state.lyrics().to_string(),
        };
        match self.service.judge_wrong(wrong).await {
            Ok(Some(attempt)) => {
                info!(attempt_id, next_attempt_id = attempt.id, "attempt judged wrong");
                let ticket = self.state.judged_wrong(attempt.clone());
                self.emit(SessionEvent::LoadingChanged(false));
                self.emit(SessionEvent::OutcomeRecorded { wrong: true });
                if let Some(ticket) = ticket {
                    self.emit(SessionEvent::AttemptReceived(attempt.clone()));
                    self.spawn_track_resolution(ticket, attempt.lyrics_sound);
                }
            }
            Ok(None) => {
                info!(attempt_id, game_id, "no attempts remain");
                self.state.attempts_exhausted();
                self.emit(SessionEvent::LoadingChanged(false));
                self.emit(SessionEvent::OutcomeRecorded { wrong: true });
                self.game_over();
            }
            Err(error) => self.judgement_failed(error),
        }
    }

    fn judgement_failed(&mut self, error: ServiceError) {
        error!(error = %error, "judgement failed");
        self.state.finish_loading();
        self.emit(SessionEvent::LoadingChanged(false));
        self.emit_error(SessionErrorStage::Judgement, error.to_string());
    }

    async fn end_game(&mut self) {
        let Some(game_id) = self.state.game().map(|game| game.id) else {
            debug!("no game to end");
            return;
        };

        match self.service.end_game(game_id).await {
            Ok(game) => {
                info!(game_id, "game ended by player");
                self.state.quit(game);
                self.game_over();
                self.emit(SessionEvent::NavigateTo(Route::Home));
                self.cancel.cancel();
            }
            Err(error) => {
                error!(game_id, error = %error, "unable to end game");
                self.emit_error(SessionErrorStage::GameEnd, error.to_string());
            }
        }
    }

    fn apply_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Statistics(Ok(statistic)) => {
                debug!(games_played = statistic.games_played, "statistics loaded");
                self.state.statistics_loaded(statistic.clone());
                self.emit(SessionEvent::StatisticsLoaded(statistic));
            }
            Completion::Statistics(Err(error)) => {
                warn!(error = %error, "unable to load statistics");
                self.emit_error(SessionErrorStage::Statistics, error.to_string());
            }
            Completion::Track { ticket, result } => self.apply_track(ticket, result),
        }
    }

    fn apply_track(&mut self, ticket: AttemptTicket, result: Result<ResolvedTrack, SearchError>) {
        let attempt_id = ticket.attempt_id;
        let applied = match result {
            Ok(track) => {
                let applied = self.state.track_resolved(ticket, track.clone());
                if applied {
                    self.emit(SessionEvent::TrackResolved { attempt_id, track });
                }
                applied
            }
            Err(error) => {
                let applied = self.state.track_resolution_failed(ticket);
                if applied {
                    warn!(attempt_id, error = %error, "unable to resolve track");
                    self.emit_error(SessionErrorStage::TrackResolution, error.to_string());
                }
                applied
            }
        };

        if !applied {
            debug!(
                attempt_id,
                generation = ticket.generation,
                "discarding track result for a stale attempt"
            );
            self.emit(SessionEvent::StaleTrackDiscarded { attempt_id });
        }
    }

    fn spawn_statistics(&self) {
        let service = self.service.clone();
        let completion_tx = self.completion_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Some(result) = until_cancelled(&cancel, service.user_statistics()).await {
                let _ = completion_tx.send(Completion::Statistics(result));
            }
        });
    }

    fn spawn_track_resolution(&self, ticket: AttemptTicket, sound: LyricsSound) {
        let resolver = self.resolver.clone();
        let completion_tx = self.completion_tx.clone();
        let cancel = self.cancel.clone();
        debug!(attempt_id = ticket.attempt_id, generation = ticket.generation, "resolving track");
        tokio::spawn(async move {
            let lookup = resolver.resolve(&sound.artist, &sound.title);
            if let Some(result) = until_cancelled(&cancel, lookup).await {
                let _ = completion_tx.send(Completion::Track { ticket, result });
            }
        });
    }

    /// Called on every transition that ends the game.
    fn game_over(&mut self) {
        self.release_recording("game over");
        if let Some(game) = self.state.game() {
            self.emit(SessionEvent::GameOver(game.clone()));
        }
    }

    /// Aborts an open recording without submitting it.
    fn release_recording(&mut self, reason: &'static str) {
        let Some(mut recording) = self.recording.take() else {
            return;
        };

        info!(reason, "discarding in-progress recording");
        recording.abort();
        self.state.recording_stopped();
        self.emit(SessionEvent::RecordingChanged(false));
        self.emit(SessionEvent::RecordingDiscarded);
    }

    fn emit_error(&self, stage: SessionErrorStage, message: String) {
        self.emit(SessionEvent::Error { stage, message });
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("session event receiver dropped");
        }
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        self.release_recording("teardown");

        info!(session_id = %self.state.session_id(), "game session torn down");
        self.emit(SessionEvent::TornDown);
    }
}

async fn until_cancelled<F: Future>(cancel: &CancellationToken, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = future => Some(output),
    }
}

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    models::{Attempt, AttemptId, Game, GameId, Statistic, User},
    track_search::{ResolvedTrack, TrackId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    AwaitingUser,
    Recording,
    Submitting,
    Resolving,
    Won,
    Lost,
    Ended,
}

/// Identifies the attempt a track lookup was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptTicket {
    pub attempt_id: AttemptId,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub wrong: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Everything the view may read about one play-through.
///
/// Fields change only through the transition methods below, which the
/// session actor calls on its own task.
#[derive(Debug, Clone)]
pub struct SessionState {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    user: Option<User>,
    statistic: Option<Statistic>,
    game: Option<Game>,
    lyrics: String,
    current_attempt: Option<Attempt>,
    generation: u64,
    outcomes: Vec<AttemptOutcome>,
    recording: bool,
    loading: bool,
    resolving: Option<AttemptTicket>,
    resolved_track: Option<ResolvedTrack>,
    quit: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            user: None,
            statistic: None,
            game: None,
            lyrics: String::new(),
            current_attempt: None,
            generation: 0,
            outcomes: Vec::new(),
            recording: false,
            loading: false,
            resolving: None,
            resolved_track: None,
            quit: false,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn statistic(&self) -> Option<&Statistic> {
        self.statistic.as_ref()
    }

    pub fn game(&self) -> Option<&Game> {
        self.game.as_ref()
    }

    pub fn lyrics(&self) -> &str {
        &self.lyrics
    }

    pub fn current_attempt(&self) -> Option<&Attempt> {
        self.current_attempt.as_ref()
    }

    pub fn outcomes(&self) -> &[AttemptOutcome] {
        &self.outcomes
    }

    /// `true` for each attempt judged wrong, `false` for each judged right.
    pub fn outcome_log(&self) -> Vec<bool> {
        self.outcomes.iter().map(|outcome| outcome.wrong).collect()
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn resolved_track(&self) -> Option<&ResolvedTrack> {
        self.resolved_track.as_ref()
    }

    pub fn resolved_track_id(&self) -> Option<TrackId> {
        self.resolved_track.as_ref().and_then(|track| track.best)
    }

    pub fn is_terminated(&self) -> bool {
        self.game.as_ref().is_some_and(|game| game.ended)
    }

    pub fn active_game_id(&self) -> Option<GameId> {
        self.game
            .as_ref()
            .filter(|game| !game.ended)
            .map(|game| game.id)
    }

    pub fn can_submit(&self) -> bool {
        self.active_game_id().is_some() && !self.loading
    }

    pub fn phase(&self) -> SessionPhase {
        let Some(game) = self.game.as_ref() else {
            return SessionPhase::Idle;
        };

        if game.ended {
            return if self.quit {
                SessionPhase::Ended
            } else if game.won {
                SessionPhase::Won
            } else {
                SessionPhase::Lost
            };
        }

        if self.recording {
            SessionPhase::Recording
        } else if self.loading {
            SessionPhase::Submitting
        } else if self.resolving.is_some() {
            SessionPhase::Resolving
        } else {
            SessionPhase::AwaitingUser
        }
    }

    pub(crate) fn user_loaded(&mut self, user: User) {
        self.user = Some(user);
    }

    pub(crate) fn statistics_loaded(&mut self, statistic: Statistic) {
        self.statistic = Some(statistic);
    }

    pub(crate) fn game_started(&mut self, game: Game) -> bool {
        if self.game.is_some() {
            return false;
        }

        self.game = Some(game);
        true
    }

    pub(crate) fn set_lyrics(&mut self, lyrics: String) {
        self.lyrics = lyrics;
    }

    pub(crate) fn recording_started(&mut self) -> bool {
        if self.active_game_id().is_none() || self.recording {
            return false;
        }

        self.recording = true;
        true
    }

    pub(crate) fn recording_stopped(&mut self) {
        self.recording = false;
    }

    pub(crate) fn begin_loading(&mut self) -> bool {
        if !self.can_submit() {
            return false;
        }

        self.loading = true;
        true
    }

    pub(crate) fn finish_loading(&mut self) {
        self.loading = false;
    }

    /// Replaces the current attempt. Any lookup still running for the
    /// previous one is invalidated by the generation bump.
    pub(crate) fn attempt_received(&mut self, attempt: Attempt) -> Option<AttemptTicket> {
        self.loading = false;
        if self.is_terminated() {
            return None;
        }

        self.generation += 1;
        let ticket = AttemptTicket {
            attempt_id: attempt.id,
            generation: self.generation,
        };
        self.current_attempt = Some(attempt);
        self.resolving = Some(ticket);
        Some(ticket)
    }

    /// `game` is what the service returned for the loss, or `None` when that
    /// call failed and the loss is recorded locally only.
    pub(crate) fn game_lost(&mut self, game: Option<Game>) {
        if self.is_terminated() {
            self.loading = false;
            return;
        }

        let mut game = game
            .or_else(|| self.game.clone())
            .unwrap_or_else(|| Game::new(0));
        game.won = false;
        game.ended = true;
        self.record_outcome(true);
        self.finish(game);
    }

    pub(crate) fn judged_right(&mut self, game: Game) {
        self.loading = false;
        if self.is_terminated() {
            return;
        }

        self.record_outcome(false);
        if game.ended {
            self.finish(game);
        } else {
            self.game = Some(game);
        }
    }

    pub(crate) fn judged_wrong(&mut self, attempt: Attempt) -> Option<AttemptTicket> {
        if self.is_terminated() {
            self.loading = false;
            return None;
        }

        self.record_outcome(true);
        self.attempt_received(attempt)
    }

    /// No attempts remain after a wrong judgement; closed locally without a round trip.
    pub(crate) fn attempts_exhausted(&mut self) {
        self.loading = false;
        let Some(mut game) = self.game.clone().filter(|game| !game.ended) else {
            return;
        };

        game.won = true;
        game.ended = true;
        self.record_outcome(true);
        self.finish(game);
    }

    pub(crate) fn quit(&mut self, mut game: Game) {
        game.ended = true;
        self.quit = true;
        self.finish(game);
    }

    pub(crate) fn track_resolved(&mut self, ticket: AttemptTicket, track: ResolvedTrack) -> bool {
        if !self.is_current(ticket) {
            return false;
        }

        self.resolving = None;
        self.resolved_track = Some(track);
        true
    }

    /// Keeps whatever track was displayed before.
    pub(crate) fn track_resolution_failed(&mut self, ticket: AttemptTicket) -> bool {
        if !self.is_current(ticket) {
            return false;
        }

        self.resolving = None;
        true
    }

    fn is_current(&self, ticket: AttemptTicket) -> bool {
        !self.is_terminated()
            && self.resolving == Some(ticket)
            && self
                .current_attempt
                .as_ref()
                .is_some_and(|attempt| attempt.id == ticket.attempt_id)
    }

    fn record_outcome(&mut self, wrong: bool) {
        self.outcomes.push(AttemptOutcome {
            wrong,
            recorded_at: Utc::now(),
        });
    }

    fn finish(&mut self, game: Game) {
        self.game = Some(game);
        self.current_attempt = None;
        self.generation += 1;
        self.resolving = None;
        self.loading = false;
        self.recording = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LyricsSound;

    fn attempt(id: AttemptId) -> Attempt {
        Attempt {
            id,
            lyrics: "hello".to_string(),
            lyrics_sound: LyricsSound {
                artist: "A".to_string(),
                title: "T".to_string(),
            },
        }
    }

    fn started() -> SessionState {
        let mut state = SessionState::new();
        assert!(state.game_started(Game::new(42)));
        state
    }

    fn track(id: TrackId) -> ResolvedTrack {
        ResolvedTrack {
            best: Some(id),
            candidates: Vec::new(),
        }
    }

    #[test]
    fn phase_follows_the_attempt_loop() {
        let mut state = SessionState::new();
        assert_eq!(state.phase(), SessionPhase::Idle);

        state.game_started(Game::new(42));
        assert_eq!(state.phase(), SessionPhase::AwaitingUser);

        assert!(state.begin_loading());
        assert_eq!(state.phase(), SessionPhase::Submitting);

        let ticket = state
            .attempt_received(attempt(7))
            .expect("active game should accept an attempt");
        assert_eq!(state.phase(), SessionPhase::Resolving);

        assert!(state.track_resolved(ticket, track(99)));
        assert_eq!(state.phase(), SessionPhase::AwaitingUser);
        assert_eq!(state.resolved_track_id(), Some(99));
    }

    #[test]
    fn loading_blocks_a_second_submission() {
        let mut state = started();

        assert!(state.begin_loading());
        assert!(!state.begin_loading());

        state.finish_loading();
        assert!(state.can_submit());
    }

    #[test]
    fn stale_ticket_cannot_overwrite_newer_attempt() {
        let mut state = started();
        let first = state
            .attempt_received(attempt(1))
            .expect("first attempt should be accepted");
        let second = state
            .attempt_received(attempt(2))
            .expect("second attempt should be accepted");

        assert!(!state.track_resolved(first, track(10)));
        assert!(state.track_resolved(second, track(20)));
        assert!(!state.track_resolved(first, track(10)));
        assert_eq!(state.resolved_track_id(), Some(20));
    }

    #[test]
    fn failed_lookup_keeps_previous_track() {
        let mut state = started();
        let first = state
            .attempt_received(attempt(1))
            .expect("first attempt should be accepted");
        state.track_resolved(first, track(10));
        let second = state
            .attempt_received(attempt(2))
            .expect("second attempt should be accepted");

        assert!(state.track_resolution_failed(second));
        assert_eq!(state.resolved_track_id(), Some(10));
        assert_eq!(state.phase(), SessionPhase::AwaitingUser);
    }

    #[test]
    fn game_lost_appends_wrong_and_terminates() {
        let mut state = started();
        state.begin_loading();

        state.game_lost(Some(Game {
            id: 42,
            won: false,
            ended: true,
        }));

        assert_eq!(state.outcome_log(), vec![true]);
        assert_eq!(state.phase(), SessionPhase::Lost);
        assert!(!state.is_loading());
        assert!(!state.can_submit());
    }

    #[test]
    fn game_lost_without_server_game_still_terminates_locally() {
        let mut state = started();

        state.game_lost(None);

        assert!(state.is_terminated());
        assert_eq!(state.game().map(|game| game.id), Some(42));
    }

    #[test]
    fn termination_is_monotonic() {
        let mut state = started();
        let ticket = state
            .attempt_received(attempt(7))
            .expect("attempt should be accepted");
        state.game_lost(None);

        assert!(!state.track_resolved(ticket, track(99)));
        assert!(state.attempt_received(attempt(8)).is_none());
        assert!(state.judged_wrong(attempt(9)).is_none());
        state.judged_right(Game {
            id: 42,
            won: true,
            ended: true,
        });
        state.attempts_exhausted();
        state.game_lost(None);

        assert_eq!(state.outcome_log(), vec![true]);
        assert_eq!(state.phase(), SessionPhase::Lost);
        assert!(state.current_attempt().is_none());
        assert!(!state.begin_loading());
        assert!(!state.recording_started());
    }

    #[test]
    fn wrong_judgement_with_replacement_keeps_looping() {
        let mut state = started();
        state.attempt_received(attempt(7));

        let ticket = state
            .judged_wrong(attempt(8))
            .expect("replacement attempt should be accepted");

        assert_eq!(ticket.attempt_id, 8);
        assert_eq!(state.outcome_log(), vec![true]);
        assert_eq!(state.current_attempt().map(|attempt| attempt.id), Some(8));
        assert!(!state.is_terminated());
    }

    #[test]
    fn exhausted_attempts_mark_game_won_and_ended() {
        let mut state = started();
        state.attempt_received(attempt(7));

        state.attempts_exhausted();

        let game = state.game().expect("game should remain visible");
        assert!(game.won);
        assert!(game.ended);
        assert_eq!(state.outcome_log(), vec![true]);
        assert_eq!(state.phase(), SessionPhase::Won);
    }

    #[test]
    fn right_judgement_appends_false() {
        let mut state = started();
        state.attempt_received(attempt(7));

        state.judged_right(Game {
            id: 42,
            won: true,
            ended: true,
        });

        assert_eq!(state.outcome_log(), vec![false]);
        assert_eq!(state.phase(), SessionPhase::Won);
    }

    #[test]
    fn quit_does_not_append_an_outcome() {
        let mut state = started();

        state.quit(Game::new(42));

        assert!(state.outcome_log().is_empty());
        assert_eq!(state.phase(), SessionPhase::Ended);
    }

    #[test]
    fn recording_requires_an_active_game() {
        let mut state = SessionState::new();
        assert!(!state.recording_started());

        state.game_started(Game::new(42));
        assert!(state.recording_started());
        assert_eq!(state.phase(), SessionPhase::Recording);

        state.recording_stopped();
        assert!(!state.is_recording());
    }
}

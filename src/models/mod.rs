use serde::{Deserialize, Serialize};

pub type GameId = i64;
pub type AttemptId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Lifetime totals for the signed-in player.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Statistic {
    pub games_played: u32,
    pub games_won: u32,
    pub games_lost: u32,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub id: GameId,
    #[serde(default)]
    pub won: bool,
    #[serde(default)]
    pub ended: bool,
}

impl Game {
    pub fn new(id: GameId) -> Self {
        Self {
            id,
            won: false,
            ended: false,
        }
    }
}

/// The song the service associated with a guess.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LyricsSound {
    pub artist: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub id: AttemptId,
    #[serde(default)]
    pub lyrics: String,
    #[serde(default)]
    pub lyrics_sound: LyricsSound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLyricsAttempt {
    pub game_id: GameId,
    pub lyrics: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WrongAttempt {
    pub id: AttemptId,
    pub game_id: GameId,
    pub lyrics: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_decodes_nested_lyrics_sound() {
        let attempt: Attempt = serde_json::from_str(
            r#"{"id":7,"lyrics":"hello","lyricsSound":{"artist":"A","title":"T"}}"#,
        )
        .expect("attempt payload should decode");

        assert_eq!(attempt.id, 7);
        assert_eq!(attempt.lyrics_sound.artist, "A");
        assert_eq!(attempt.lyrics_sound.title, "T");
    }

    #[test]
    fn wrong_attempt_serializes_in_camel_case() {
        let payload = serde_json::to_value(WrongAttempt {
            id: 7,
            game_id: 42,
            lyrics: "xyz".to_string(),
        })
        .expect("wrong attempt should serialize");

        assert_eq!(
            payload,
            serde_json::json!({"id": 7, "gameId": 42, "lyrics": "xyz"})
        );
    }

    #[test]
    fn statistic_tolerates_missing_fields() {
        let statistic: Statistic =
            serde_json::from_str(r#"{"gamesPlayed":3}"#).expect("statistic should decode");

        assert_eq!(statistic.games_played, 3);
        assert_eq!(statistic.games_won, 0);
    }
}

//! # Betting Stats
//!
//! Per-game aggregate of fan bets. Unlike message counters these are never
//! merged: every push carries the whole object and replaces what we hold.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::core::{lock, wire};
use crate::error::FetchError;
use crate::model::GameId;

/// Odds reported before anybody has bet.
pub const NO_ACTIVITY_ODDS: f64 = 999.0;

/// Points a user can still spend on a game they have not bet on.
pub const STARTING_POINTS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BettingStats {
    #[serde(deserialize_with = "lenient_id")]
    pub game_id: GameId,
    #[serde(default)]
    pub home_team_name: String,
    #[serde(default)]
    pub away_team_name: String,
    #[serde(default)]
    pub home_team_bet_points: u64,
    #[serde(default)]
    pub away_team_bet_points: u64,
    #[serde(default)]
    pub home_team_bet_count: u64,
    #[serde(default)]
    pub away_team_bet_count: u64,
    #[serde(default = "no_activity_odds")]
    pub home_team_odds: f64,
    #[serde(default = "no_activity_odds")]
    pub away_team_odds: f64,
    #[serde(default)]
    pub total_bet_points: u64,
    #[serde(default)]
    pub total_bet_count: u64,
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub last_updated: DateTime<Utc>,
}

fn no_activity_odds() -> f64 {
    NO_ACTIVITY_ODDS
}

fn lenient_id<'de, D: Deserializer<'de>>(de: D) -> Result<GameId, D::Error> {
    match Value::deserialize(de)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("gameId must be a string or number, got {}", other))),
    }
}

fn lenient_timestamp<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
    match Value::deserialize(de)? {
        Value::Null => Ok(Utc::now()),
        raw => wire::parse_timestamp(&raw).map_err(serde::de::Error::custom),
    }
}

impl BettingStats {
    /// What a game with no bets yet looks like.
    pub fn no_activity(game_id: impl Into<GameId>, now: DateTime<Utc>) -> Self {
        Self {
            game_id: game_id.into(),
            home_team_name: String::new(),
            away_team_name: String::new(),
            home_team_bet_points: 0,
            away_team_bet_points: 0,
            home_team_bet_count: 0,
            away_team_bet_count: 0,
            home_team_odds: NO_ACTIVITY_ODDS,
            away_team_odds: NO_ACTIVITY_ODDS,
            total_bet_points: 0,
            total_bet_count: 0,
            last_updated: now,
        }
    }
}

/// The caller's own position in one game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBetStatus {
    #[serde(deserialize_with = "lenient_id")]
    pub game_id: GameId,
    #[serde(default)]
    pub total_bet_points: u64,
    #[serde(default = "starting_points")]
    pub remaining_points: u64,
    #[serde(default)]
    pub predicted_winner_team_id: Option<i64>,
    #[serde(default)]
    pub bet_count: u64,
    #[serde(default = "can_bet")]
    pub can_bet: bool,
}

fn starting_points() -> u64 {
    STARTING_POINTS
}

fn can_bet() -> bool {
    true
}

impl UserBetStatus {
    /// Status of a user who has not bet on `game_id`.
    pub fn not_yet_bet(game_id: impl Into<GameId>) -> Self {
        Self {
            game_id: game_id.into(),
            total_bet_points: 0,
            remaining_points: STARTING_POINTS,
            predicted_winner_team_id: None,
            bet_count: 0,
            can_bet: true,
        }
    }
}

/// Latest stats per game, plus the caller's own status where known.
#[derive(Default)]
pub struct StatsBoard {
    games: Mutex<HashMap<GameId, BettingStats>>,
    user_status: Mutex<HashMap<GameId, UserBetStatus>>,
    last_error: Mutex<Option<String>>,
}

impl StatsBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the outcome of a stats pull.
    ///
    /// `NotFound` means the game simply has no bets yet. Any other failure
    /// keeps whatever we already had (defaults if nothing) and is recorded.
    pub fn install_fetched(&self, game_id: &str, fetched: Result<BettingStats, FetchError>) -> BettingStats {
        let stats = match fetched {
            Ok(stats) => stats,
            Err(FetchError::NotFound(_)) => BettingStats::no_activity(game_id, Utc::now()),
            Err(e) => {
                tracing::warn!(game_id, error = %e, "Betting stats pull failed");
                *lock(&self.last_error) = Some(e.to_string());
                let mut games = lock(&self.games);
                return games
                    .entry(game_id.to_string())
                    .or_insert_with(|| BettingStats::no_activity(game_id, Utc::now()))
                    .clone();
            }
        };
        self.replace(stats.clone());
        stats
    }

    /// Wholesale replacement, as done for every push.
    pub fn replace(&self, stats: BettingStats) {
        lock(&self.games).insert(stats.game_id.clone(), stats);
    }

    pub fn get(&self, game_id: &str) -> Option<BettingStats> {
        lock(&self.games).get(game_id).cloned()
    }

    /// Installs the outcome of a status pull, with the same failure policy
    /// as [`StatsBoard::install_fetched`].
    pub fn install_user_status(&self, game_id: &str, fetched: Result<UserBetStatus, FetchError>) -> UserBetStatus {
        let status = match fetched {
            Ok(status) => status,
            Err(FetchError::NotFound(_)) => UserBetStatus::not_yet_bet(game_id),
            Err(e) => {
                tracing::warn!(game_id, error = %e, "User bet status pull failed");
                *lock(&self.last_error) = Some(e.to_string());
                return lock(&self.user_status)
                    .entry(game_id.to_string())
                    .or_insert_with(|| UserBetStatus::not_yet_bet(game_id))
                    .clone();
            }
        };
        lock(&self.user_status).insert(game_id.to_string(), status.clone());
        status
    }

    pub fn user_status(&self, game_id: &str) -> Option<UserBetStatus> {
        lock(&self.user_status).get(game_id).cloned()
    }

    pub fn clear_stats(&self, game_id: &str) {
        lock(&self.games).remove(game_id);
        lock(&self.user_status).remove(game_id);
    }

    pub fn clear_all(&self) {
        lock(&self.games).clear();
        lock(&self.user_status).clear();
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_yields_no_activity_defaults() {
        let board = StatsBoard::new();
        let stats = board.install_fetched("g-1", Err(FetchError::NotFound("/api/betting/games/g-1/stats".into())));
        assert_eq!(stats.game_id, "g-1");
        assert_eq!(stats.total_bet_count, 0);
        assert_eq!(stats.home_team_odds, NO_ACTIVITY_ODDS);
        assert!(stats.home_team_name.is_empty());
        assert!(board.last_error().is_none());
    }

    #[test]
    fn other_failures_keep_prior_state() {
        let board = StatsBoard::new();
        let mut seeded = BettingStats::no_activity("g-1", Utc::now());
        seeded.total_bet_points = 700;
        board.replace(seeded);

        let kept = board.install_fetched("g-1", Err(FetchError::Request("connection refused".into())));
        assert_eq!(kept.total_bet_points, 700);
        assert!(board.last_error().unwrap().contains("connection refused"));
    }

    #[test]
    fn partial_push_fills_defaults() {
        let stats: BettingStats =
            serde_json::from_str(r#"{"gameId":"g-2","homeTeamBetPoints":300,"homeTeamOdds":1.4}"#).unwrap();
        assert_eq!(stats.home_team_bet_points, 300);
        assert_eq!(stats.away_team_odds, NO_ACTIVITY_ODDS);

        let zoneless: BettingStats =
            serde_json::from_str(r#"{"gameId":77,"lastUpdated":"2025-07-20T11:00:00"}"#).unwrap();
        assert_eq!(zoneless.game_id, "77");
        assert_eq!(zoneless.last_updated.timestamp(), 1_753_009_200);

        let board = StatsBoard::new();
        board.replace(stats);
        assert_eq!(board.get("g-2").unwrap().home_team_odds, 1.4);
        board.clear_all();
        assert!(board.get("g-2").is_none());
    }

    #[test]
    fn user_status_not_found_means_not_yet_bet() {
        let board = StatsBoard::new();
        let status = board.install_user_status("g-1", Err(FetchError::NotFound("my-status".into())));
        assert_eq!(status.remaining_points, STARTING_POINTS);
        assert!(status.can_bet);
        assert_eq!(status.predicted_winner_team_id, None);
        assert!(board.last_error().is_none());

        let placed: UserBetStatus = serde_json::from_str(
            r#"{"gameId":7,"totalBetPoints":300,"remainingPoints":9700,"predictedWinnerTeamId":2,"betCount":1,"canBet":false}"#,
        )
        .unwrap();
        board.install_user_status("7", Ok(placed));
        let kept = board.install_user_status("7", Err(FetchError::Status {
            status: 502,
            path: "api/betting/games/7/my-status".into(),
            body: "bad gateway".into(),
        }));
        assert_eq!(kept.remaining_points, 9700);
        assert_eq!(kept.predicted_winner_team_id, Some(2));
        assert!(board.last_error().is_some());

        board.clear_stats("7");
        assert!(board.user_status("7").is_none());
        assert!(board.user_status("g-1").is_some());
    }
}

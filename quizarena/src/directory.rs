//! Player directory.
//!
//! The directory owns account identity and competitive counters. The engine
//! only talks to it through [`PlayerDirectory`]; [`MemoryDirectory`] is the
//! default in-process implementation (a PostgreSQL one lives behind the
//! `postgres` feature).

use std::cmp::Ordering;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rating::MatchResult;

/// Player identifier.
pub type PlayerId = String;

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("player not found: {0}")]
    NotFound(PlayerId),

    #[error("backend error: {0}")]
    Backend(String),
}

/// A registered player's competitive record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub display_name: String,
    /// Public rating (rounded `internal_rating`).
    pub rating: i32,
    /// Unrounded working rating.
    pub internal_rating: f64,
    pub wins: u32,
    pub losses: u32,
    pub current_streak: u32,
    pub best_streak: u32,
    pub banned: bool,
}

impl Player {
    pub fn new(id: impl Into<PlayerId>, display_name: impl Into<String>, rating: f64) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            rating: rating.round() as i32,
            internal_rating: rating,
            wins: 0,
            losses: 0,
            current_streak: 0,
            best_streak: 0,
            banned: false,
        }
    }

    /// Apply one match result in place.
    ///
    /// A draw breaks the win streak without counting as a loss.
    pub fn apply_result(&mut self, delta: f64, result: MatchResult) {
        self.internal_rating += delta;
        self.rating = self.internal_rating.round() as i32;

        match result {
            MatchResult::Won => {
                self.wins += 1;
                self.current_streak += 1;
                self.best_streak = self.best_streak.max(self.current_streak);
            }
            MatchResult::Lost => {
                self.losses += 1;
                self.current_streak = 0;
            }
            MatchResult::Drew => {
                self.current_streak = 0;
            }
        }
    }

    /// Reset to the season baseline.
    pub fn reset(&mut self, baseline: f64) {
        self.internal_rating = baseline;
        self.rating = baseline.round() as i32;
        self.wins = 0;
        self.losses = 0;
        self.current_streak = 0;
        self.best_streak = 0;
    }
}

/// Leaderboard order: rating, then wins, then best streak (all descending),
/// then id ascending.
pub fn ranking_order(a: &Player, b: &Player) -> Ordering {
    b.rating
        .cmp(&a.rating)
        .then_with(|| b.wins.cmp(&a.wins))
        .then_with(|| b.best_streak.cmp(&a.best_streak))
        .then_with(|| a.id.cmp(&b.id))
}

/// Player directory consumed by the match engine.
pub trait PlayerDirectory: Send + Sync {
    /// Look up a player. `Ok(None)` means an unregistered (guest) id.
    fn get_player(&self, id: &str) -> Result<Option<Player>, DirectoryError>;

    /// Atomically apply a rating delta and the matching counter update.
    fn apply_match_result(&self, id: &str, delta: f64, result: MatchResult) -> Result<Player, DirectoryError>;

    /// Top `n` players in [`ranking_order`].
    fn list_top_by_rating(&self, n: usize, exclude_banned: bool) -> Result<Vec<Player>, DirectoryError>;

    /// Reset every player to `baseline` and zero the counters.
    /// Returns the number of players reset.
    fn reset_ratings(&self, baseline: f64) -> Result<usize, DirectoryError>;
}

/// In-memory player directory.
pub struct MemoryDirectory {
    players: DashMap<PlayerId, Player>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self {
            players: DashMap::new(),
        }
    }

    /// Register or replace a player.
    pub fn insert(&self, player: Player) {
        self.players.insert(player.id.clone(), player);
    }

    /// Set the ban flag. Returns false if the player is unknown.
    pub fn set_banned(&self, id: &str, banned: bool) -> bool {
        match self.players.get_mut(id) {
            Some(mut p) => {
                p.banned = banned;
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.players.len()
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayerDirectory for MemoryDirectory {
    fn get_player(&self, id: &str) -> Result<Option<Player>, DirectoryError> {
        Ok(self.players.get(id).map(|p| p.clone()))
    }

    fn apply_match_result(&self, id: &str, delta: f64, result: MatchResult) -> Result<Player, DirectoryError> {
        // get_mut holds the shard write lock for the whole read-modify-write
        let mut player = self
            .players
            .get_mut(id)
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?;
        player.apply_result(delta, result);
        Ok(player.clone())
    }

    fn list_top_by_rating(&self, n: usize, exclude_banned: bool) -> Result<Vec<Player>, DirectoryError> {
        let mut players: Vec<Player> = self
            .players
            .iter()
            .filter(|p| !(exclude_banned && p.banned))
            .map(|p| p.value().clone())
            .collect();
        players.sort_by(ranking_order);
        players.truncate(n);
        Ok(players)
    }

    fn reset_ratings(&self, baseline: f64) -> Result<usize, DirectoryError> {
        let mut count = 0;
        for mut entry in self.players.iter_mut() {
            entry.reset(baseline);
            count += 1;
        }
        Ok(count)
    }
}

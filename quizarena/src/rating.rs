//! Rating engine.
//!
//! ELO-style expected score (base 10, divisor 400) with two bonuses that
//! only the winning side receives:
//!
//! - **Streak**: grows linearly with the winner's consecutive wins, capped.
//! - **Margin**: grows with the normalized score difference of the match.
//!
//! Losing and drawing sides receive the plain ELO delta, floored so a rating
//! never drops below [`RatingConfig::rating_floor`].
//!
//! Everything here is pure: no I/O, no clocks, no shared state.

use serde::{Deserialize, Serialize};

/// Rating engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RatingConfig {
    /// K-factor applied to (actual - expected).
    pub k_factor: f64,
    /// Extra gain per consecutive win, as a fraction of the base delta.
    pub streak_bonus_per_win: f64,
    /// Streak length after which the bonus stops growing.
    pub streak_cap: u32,
    /// Weight of the normalized score margin (0.0 disables the bonus).
    pub margin_weight: f64,
    /// Lowest rating a losing side can be pushed to.
    pub rating_floor: f64,
    /// Rating assumed for unregistered (guest) sides.
    pub unrated_rating: f64,
}

impl Default for RatingConfig {
    fn default() -> Self {
        Self {
            k_factor: 32.0,
            streak_bonus_per_win: 0.05,
            streak_cap: 10,
            margin_weight: 0.5,
            rating_floor: 0.0,
            unrated_rating: 1500.0,
        }
    }
}

/// Match result from one side's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchResult {
    Won,
    Lost,
    Drew,
}

impl MatchResult {
    /// Result implied by two scores, from the first score's side.
    pub fn from_scores(score: i64, opponent_score: i64) -> Self {
        match score.cmp(&opponent_score) {
            std::cmp::Ordering::Greater => Self::Won,
            std::cmp::Ordering::Less => Self::Lost,
            std::cmp::Ordering::Equal => Self::Drew,
        }
    }

    /// Actual score used by the expected-score formula.
    pub fn actual(self) -> f64 {
        match self {
            Self::Won => 1.0,
            Self::Drew => 0.5,
            Self::Lost => 0.0,
        }
    }

    /// The same result seen from the other side.
    pub fn opposite(self) -> Self {
        match self {
            Self::Won => Self::Lost,
            Self::Lost => Self::Won,
            Self::Drew => Self::Drew,
        }
    }
}

/// One side's inputs to a rating computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatingSide {
    /// Unrounded working rating.
    pub rating: f64,
    /// Match score reported for this side.
    pub score: i64,
    /// Consecutive wins before this match.
    pub streak: u32,
}

impl RatingSide {
    pub fn new(rating: f64, score: i64, streak: u32) -> Self {
        Self { rating, score, streak }
    }
}

/// Rating deltas for both sides of a match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingDelta {
    pub a: f64,
    pub b: f64,
}

/// Expected score of `rating` against `opponent`.
pub fn expected_score(rating: f64, opponent: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((opponent - rating) / 400.0))
}

/// Pure rating calculator.
#[derive(Debug, Clone, Default)]
pub struct RatingEngine {
    config: RatingConfig,
}

impl RatingEngine {
    pub fn new(config: RatingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RatingConfig {
        &self.config
    }

    /// Deltas for A and B given their ratings, scores and A's win streak.
    ///
    /// B is assumed to carry no streak; use [`RatingEngine::compute`] when
    /// both streaks are known.
    pub fn compute_delta(
        &self,
        rating_a: f64,
        rating_b: f64,
        score_a: i64,
        score_b: i64,
        streak_a: u32,
    ) -> RatingDelta {
        self.compute(
            RatingSide::new(rating_a, score_a, streak_a),
            RatingSide::new(rating_b, score_b, 0),
        )
    }

    /// Deltas with the result derived from the scores.
    pub fn compute(&self, a: RatingSide, b: RatingSide) -> RatingDelta {
        self.compute_with_result(a, b, MatchResult::from_scores(a.score, b.score))
    }

    /// Deltas with an explicit result for A (forfeits decide the result
    /// independently of the scores).
    pub fn compute_with_result(&self, a: RatingSide, b: RatingSide, result_a: MatchResult) -> RatingDelta {
        let margin = match result_a {
            MatchResult::Won => self.margin_multiplier(a.score, b.score),
            MatchResult::Lost => self.margin_multiplier(b.score, a.score),
            MatchResult::Drew => 1.0,
        };

        RatingDelta {
            a: self.side_delta(&a, b.rating, result_a, margin),
            b: self.side_delta(&b, a.rating, result_a.opposite(), margin),
        }
    }

    /// Plain ELO delta with no bonus and no floor.
    pub fn base_delta(&self, rating: f64, opponent: f64, result: MatchResult) -> f64 {
        self.config.k_factor * (result.actual() - expected_score(rating, opponent))
    }

    fn side_delta(&self, side: &RatingSide, opponent: f64, result: MatchResult, margin: f64) -> f64 {
        let base = self.base_delta(side.rating, opponent, result);
        match result {
            MatchResult::Won => base * self.streak_multiplier(side.streak) * margin,
            MatchResult::Lost | MatchResult::Drew => {
                let floor = (self.config.rating_floor - side.rating).min(0.0);
                base.max(floor)
            }
        }
    }

    fn streak_multiplier(&self, streak: u32) -> f64 {
        1.0 + self.config.streak_bonus_per_win * streak.min(self.config.streak_cap) as f64
    }

    fn margin_multiplier(&self, winner_score: i64, loser_score: i64) -> f64 {
        let total = winner_score.max(0) + loser_score.max(0);
        if total == 0 {
            return 1.0;
        }
        let margin = (winner_score.max(0) - loser_score.max(0)).max(0) as f64 / total as f64;
        1.0 + self.config.margin_weight * margin
    }
}

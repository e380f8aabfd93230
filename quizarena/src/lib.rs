//! # QuizArena
//!
//! Competitive match engine for head-to-head quiz battles.
//!
//! ## Features
//!
//! - **Ratings**: ELO-style deltas with win-streak and score-margin bonuses
//! - **Match Queue**: rating-window pairing that widens with wait time
//! - **Sessions**: per-room lifecycle from pairing to settlement
//! - **Settlement**: two independent reports merged into one outcome,
//!   applied to the player directory exactly once
//! - **Seasons**: monthly leaderboard snapshot, rewards and rating reset
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use quizarena::{Arena, ArenaConfig, MemoryDirectory};
//!
//! let config = ArenaConfig::from_json_file("quizarena.json")?;
//! let arena = Arc::new(
//!     Arena::builder(Arc::new(MemoryDirectory::new()))
//!         .config(config)
//!         .build(),
//! );
//! arena.clone().spawn_sweeper(Duration::from_secs(1));
//! ```

pub mod arena;
pub mod config;
pub mod directory;
pub mod error;
pub mod queue;
pub mod rating;
pub mod season;
pub mod session;
pub mod settlement;

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub mod telemetry;

#[cfg(feature = "postgres")]
pub mod postgres;

// Re-exports
pub use arena::{Arena, ArenaBuilder, SweepReport};
pub use config::ArenaConfig;
pub use directory::{MemoryDirectory, Player, PlayerDirectory, PlayerId};
pub use error::{ArenaError, Result};
pub use queue::{MatchPairing, MatchQueue, QueueConfig, QueueEntry, QueueStats};
pub use rating::{MatchResult, RatingConfig, RatingEngine};
pub use season::{
    previous_season_code, season_code, MemoryRewardSink, MemorySeasonStore, RewardSink, RolloverReport,
    RolloverStatus, SeasonConfig, SeasonManager, SeasonRecord, SeasonStore,
};
pub use session::{CpuOpponent, LobbyJoin, SessionConfig, SessionState, SessionStore};
pub use settlement::{CpuMatchReport, ReportOutcome, SettlementCoordinator, SettlementKind, SettlementOutcome};

#[cfg(feature = "metrics")]
pub use metrics::ArenaMetrics;

#[cfg(feature = "telemetry")]
pub use telemetry::{init_tracing, TracingConfig};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresBackend, PostgresDirectory, PostgresSeasonStore};

//! PostgreSQL player directory and season store.
//!
//! Enable with the `postgres` feature flag:
//! ```toml
//! quizarena = { version = "0.1", features = ["postgres"] }
//! ```
//!
//! [`PostgresBackend`] holds the pool and the async queries. The engine's
//! traits are synchronous, so [`PostgresDirectory`] and
//! [`PostgresSeasonStore`] wrap it with a private tokio runtime. Do not call
//! the sync wrappers from inside an async task; use `spawn_blocking`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::runtime::Runtime;

use crate::directory::{DirectoryError, Player, PlayerDirectory};
use crate::rating::MatchResult;
use crate::season::{RankingEntry, RewardEntry, RewardStatus, SeasonError, SeasonRecord, SeasonStore};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// PostgreSQL backend (async).
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema if missing.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS players (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                rating INTEGER NOT NULL DEFAULT 1500,
                internal_rating DOUBLE PRECISION NOT NULL DEFAULT 1500,
                wins INTEGER NOT NULL DEFAULT 0,
                losses INTEGER NOT NULL DEFAULT 0,
                current_streak INTEGER NOT NULL DEFAULT 0,
                best_streak INTEGER NOT NULL DEFAULT 0,
                banned BOOLEAN NOT NULL DEFAULT FALSE
            );

            CREATE INDEX IF NOT EXISTS idx_players_ranking
                ON players(rating DESC, wins DESC, best_streak DESC, id);

            CREATE TABLE IF NOT EXISTS season_records (
                season INTEGER PRIMARY KEY,
                snapshot JSONB NOT NULL,
                ratings_reset BOOLEAN NOT NULL DEFAULT FALSE,
                closed BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE IF NOT EXISTS season_rewards (
                season INTEGER NOT NULL REFERENCES season_records(season),
                player_id TEXT NOT NULL,
                rank INTEGER NOT NULL,
                amount BIGINT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                claimed_at TIMESTAMPTZ,
                PRIMARY KEY (season, player_id)
            );

            ALTER TABLE season_rewards ADD COLUMN IF NOT EXISTS claimed_at TIMESTAMPTZ;
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_player(r: &PgRow) -> Result<Player, sqlx::Error> {
        Ok(Player {
            id: r.try_get("id")?,
            display_name: r.try_get("display_name")?,
            rating: r.try_get("rating")?,
            internal_rating: r.try_get("internal_rating")?,
            wins: r.try_get::<i32, _>("wins")? as u32,
            losses: r.try_get::<i32, _>("losses")? as u32,
            current_streak: r.try_get::<i32, _>("current_streak")? as u32,
            best_streak: r.try_get::<i32, _>("best_streak")? as u32,
            banned: r.try_get("banned")?,
        })
    }

    /// Register or replace a player.
    pub async fn upsert_player_async(&self, player: &Player) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO players (id, display_name, rating, internal_rating, wins, losses,
                                 current_streak, best_streak, banned)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                rating = EXCLUDED.rating,
                internal_rating = EXCLUDED.internal_rating,
                wins = EXCLUDED.wins,
                losses = EXCLUDED.losses,
                current_streak = EXCLUDED.current_streak,
                best_streak = EXCLUDED.best_streak,
                banned = EXCLUDED.banned
            "#,
        )
        .bind(&player.id)
        .bind(&player.display_name)
        .bind(player.rating)
        .bind(player.internal_rating)
        .bind(player.wins as i32)
        .bind(player.losses as i32)
        .bind(player.current_streak as i32)
        .bind(player.best_streak as i32)
        .bind(player.banned)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_player_async(&self, id: &str) -> Result<Option<Player>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM players WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_player).transpose()
    }

    /// Read-modify-write under a row lock. The new values come from
    /// [`Player::apply_result`], so rounding matches the in-memory directory.
    pub async fn apply_match_result_async(
        &self,
        id: &str,
        delta: f64,
        result: MatchResult,
    ) -> Result<Option<Player>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = sqlx::query("SELECT * FROM players WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };

        let mut player = Self::row_to_player(&row)?;
        player.apply_result(delta, result);

        sqlx::query(
            r#"
            UPDATE players SET
                internal_rating = $2,
                rating = $3,
                wins = $4,
                losses = $5,
                current_streak = $6,
                best_streak = $7
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(player.internal_rating)
        .bind(player.rating)
        .bind(player.wins as i32)
        .bind(player.losses as i32)
        .bind(player.current_streak as i32)
        .bind(player.best_streak as i32)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(player))
    }

    pub async fn list_top_by_rating_async(&self, n: usize, exclude_banned: bool) -> Result<Vec<Player>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM players
            WHERE NOT ($2 AND banned)
            ORDER BY rating DESC, wins DESC, best_streak DESC, id ASC
            LIMIT $1
            "#,
        )
        .bind(n as i64)
        .bind(exclude_banned)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_player).collect()
    }

    pub async fn reset_ratings_async(&self, baseline: f64) -> Result<usize, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE players SET
                internal_rating = $1,
                rating = $2,
                wins = 0,
                losses = 0,
                current_streak = 0,
                best_streak = 0
            "#,
        )
        .bind(baseline)
        .bind(baseline.round() as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    pub async fn get_season_async(&self, season: u32) -> Result<Option<SeasonRecord>, sqlx::Error> {
        let Some(row) = sqlx::query("SELECT * FROM season_records WHERE season = $1")
            .bind(season as i32)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let rewards = sqlx::query(
            "SELECT rank, player_id, amount, status, claimed_at FROM season_rewards WHERE season = $1 ORDER BY rank",
        )
        .bind(season as i32)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| -> Result<RewardEntry, sqlx::Error> {
            Ok(RewardEntry {
                rank: r.try_get::<i32, _>("rank")? as u32,
                player_id: r.try_get("player_id")?,
                amount: r.try_get::<i64, _>("amount")? as u64,
                status: status_from_str(r.try_get("status")?)?,
                claimed_at: r.try_get("claimed_at")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

        let snapshot: Json<Vec<RankingEntry>> = row.try_get("snapshot")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;

        Ok(Some(SeasonRecord {
            season,
            snapshot: snapshot.0,
            rewards,
            ratings_reset: row.try_get("ratings_reset")?,
            closed: row.try_get("closed")?,
            created_at,
        }))
    }

    /// Insert the record and its reward ledger in one transaction.
    pub async fn insert_season_async(&self, record: &SeasonRecord) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO season_records (season, snapshot, ratings_reset, closed, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (season) DO NOTHING
            "#,
        )
        .bind(record.season as i32)
        .bind(Json(&record.snapshot))
        .bind(record.ratings_reset)
        .bind(record.closed)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !inserted {
            tx.rollback().await?;
            return Ok(false);
        }

        for reward in &record.rewards {
            sqlx::query(
                "INSERT INTO season_rewards (season, player_id, rank, amount, status) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(record.season as i32)
            .bind(&reward.player_id)
            .bind(reward.rank as i32)
            .bind(reward.amount as i64)
            .bind(status_str(reward.status))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Claim a pending reward, or one whose claim was taken at or before
    /// `stale_before`. True if this call claimed it.
    pub async fn claim_reward_async(
        &self,
        season: u32,
        player_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE season_rewards SET status = 'claimed', claimed_at = $3
            WHERE season = $1 AND player_id = $2
              AND (status = 'pending'
                   OR (status = 'claimed' AND (claimed_at IS NULL OR claimed_at <= $4)))
            "#,
        )
        .bind(season as i32)
        .bind(player_id)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Move a claimed reward to `to` and clear its claim. True if it moved.
    pub async fn finish_reward_async(&self, season: u32, player_id: &str, to: RewardStatus) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE season_rewards SET status = $3, claimed_at = NULL
            WHERE season = $1 AND player_id = $2 AND status = 'claimed'
            "#,
        )
        .bind(season as i32)
        .bind(player_id)
        .bind(status_str(to))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Set a season flag column. True if this call changed it.
    async fn set_season_flag_async(&self, season: u32, column: SeasonFlag, value: bool) -> Result<bool, sqlx::Error> {
        let sql = match column {
            SeasonFlag::RatingsReset => {
                "UPDATE season_records SET ratings_reset = $2 WHERE season = $1 AND ratings_reset <> $2"
            }
            SeasonFlag::Closed => "UPDATE season_records SET closed = $2 WHERE season = $1 AND closed <> $2",
        };
        let result = sqlx::query(sql)
            .bind(season as i32)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_seasons_async(&self, limit: usize) -> Result<Vec<u32>, sqlx::Error> {
        let rows = sqlx::query("SELECT season FROM season_records ORDER BY season DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<i32, _>("season").map(|s| s as u32))
            .collect()
    }
}

#[derive(Clone, Copy)]
enum SeasonFlag {
    RatingsReset,
    Closed,
}

fn status_str(status: RewardStatus) -> &'static str {
    match status {
        RewardStatus::Pending => "pending",
        RewardStatus::Claimed => "claimed",
        RewardStatus::Delivered => "delivered",
    }
}

fn status_from_str(s: &str) -> Result<RewardStatus, sqlx::Error> {
    match s {
        "pending" => Ok(RewardStatus::Pending),
        "claimed" => Ok(RewardStatus::Claimed),
        "delivered" => Ok(RewardStatus::Delivered),
        other => Err(sqlx::Error::Decode(format!("unknown reward status: {other:?}").into())),
    }
}

fn connect(database_url: &str) -> Result<(Arc<PostgresBackend>, Arc<Runtime>), BoxError> {
    let runtime = Runtime::new()?;
    let backend = runtime.block_on(PostgresBackend::new(database_url))?;
    Ok((Arc::new(backend), Arc::new(runtime)))
}

/// Synchronous player directory over [`PostgresBackend`].
pub struct PostgresDirectory {
    inner: Arc<PostgresBackend>,
    runtime: Arc<Runtime>,
}

impl PostgresDirectory {
    pub fn new(backend: PostgresBackend, runtime: Runtime) -> Self {
        Self {
            inner: Arc::new(backend),
            runtime: Arc::new(runtime),
        }
    }

    /// Connect with a private runtime.
    pub fn connect(database_url: &str) -> Result<Self, BoxError> {
        let (inner, runtime) = connect(database_url)?;
        Ok(Self { inner, runtime })
    }

    pub fn migrate(&self) -> Result<(), BoxError> {
        self.runtime.block_on(self.inner.migrate())?;
        Ok(())
    }

    pub fn upsert_player(&self, player: &Player) -> Result<(), DirectoryError> {
        self.runtime
            .block_on(self.inner.upsert_player_async(player))
            .map_err(backend_err)
    }

    /// A season store sharing this directory's pool and runtime.
    pub fn season_store(&self) -> PostgresSeasonStore {
        PostgresSeasonStore {
            inner: self.inner.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

fn backend_err(e: sqlx::Error) -> DirectoryError {
    DirectoryError::Backend(e.to_string())
}

impl PlayerDirectory for PostgresDirectory {
    fn get_player(&self, id: &str) -> Result<Option<Player>, DirectoryError> {
        self.runtime.block_on(self.inner.get_player_async(id)).map_err(backend_err)
    }

    fn apply_match_result(&self, id: &str, delta: f64, result: MatchResult) -> Result<Player, DirectoryError> {
        self.runtime
            .block_on(self.inner.apply_match_result_async(id, delta, result))
            .map_err(backend_err)?
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))
    }

    fn list_top_by_rating(&self, n: usize, exclude_banned: bool) -> Result<Vec<Player>, DirectoryError> {
        self.runtime
            .block_on(self.inner.list_top_by_rating_async(n, exclude_banned))
            .map_err(backend_err)
    }

    fn reset_ratings(&self, baseline: f64) -> Result<usize, DirectoryError> {
        self.runtime
            .block_on(self.inner.reset_ratings_async(baseline))
            .map_err(backend_err)
    }
}

/// Synchronous season store over [`PostgresBackend`].
pub struct PostgresSeasonStore {
    inner: Arc<PostgresBackend>,
    runtime: Arc<Runtime>,
}

impl PostgresSeasonStore {
    pub fn new(backend: PostgresBackend, runtime: Runtime) -> Self {
        Self {
            inner: Arc::new(backend),
            runtime: Arc::new(runtime),
        }
    }

    pub fn connect(database_url: &str) -> Result<Self, BoxError> {
        let (inner, runtime) = connect(database_url)?;
        Ok(Self { inner, runtime })
    }
}

fn store_err(e: sqlx::Error) -> SeasonError {
    SeasonError::Store(e.to_string())
}

impl SeasonStore for PostgresSeasonStore {
    fn get(&self, season: u32) -> Result<Option<SeasonRecord>, SeasonError> {
        self.runtime.block_on(self.inner.get_season_async(season)).map_err(store_err)
    }

    fn insert_if_absent(&self, record: SeasonRecord) -> Result<bool, SeasonError> {
        self.runtime
            .block_on(self.inner.insert_season_async(&record))
            .map_err(store_err)
    }

    fn claim_reward(
        &self,
        season: u32,
        player_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, SeasonError> {
        self.runtime
            .block_on(self.inner.claim_reward_async(season, player_id, now, stale_before))
            .map_err(store_err)
    }

    fn finish_reward(&self, season: u32, player_id: &str, delivered: bool) -> Result<(), SeasonError> {
        let to = if delivered {
            RewardStatus::Delivered
        } else {
            RewardStatus::Pending
        };
        self.runtime
            .block_on(self.inner.finish_reward_async(season, player_id, to))
            .map_err(store_err)?;
        Ok(())
    }

    fn claim_reset(&self, season: u32) -> Result<bool, SeasonError> {
        self.runtime
            .block_on(self.inner.set_season_flag_async(season, SeasonFlag::RatingsReset, true))
            .map_err(store_err)
    }

    fn release_reset(&self, season: u32) -> Result<(), SeasonError> {
        self.runtime
            .block_on(self.inner.set_season_flag_async(season, SeasonFlag::RatingsReset, false))
            .map_err(store_err)?;
        Ok(())
    }

    fn mark_closed(&self, season: u32) -> Result<(), SeasonError> {
        self.runtime
            .block_on(self.inner.set_season_flag_async(season, SeasonFlag::Closed, true))
            .map_err(store_err)?;
        Ok(())
    }

    fn list(&self, limit: usize) -> Result<Vec<u32>, SeasonError> {
        self.runtime
            .block_on(self.inner.list_seasons_async(limit))
            .map_err(store_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reward_status_text() {
        for status in [RewardStatus::Pending, RewardStatus::Claimed, RewardStatus::Delivered] {
            assert_eq!(status_from_str(status_str(status)).unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_reward_status_is_an_error() {
        for text in ["garbage", "", "Delivered", "pending "] {
            let err = status_from_str(text).unwrap_err();
            assert!(matches!(err, sqlx::Error::Decode(_)), "{text:?}");
        }
    }

    // Needs a live database: DATABASE_URL=postgres://... cargo test --features postgres -- --ignored
    #[test]
    #[ignore]
    fn test_apply_match_result_roundtrip() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let directory = PostgresDirectory::connect(&url).unwrap();
        directory.migrate().unwrap();
        directory.upsert_player(&Player::new("pg-test", "PG", 1500.0)).unwrap();

        let p = directory.apply_match_result("pg-test", 16.4, MatchResult::Won).unwrap();
        assert_eq!(p.rating, 1516);
        assert_eq!(p.wins, 1);
        assert_eq!(p.current_streak, 1);
        assert_eq!(p.best_streak, 1);

        let p = directory.apply_match_result("pg-test", -10.0, MatchResult::Lost).unwrap();
        assert_eq!(p.current_streak, 0);
        assert_eq!(p.best_streak, 1);

        // Half-point ties round away from zero, same as the memory directory
        directory.upsert_player(&Player::new("pg-tie", "Tie", 1500.0)).unwrap();
        let p = directory.apply_match_result("pg-tie", 0.5, MatchResult::Drew).unwrap();
        assert_eq!(p.rating, 1501);
        assert_eq!(directory.get_player("pg-tie").unwrap().unwrap().rating, 1501);
    }
}

//! Seasons.
//!
//! A season is a calendar month identified by `year * 100 + month`. Closing
//! a season runs in phases, each recorded in the season store:
//!
//! 1. **Snapshot** the top-N leaderboard. Inserting the record is the
//!    atomic "has this season been closed" check; only one caller wins.
//! 2. **Rewards**, one ledger entry per ranked player. Each entry is
//!    claimed before delivery, so racing callers never deliver twice. A
//!    claim left behind by a crashed or failed caller expires after
//!    `reward_claim_timeout_secs` and is picked up by the next rollover.
//! 3. **Reset** every rating to the baseline, claimed once per season.
//! 4. **Close** once every reward is delivered and the reset is done.
//!
//! A retry after a partial failure resumes whatever is unfinished.
//! Nothing here schedules itself; a scheduler calls
//! [`SeasonManager::rollover_ending`] just after the month turns, an admin
//! calls [`SeasonManager::rollover_season`].

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::directory::{DirectoryError, Player, PlayerDirectory, PlayerId};

#[cfg(feature = "metrics")]
use crate::metrics::ArenaMetrics;

/// Season code for a point in time: `year * 100 + month`.
pub fn season_code<Tz: chrono::TimeZone>(now: &DateTime<Tz>) -> u32 {
    now.year() as u32 * 100 + now.month()
}

/// Code of the month before the one current at `now`. January rolls back
/// into December of the previous year.
pub fn previous_season_code<Tz: chrono::TimeZone>(now: &DateTime<Tz>) -> u32 {
    match now.month() {
        1 => (now.year() as u32 - 1) * 100 + 12,
        month => now.year() as u32 * 100 + month - 1,
    }
}

/// Season configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeasonConfig {
    /// Rating every player starts a season with.
    pub baseline_rating: f64,
    /// Leaderboard size captured at rollover.
    pub top_n: usize,
    /// Rewards for ranks 1, 2, 3, ... in order.
    pub reward_table: Vec<u64>,
    /// Reward for ranks past the table, up to `floor_reward_through_rank`.
    pub floor_reward: u64,
    pub floor_reward_through_rank: u32,
    /// A reward claimed this long ago without being finished may be
    /// claimed again by another rollover.
    pub reward_claim_timeout_secs: u64,
}

impl Default for SeasonConfig {
    fn default() -> Self {
        Self {
            baseline_rating: 1500.0,
            top_n: 100,
            reward_table: vec![1000, 700, 500],
            floor_reward: 100,
            floor_reward_through_rank: 10,
            reward_claim_timeout_secs: 300,
        }
    }
}

impl SeasonConfig {
    /// Reward for a 1-based rank, if any.
    pub fn reward_for_rank(&self, rank: u32) -> Option<u64> {
        if rank == 0 {
            return None;
        }
        if let Some(amount) = self.reward_table.get(rank as usize - 1) {
            return Some(*amount);
        }
        (rank <= self.floor_reward_through_rank).then_some(self.floor_reward)
    }

    pub fn reward_claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reward_claim_timeout_secs.min(i64::MAX as u64 / 1000) as i64)
    }
}

/// One row of a frozen leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub rank: u32,
    pub player_id: PlayerId,
    pub display_name: String,
    pub rating: i32,
    pub wins: u32,
    pub losses: u32,
    pub best_streak: u32,
}

impl RankingEntry {
    fn from_player(rank: u32, player: &Player) -> Self {
        Self {
            rank,
            player_id: player.id.clone(),
            display_name: player.display_name.clone(),
            rating: player.rating,
            wins: player.wins,
            losses: player.losses,
            best_streak: player.best_streak,
        }
    }
}

/// Delivery state of a reward ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardStatus {
    Pending,
    /// Claimed by a rollover that is delivering it.
    Claimed,
    Delivered,
}

/// A reward owed to a ranked player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardEntry {
    pub rank: u32,
    pub player_id: PlayerId,
    pub amount: u64,
    pub status: RewardStatus,
    /// When the current claim was taken. `None` unless `Claimed`.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl RewardEntry {
    /// True if a rollover may claim this entry now.
    pub fn claimable(&self, stale_before: DateTime<Utc>) -> bool {
        match self.status {
            RewardStatus::Pending => true,
            RewardStatus::Claimed => self.claimed_at.map_or(true, |at| at <= stale_before),
            RewardStatus::Delivered => false,
        }
    }
}

/// A closed (or closing) season.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonRecord {
    pub season: u32,
    pub snapshot: Vec<RankingEntry>,
    pub rewards: Vec<RewardEntry>,
    pub ratings_reset: bool,
    pub closed: bool,
    pub created_at: DateTime<Utc>,
}

impl SeasonRecord {
    pub fn all_rewards_delivered(&self) -> bool {
        self.rewards.iter().all(|r| r.status == RewardStatus::Delivered)
    }
}

/// Season errors.
#[derive(Debug, Error)]
pub enum SeasonError {
    #[error("season record missing: {0}")]
    RecordMissing(u32),

    #[error("reward entry missing: season {season}, player {player_id}")]
    RewardMissing { season: u32, player_id: PlayerId },

    #[error("reward delivery failed: {0}")]
    Reward(String),

    #[error("season {season}: {failed} reward(s) not delivered")]
    RewardsIncomplete { season: u32, failed: usize },

    #[error("store error: {0}")]
    Store(String),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
}

/// Persistence for season records.
///
/// Every state change is a single atomic compare-and-set on one record.
pub trait SeasonStore: Send + Sync {
    fn get(&self, season: u32) -> Result<Option<SeasonRecord>, SeasonError>;

    /// Insert unless a record for the season exists. True if inserted.
    fn insert_if_absent(&self, record: SeasonRecord) -> Result<bool, SeasonError>;

    /// Pending -> Claimed, or re-claim an entry whose claim was taken at or
    /// before `stale_before`. Stamps the claim with `now`. True if this
    /// caller claimed it.
    fn claim_reward(
        &self,
        season: u32,
        player_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, SeasonError>;

    /// Claimed -> Delivered on success, back to Pending on failure.
    fn finish_reward(&self, season: u32, player_id: &str, delivered: bool) -> Result<(), SeasonError>;

    /// Set `ratings_reset` if unset. True if this caller set it.
    fn claim_reset(&self, season: u32) -> Result<bool, SeasonError>;

    /// Undo a reset claim after the reset itself failed.
    fn release_reset(&self, season: u32) -> Result<(), SeasonError>;

    fn mark_closed(&self, season: u32) -> Result<(), SeasonError>;

    /// Most recent seasons first.
    fn list(&self, limit: usize) -> Result<Vec<u32>, SeasonError>;
}

/// In-memory season store.
pub struct MemorySeasonStore {
    records: DashMap<u32, SeasonRecord>,
}

impl MemorySeasonStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    fn with_record<T>(
        &self,
        season: u32,
        f: impl FnOnce(&mut SeasonRecord) -> Result<T, SeasonError>,
    ) -> Result<T, SeasonError> {
        let mut record = self
            .records
            .get_mut(&season)
            .ok_or(SeasonError::RecordMissing(season))?;
        f(&mut record)
    }

    fn with_reward<T>(
        &self,
        season: u32,
        player_id: &str,
        f: impl FnOnce(&mut RewardEntry) -> T,
    ) -> Result<T, SeasonError> {
        self.with_record(season, |record| {
            record
                .rewards
                .iter_mut()
                .find(|r| r.player_id == player_id)
                .map(f)
                .ok_or_else(|| SeasonError::RewardMissing {
                    season,
                    player_id: player_id.to_string(),
                })
        })
    }
}

impl Default for MemorySeasonStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SeasonStore for MemorySeasonStore {
    fn get(&self, season: u32) -> Result<Option<SeasonRecord>, SeasonError> {
        Ok(self.records.get(&season).map(|r| r.clone()))
    }

    fn insert_if_absent(&self, record: SeasonRecord) -> Result<bool, SeasonError> {
        match self.records.entry(record.season) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(true)
            }
        }
    }

    fn claim_reward(
        &self,
        season: u32,
        player_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, SeasonError> {
        self.with_reward(season, player_id, |entry| {
            if !entry.claimable(stale_before) {
                return false;
            }
            entry.status = RewardStatus::Claimed;
            entry.claimed_at = Some(now);
            true
        })
    }

    fn finish_reward(&self, season: u32, player_id: &str, delivered: bool) -> Result<(), SeasonError> {
        self.with_reward(season, player_id, |entry| {
            if entry.status == RewardStatus::Claimed {
                entry.status = if delivered {
                    RewardStatus::Delivered
                } else {
                    RewardStatus::Pending
                };
                entry.claimed_at = None;
            }
        })
    }

    fn claim_reset(&self, season: u32) -> Result<bool, SeasonError> {
        self.with_record(season, |record| {
            let claimed = !record.ratings_reset;
            record.ratings_reset = true;
            Ok(claimed)
        })
    }

    fn release_reset(&self, season: u32) -> Result<(), SeasonError> {
        self.with_record(season, |record| {
            record.ratings_reset = false;
            Ok(())
        })
    }

    fn mark_closed(&self, season: u32) -> Result<(), SeasonError> {
        self.with_record(season, |record| {
            record.closed = true;
            Ok(())
        })
    }

    fn list(&self, limit: usize) -> Result<Vec<u32>, SeasonError> {
        let mut seasons: Vec<u32> = self.records.iter().map(|r| *r.key()).collect();
        seasons.sort_unstable_by(|a, b| b.cmp(a));
        seasons.truncate(limit);
        Ok(seasons)
    }
}

/// Where season rewards go (the economy service).
///
/// A grant whose completion was never recorded (the store write failed or
/// the process died) is granted again once its claim expires, so sinks must
/// treat `(season, player_id)` as an idempotency key.
pub trait RewardSink: Send + Sync {
    fn grant(&self, season: u32, reward: &RewardEntry) -> Result<(), SeasonError>;
}

/// A granted reward, as recorded by [`MemoryRewardSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub season: u32,
    pub player_id: PlayerId,
    pub amount: u64,
}

/// Reward sink that keeps grants in memory, one per season and player.
#[derive(Default)]
pub struct MemoryRewardSink {
    grants: Mutex<Vec<Grant>>,
}

impl MemoryRewardSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grants(&self) -> Vec<Grant> {
        self.grants.lock().clone()
    }

    /// Total granted to a player across seasons.
    pub fn total_for(&self, player_id: &str) -> u64 {
        self.grants
            .lock()
            .iter()
            .filter(|g| g.player_id == player_id)
            .map(|g| g.amount)
            .sum()
    }
}

impl RewardSink for MemoryRewardSink {
    fn grant(&self, season: u32, reward: &RewardEntry) -> Result<(), SeasonError> {
        let mut grants = self.grants.lock();
        if grants
            .iter()
            .any(|g| g.season == season && g.player_id == reward.player_id)
        {
            return Ok(());
        }
        grants.push(Grant {
            season,
            player_id: reward.player_id.clone(),
            amount: reward.amount,
        });
        Ok(())
    }
}

/// How a rollover call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloverStatus {
    /// This call finished closing the season.
    Closed,
    /// The season was already closed; nothing was done.
    AlreadyClosed,
    /// Another rollover is still delivering part of the season.
    InProgress,
}

impl RolloverStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::AlreadyClosed => "already_closed",
            Self::InProgress => "in_progress",
        }
    }
}

/// Summary of one rollover call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloverReport {
    pub season: u32,
    pub status: RolloverStatus,
    /// True if this call wrote the snapshot.
    pub snapshot_written: bool,
    pub ranked_players: usize,
    pub rewards_delivered: usize,
    /// Players reset by this call, if it ran the reset.
    pub players_reset: Option<usize>,
}

/// Season manager.
pub struct SeasonManager {
    config: SeasonConfig,
    directory: Arc<dyn PlayerDirectory>,
    store: Arc<dyn SeasonStore>,
    rewards: Arc<dyn RewardSink>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<ArenaMetrics>>,
}

impl SeasonManager {
    pub fn new(
        config: SeasonConfig,
        directory: Arc<dyn PlayerDirectory>,
        store: Arc<dyn SeasonStore>,
        rewards: Arc<dyn RewardSink>,
    ) -> Self {
        Self {
            config,
            directory,
            store,
            rewards,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Enable metrics recording.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<ArenaMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &SeasonConfig {
        &self.config
    }

    /// Season in effect now.
    pub fn current_season_code(&self) -> u32 {
        season_code(&Utc::now())
    }

    pub fn record(&self, season: u32) -> Result<Option<SeasonRecord>, SeasonError> {
        self.store.get(season)
    }

    /// Close the season that is current at `now`.
    pub fn rollover(&self, now: DateTime<Utc>) -> Result<RolloverReport, SeasonError> {
        self.rollover_season_at(season_code(&now), now)
    }

    /// Close the season that ended when the month containing `now` began.
    /// This is what a scheduler firing on the 1st should call.
    pub fn rollover_ending(&self, now: DateTime<Utc>) -> Result<RolloverReport, SeasonError> {
        self.rollover_season_at(previous_season_code(&now), now)
    }

    /// Close a season. Safe to call repeatedly and concurrently.
    pub fn rollover_season(&self, season: u32) -> Result<RolloverReport, SeasonError> {
        self.rollover_season_at(season, Utc::now())
    }

    /// [`SeasonManager::rollover_season`] with an explicit clock for reward
    /// claim expiry.
    pub fn rollover_season_at(&self, season: u32, now: DateTime<Utc>) -> Result<RolloverReport, SeasonError> {
        let (record, snapshot_written) = match self.store.get(season)? {
            Some(record) => (record, false),
            None => {
                let snapshot = self.snapshot(season)?;
                let written = self.store.insert_if_absent(snapshot)?;
                if written {
                    info!(season, "season snapshot written");
                }
                let record = self.store.get(season)?.ok_or(SeasonError::RecordMissing(season))?;
                (record, written)
            }
        };

        let mut report = RolloverReport {
            season,
            status: RolloverStatus::AlreadyClosed,
            snapshot_written,
            ranked_players: record.snapshot.len(),
            rewards_delivered: 0,
            players_reset: None,
        };

        if record.closed {
            info!(season, "season already closed");
            self.record_rollover(report.status);
            return Ok(report);
        }

        let stale_before = now - self.config.reward_claim_timeout();
        let mut failed = 0;
        for reward in record.rewards.iter().filter(|r| r.claimable(stale_before)) {
            if !self.store.claim_reward(season, &reward.player_id, now, stale_before)? {
                continue;
            }
            if reward.status == RewardStatus::Claimed {
                warn!(season, player_id = %reward.player_id, "reclaiming stale reward claim");
            }
            match self.rewards.grant(season, reward) {
                Ok(()) => {
                    self.store.finish_reward(season, &reward.player_id, true)?;
                    report.rewards_delivered += 1;
                }
                Err(e) => {
                    warn!(season, player_id = %reward.player_id, error = %e, "reward delivery failed");
                    self.store.finish_reward(season, &reward.player_id, false)?;
                    failed += 1;
                }
            }
        }

        if !record.ratings_reset && self.store.claim_reset(season)? {
            match self.directory.reset_ratings(self.config.baseline_rating) {
                Ok(count) => {
                    info!(season, players = count, baseline = self.config.baseline_rating, "ratings reset");
                    report.players_reset = Some(count);
                }
                Err(e) => {
                    self.store.release_reset(season)?;
                    return Err(e.into());
                }
            }
        }

        if failed > 0 {
            return Err(SeasonError::RewardsIncomplete { season, failed });
        }

        let latest = self.store.get(season)?.ok_or(SeasonError::RecordMissing(season))?;
        report.status = if latest.closed {
            RolloverStatus::AlreadyClosed
        } else if latest.ratings_reset && latest.all_rewards_delivered() {
            self.store.mark_closed(season)?;
            info!(season, "season closed");
            RolloverStatus::Closed
        } else {
            RolloverStatus::InProgress
        };

        self.record_rollover(report.status);
        Ok(report)
    }

    fn snapshot(&self, season: u32) -> Result<SeasonRecord, SeasonError> {
        let top = self.directory.list_top_by_rating(self.config.top_n, true)?;

        let snapshot: Vec<RankingEntry> = top
            .iter()
            .enumerate()
            .map(|(i, p)| RankingEntry::from_player(i as u32 + 1, p))
            .collect();

        let rewards = snapshot
            .iter()
            .filter_map(|entry| {
                self.config.reward_for_rank(entry.rank).map(|amount| RewardEntry {
                    rank: entry.rank,
                    player_id: entry.player_id.clone(),
                    amount,
                    status: RewardStatus::Pending,
                    claimed_at: None,
                })
            })
            .collect();

        Ok(SeasonRecord {
            season,
            snapshot,
            rewards,
            ratings_reset: false,
            closed: false,
            created_at: Utc::now(),
        })
    }

    #[cfg(feature = "metrics")]
    fn record_rollover(&self, status: RolloverStatus) {
        if let Some(ref m) = self.metrics {
            m.rollovers_total.with_label_values(&[status.as_str()]).inc();
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_rollover(&self, _status: RolloverStatus) {}
}

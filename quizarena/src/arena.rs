//! Match engine facade.
//!
//! [`Arena`] wires the queue, session store, settlement coordinator and
//! season manager around one player directory. Gameplay code talks to this
//! type; the components stay usable on their own.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use quizarena::{Arena, MemoryDirectory, ReportOutcome};
//!
//! let arena = Arena::builder(Arc::new(MemoryDirectory::new())).build();
//! arena.enqueue("alice")?;
//! arena.enqueue("bob")?;
//!
//! for pairing in arena.pair() {
//!     arena.report_result(&pairing.room_id, "alice", 7)?;
//!     if let ReportOutcome::Settled { outcome, .. } = arena.report_result(&pairing.room_id, "bob", 4)? {
//!         println!("winner: {:?}", outcome.winner);
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ArenaConfig;
use crate::directory::PlayerDirectory;
use crate::error::Result;
use crate::queue::{MatchPairing, MatchQueue, QueueEntry, QueueStats};
use crate::rating::RatingEngine;
use crate::season::{
    season_code, MemoryRewardSink, MemorySeasonStore, RewardSink, RolloverReport, SeasonManager, SeasonRecord,
    SeasonStore,
};
use crate::session::{LobbyJoin, SessionState, SessionStore};
use crate::settlement::{CpuMatchReport, ReportOutcome, SettlementCoordinator, SettlementOutcome};

#[cfg(feature = "metrics")]
use crate::metrics::ArenaMetrics;

/// What one sweep did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub paired: Vec<MatchPairing>,
    /// Forfeits plus settlements retried after a failed directory write.
    pub settled: Vec<SettlementOutcome>,
    pub abandoned: Vec<String>,
    pub purged: usize,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        self.paired.is_empty() && self.settled.is_empty() && self.abandoned.is_empty() && self.purged == 0
    }
}

/// Builder for [`Arena`].
pub struct ArenaBuilder {
    config: ArenaConfig,
    directory: Arc<dyn PlayerDirectory>,
    season_store: Option<Arc<dyn SeasonStore>>,
    rewards: Option<Arc<dyn RewardSink>>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<ArenaMetrics>>,
}

impl ArenaBuilder {
    pub fn config(mut self, config: ArenaConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to an in-memory store.
    pub fn season_store(mut self, store: Arc<dyn SeasonStore>) -> Self {
        self.season_store = Some(store);
        self
    }

    /// Defaults to [`MemoryRewardSink`], which only records grants.
    pub fn reward_sink(mut self, rewards: Arc<dyn RewardSink>) -> Self {
        self.rewards = Some(rewards);
        self
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(mut self, metrics: Arc<ArenaMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Arena {
        let config = self.config;
        let sessions = Arc::new(SessionStore::new(config.session.clone()));
        let season_store = self
            .season_store
            .unwrap_or_else(|| Arc::new(MemorySeasonStore::new()));
        let rewards = self.rewards.unwrap_or_else(|| Arc::new(MemoryRewardSink::new()));

        let queue = MatchQueue::new(config.queue.clone(), self.directory.clone(), sessions.clone());
        let settlement = SettlementCoordinator::new(
            sessions.clone(),
            self.directory.clone(),
            RatingEngine::new(config.rating.clone()),
        );
        let seasons = SeasonManager::new(config.season.clone(), self.directory.clone(), season_store, rewards);

        #[cfg(feature = "metrics")]
        let (queue, settlement, seasons) = match &self.metrics {
            Some(m) => (
                queue.with_metrics(m.clone()),
                settlement.with_metrics(m.clone()),
                seasons.with_metrics(m.clone()),
            ),
            None => (queue, settlement, seasons),
        };

        Arena {
            config,
            directory: self.directory,
            sessions,
            queue,
            settlement,
            seasons,
            #[cfg(feature = "metrics")]
            metrics: self.metrics,
        }
    }
}

/// Competitive match engine.
pub struct Arena {
    config: ArenaConfig,
    directory: Arc<dyn PlayerDirectory>,
    sessions: Arc<SessionStore>,
    queue: MatchQueue,
    settlement: SettlementCoordinator,
    seasons: SeasonManager,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<ArenaMetrics>>,
}

impl Arena {
    pub fn builder(directory: Arc<dyn PlayerDirectory>) -> ArenaBuilder {
        ArenaBuilder {
            config: ArenaConfig::default(),
            directory,
            season_store: None,
            rewards: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<dyn PlayerDirectory> {
        &self.directory
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn queue(&self) -> &MatchQueue {
        &self.queue
    }

    pub fn seasons(&self) -> &SeasonManager {
        &self.seasons
    }

    // Queue

    /// Queue a player at their current directory rating. Unregistered ids
    /// queue as guests at the unrated rating.
    pub fn enqueue(&self, player_id: &str) -> Result<QueueEntry> {
        self.enqueue_at(player_id, Instant::now())
    }

    pub fn enqueue_at(&self, player_id: &str, now: Instant) -> Result<QueueEntry> {
        let (display_name, rating) = match self.directory.get_player(player_id)? {
            Some(p) => (p.display_name, p.rating),
            None => (player_id.to_string(), self.config.rating.unrated_rating.round() as i32),
        };
        Ok(self.queue.join_at(player_id, &display_name, rating, now)?)
    }

    /// Leave the queue. Returns false if the player was not queued.
    pub fn dequeue(&self, player_id: &str) -> bool {
        self.queue.leave(player_id).is_some()
    }

    /// Drop a disconnected player from the queue and any lobby they host.
    /// Sessions already in progress are left to the forfeit timeout.
    pub fn disconnect(&self, player_id: &str) {
        let queued = self.queue.leave(player_id).is_some();
        let lobbies = self.sessions.leave_all_lobbies(player_id);
        debug!(player_id, queued, lobbies, "player disconnected");
    }

    pub fn pair(&self) -> Vec<MatchPairing> {
        self.queue.pair()
    }

    pub fn on_pair<F>(&self, handler: F)
    where
        F: Fn(&MatchPairing) + Send + Sync + 'static,
    {
        self.queue.on_pair(handler);
    }

    pub fn drain_pairings(&self) -> Vec<MatchPairing> {
        self.queue.drain_pairings()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats(Instant::now())
    }

    // Sessions

    /// Join a free-practice lobby room.
    pub fn join_lobby(&self, room_id: &str, player_id: &str) -> Result<LobbyJoin> {
        Ok(self.sessions.join_lobby(room_id, player_id, Instant::now())?)
    }

    pub fn leave_lobby(&self, room_id: &str, player_id: &str) -> bool {
        self.sessions.leave_lobby(room_id, player_id)
    }

    pub fn session_state(&self, room_id: &str) -> Option<SessionState> {
        self.sessions.get(room_id).map(|s| s.lock().state)
    }

    // Settlement

    pub fn report_result(&self, room_id: &str, player_id: &str, score: i64) -> Result<ReportOutcome> {
        Ok(self.settlement.report_result(room_id, player_id, score)?)
    }

    pub fn report_result_at(&self, room_id: &str, player_id: &str, score: i64, now: Instant) -> Result<ReportOutcome> {
        Ok(self.settlement.report_result_at(room_id, player_id, score, now)?)
    }

    /// Settle a player-vs-CPU match. A retry with the same `match_id`
    /// returns the first outcome, even after the session was purged.
    pub fn report_cpu_result(&self, report: &CpuMatchReport) -> Result<ReportOutcome> {
        Ok(self.settlement.settle_cpu(report)?)
    }

    pub fn report_cpu_result_at(&self, report: &CpuMatchReport, now: Instant) -> Result<ReportOutcome> {
        Ok(self.settlement.settle_cpu_at(report, now)?)
    }

    // Maintenance

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// Pair the queue, forfeit silent sides, drop abandoned sessions and
    /// purge expired settled ones.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let report = SweepReport {
            paired: self.queue.pair_at(now),
            settled: self.settlement.sweep_forfeits(now),
            abandoned: self.sessions.abandon_stale(now),
            purged: self.sessions.purge_settled(now),
        };
        self.record_abandoned(report.abandoned.len());

        if !report.is_idle() {
            debug!(
                paired = report.paired.len(),
                settled = report.settled.len(),
                abandoned = report.abandoned.len(),
                purged = report.purged,
                "sweep finished"
            );
        }
        report
    }

    /// Run [`Arena::sweep`] every `interval` on the current tokio runtime.
    /// Abort the returned handle to stop it.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Directory backends may block
                let arena = self.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || arena.sweep()).await {
                    warn!(error = %e, "sweep task failed");
                }
            }
        })
    }

    // Seasons

    /// Season in effect now.
    pub fn season_code(&self) -> u32 {
        season_code(&Utc::now())
    }

    /// Close the current season. Safe to race with the scheduled call.
    pub fn trigger_rollover(&self) -> Result<RolloverReport> {
        let season = self.season_code();
        info!(season, "rollover requested");
        Ok(self.seasons.rollover_season(season)?)
    }

    /// Close the month that ended before `now`. The scheduled path: firing
    /// at 00:00:05 on January 1st closes December of the previous year.
    pub fn rollover_ending(&self, now: DateTime<Utc>) -> Result<RolloverReport> {
        let report = self.seasons.rollover_ending(now)?;
        info!(season = report.season, status = report.status.as_str(), "scheduled rollover finished");
        Ok(report)
    }

    pub fn rollover_season(&self, season: u32) -> Result<RolloverReport> {
        Ok(self.seasons.rollover_season(season)?)
    }

    /// Frozen leaderboard and reward ledger of a closed season.
    pub fn season_record(&self, season: u32) -> Result<Option<SeasonRecord>> {
        Ok(self.seasons.record(season)?)
    }

    #[cfg(feature = "metrics")]
    fn record_abandoned(&self, count: usize) {
        if let Some(ref m) = self.metrics {
            m.abandoned_sessions_total.inc_by(count as u64);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_abandoned(&self, _count: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, Player};
    use crate::error::ArenaError;
    use crate::queue::QueueError;
    use crate::season::RolloverStatus;
    use crate::session::CpuOpponent;
    use crate::settlement::SettleError;

    fn arena() -> (Arc<MemoryDirectory>, Arena) {
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert(Player::new("alice", "Alice", 1500.0));
        directory.insert(Player::new("bob", "Bob", 1520.0));
        let arena = Arena::builder(directory.clone()).build();
        (directory, arena)
    }

    #[test]
    fn test_full_match_flow() {
        let (directory, arena) = arena();

        arena.enqueue("alice").unwrap();
        arena.enqueue("bob").unwrap();
        let pairings = arena.pair();
        assert_eq!(pairings.len(), 1);
        let room = &pairings[0].room_id;
        assert_eq!(arena.session_state(room), Some(SessionState::Open));

        let first = arena.report_result(room, "alice", 8).unwrap();
        assert!(matches!(first, ReportOutcome::Waiting { .. }));
        assert_eq!(arena.session_state(room), Some(SessionState::AwaitingResult));

        let second = arena.report_result(room, "bob", 3).unwrap();
        let outcome = second.outcome().unwrap();
        assert_eq!(outcome.winner.as_deref(), Some("alice"));
        assert_eq!(arena.session_state(room), Some(SessionState::Settled));

        let alice = directory.get_player("alice").unwrap().unwrap();
        let bob = directory.get_player("bob").unwrap().unwrap();
        assert!(alice.rating > 1500);
        assert!(bob.rating < 1520);
        assert_eq!(alice.wins, 1);
        assert_eq!(bob.losses, 1);

        // players are free to queue again
        arena.enqueue("alice").unwrap();
    }

    #[test]
    fn test_enqueue_guest_and_banned() {
        let (directory, arena) = arena();
        let guest = arena.enqueue("guest-7").unwrap();
        assert_eq!(guest.rating, 1500);
        assert_eq!(guest.display_name, "guest-7");

        directory.set_banned("bob", true);
        let err = arena.enqueue("bob").unwrap_err();
        assert!(matches!(err, ArenaError::Queue(QueueError::Banned(_))));
    }

    #[test]
    fn test_disconnect_clears_queue_and_lobby() {
        let (_, arena) = arena();
        arena.enqueue("alice").unwrap();
        assert_eq!(arena.join_lobby("practice-1", "alice").unwrap(), LobbyJoin::Waiting);

        arena.disconnect("alice");
        assert!(!arena.dequeue("alice"));
        assert_eq!(arena.join_lobby("practice-1", "bob").unwrap(), LobbyJoin::Waiting);
    }

    #[test]
    fn test_unknown_room_is_benign() {
        let (_, arena) = arena();
        let err = arena.report_result("nope", "alice", 1).unwrap_err();
        assert!(err.is_benign());
        assert!(matches!(err, ArenaError::Settle(SettleError::RoomNotFound(_))));
    }

    #[test]
    fn test_cpu_result() {
        let (directory, arena) = arena();
        let report = CpuMatchReport {
            match_id: "cpu-1".into(),
            player_id: "alice".into(),
            player_score: 6,
            opponent: CpuOpponent::new("quizbot", 1400.0),
            opponent_score: 2,
        };
        let first = arena.report_cpu_result(&report).unwrap();
        let again = arena.report_cpu_result(&report).unwrap();
        assert_eq!(first.outcome(), again.outcome());
        assert!(matches!(again, ReportOutcome::Settled { cached: true, .. }));
        assert_eq!(directory.get_player("alice").unwrap().unwrap().wins, 1);
    }

    #[test]
    fn test_cpu_retry_after_purge() {
        let (directory, arena) = arena();
        let report = CpuMatchReport {
            match_id: "cpu-1".into(),
            player_id: "alice".into(),
            player_score: 6,
            opponent: CpuOpponent::new("quizbot", 1400.0),
            opponent_score: 2,
        };
        let t0 = Instant::now();
        let first = arena.report_cpu_result_at(&report, t0).unwrap();
        assert_eq!(directory.get_player("alice").unwrap().unwrap().wins, 1);

        let later = t0 + arena.config().session.settled_retention() + Duration::from_secs(100);
        assert_eq!(arena.sweep_at(later).purged, 1);

        let retry = arena.report_cpu_result_at(&report, later).unwrap();
        assert!(matches!(retry, ReportOutcome::Settled { cached: true, .. }));
        assert_eq!(retry.outcome(), first.outcome());
        assert_eq!(directory.get_player("alice").unwrap().unwrap().wins, 1);
    }

    #[test]
    fn test_sweep_forfeits_and_purges() {
        let (directory, arena) = arena();
        let t0 = Instant::now();
        arena.enqueue_at("alice", t0).unwrap();
        arena.enqueue_at("bob", t0).unwrap();
        let room = arena.sweep_at(t0).paired[0].room_id.clone();

        arena.report_result_at(&room, "bob", 5, t0).unwrap();

        let forfeit_at = t0 + arena.config().session.forfeit_timeout() + Duration::from_secs(1);
        let report = arena.sweep_at(forfeit_at);
        assert_eq!(report.settled.len(), 1);
        assert_eq!(report.settled[0].winner.as_deref(), Some("bob"));
        assert_eq!(directory.get_player("alice").unwrap().unwrap().losses, 1);

        let purge_at = forfeit_at + arena.config().session.settled_retention();
        assert_eq!(arena.sweep_at(purge_at).purged, 1);
        assert!(arena.session_state(&room).is_none());
    }

    #[test]
    fn test_trigger_rollover_uses_current_season() {
        let (_, arena) = arena();
        let report = arena.trigger_rollover().unwrap();
        assert_eq!(report.season, arena.season_code());
        let record = arena.season_record(report.season).unwrap().unwrap();
        assert_eq!(record.snapshot.len(), 2);
        assert_eq!(record.snapshot[0].player_id, "bob");
    }

    #[test]
    fn test_rollover_ending_across_new_year() {
        use chrono::TimeZone;

        let (_, arena) = arena();
        let fired_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 5).unwrap();
        let report = arena.rollover_ending(fired_at).unwrap();
        assert_eq!(report.season, 202512);
        assert!(arena.season_record(202512).unwrap().unwrap().closed);
        assert!(arena.season_record(202601).unwrap().is_none());

        let again = arena.rollover_ending(fired_at + chrono::Duration::minutes(1)).unwrap();
        assert_eq!(again.status, RolloverStatus::AlreadyClosed);
    }
}

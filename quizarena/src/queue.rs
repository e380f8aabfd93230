//! Ranked match queue.
//!
//! Pairs waiting players by rating proximity with a window that widens the
//! longer a player waits. The oldest entry picks first, taking the nearest
//! rating inside the window (ties go to the earlier joiner).
//!
//! Join, leave and pairing share one lock. Pairing removes both entries and
//! creates the match session inside that lock, so a concurrent join can never
//! be paired with an entry that was already taken.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::directory::{DirectoryError, PlayerDirectory, PlayerId};
use crate::session::{SessionError, SessionStore};

#[cfg(feature = "metrics")]
use crate::metrics::ArenaMetrics;

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Rating window for a player who just joined.
    pub initial_window: f64,
    /// How much the window widens per second of waiting.
    pub window_expansion_per_sec: f64,
    /// Widest the window gets.
    pub max_window: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            initial_window: 100.0,
            window_expansion_per_sec: 10.0,
            max_window: 500.0,
        }
    }
}

impl QueueConfig {
    /// Rating window after waiting `wait`.
    pub fn window(&self, wait: Duration) -> f64 {
        (self.initial_window + self.window_expansion_per_sec * wait.as_secs_f64()).min(self.max_window)
    }
}

/// A waiting player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub player_id: PlayerId,
    pub display_name: String,
    /// Rating when the player joined.
    pub rating: i32,
    /// Join time, unix millis.
    pub joined_at: i64,
}

/// Two players taken off the queue and the session created for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPairing {
    pub room_id: String,
    pub players: [QueueEntry; 2],
    pub created_at: i64,
}

/// Queue statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub longest_wait_secs: u64,
}

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("player already queued: {0}")]
    AlreadyQueued(PlayerId),

    #[error("player is banned: {0}")]
    Banned(PlayerId),

    #[error("player already in a match: {0}")]
    InMatch(PlayerId),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
}

struct Queued {
    entry: QueueEntry,
    queued_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<PlayerId, Queued>,
    next_seq: u64,
}

type PairHandler = Arc<dyn Fn(&MatchPairing) + Send + Sync>;

/// Ranked match queue.
pub struct MatchQueue {
    config: QueueConfig,
    directory: Arc<dyn PlayerDirectory>,
    sessions: Arc<SessionStore>,
    state: Mutex<QueueState>,
    /// Pairings not yet drained by the caller.
    pending: Mutex<VecDeque<MatchPairing>>,
    handlers: RwLock<Vec<PairHandler>>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<ArenaMetrics>>,
}

impl MatchQueue {
    pub fn new(config: QueueConfig, directory: Arc<dyn PlayerDirectory>, sessions: Arc<SessionStore>) -> Self {
        Self {
            config,
            directory,
            sessions,
            state: Mutex::new(QueueState::default()),
            pending: Mutex::new(VecDeque::new()),
            handlers: RwLock::new(vec![]),
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

    /// Add a player with the rating they had when asking to join.
    pub fn join(&self, player_id: &str, display_name: &str, rating: i32) -> Result<QueueEntry, QueueError> {
        self.join_at(player_id, display_name, rating, Instant::now())
    }

    pub fn join_at(
        &self,
        player_id: &str,
        display_name: &str,
        rating: i32,
        now: Instant,
    ) -> Result<QueueEntry, QueueError> {
        if let Some(player) = self.directory.get_player(player_id)? {
            if player.banned {
                return Err(QueueError::Banned(player_id.to_string()));
            }
        }

        let mut state = self.state.lock();

        if state.entries.contains_key(player_id) {
            return Err(QueueError::AlreadyQueued(player_id.to_string()));
        }
        if self.sessions.is_in_match(player_id) {
            return Err(QueueError::InMatch(player_id.to_string()));
        }

        let entry = QueueEntry {
            player_id: player_id.to_string(),
            display_name: display_name.to_string(),
            rating,
            joined_at: now_millis(),
        };
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            player_id.to_string(),
            Queued {
                entry: entry.clone(),
                queued_at: now,
                seq,
            },
        );
        self.record_size(state.entries.len());

        debug!(player_id, rating, "joined queue");
        Ok(entry)
    }

    /// Remove a player. No-op if they are not queued.
    pub fn leave(&self, player_id: &str) -> Option<QueueEntry> {
        let mut state = self.state.lock();
        let removed = state.entries.remove(player_id).map(|q| q.entry);
        if removed.is_some() {
            self.record_size(state.entries.len());
            debug!(player_id, "left queue");
        }
        removed
    }

    pub fn is_queued(&self, player_id: &str) -> bool {
        self.state.lock().entries.contains_key(player_id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self, now: Instant) -> QueueStats {
        let state = self.state.lock();
        let longest = state
            .entries
            .values()
            .map(|q| now.saturating_duration_since(q.queued_at))
            .max()
            .unwrap_or(Duration::ZERO);
        QueueStats {
            waiting: state.entries.len(),
            longest_wait_secs: longest.as_secs(),
        }
    }

    /// Register a callback fired for every new pairing. Handlers run with
    /// no queue lock held and may call back into the queue.
    pub fn on_pair<F>(&self, handler: F)
    where
        F: Fn(&MatchPairing) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Take pairings made since the last drain.
    pub fn drain_pairings(&self) -> Vec<MatchPairing> {
        self.pending.lock().drain(..).collect()
    }

    /// Pair everyone who can be paired right now.
    pub fn pair(&self) -> Vec<MatchPairing> {
        self.pair_at(Instant::now())
    }

    pub fn pair_at(&self, now: Instant) -> Vec<MatchPairing> {
        let pairings = {
            let mut state = self.state.lock();
            let pairs = self.select_pairs(&state, now);
            let mut pairings = Vec::with_capacity(pairs.len());

            for (a, b) in pairs {
                let room_id = Uuid::new_v4().to_string();
                match self.sessions.create(&room_id, &a, &b, now) {
                    Ok(_) => {
                        let (Some(qa), Some(qb)) = (state.entries.remove(&a), state.entries.remove(&b)) else {
                            continue;
                        };
                        info!(room_id = %room_id, player_a = %a, player_b = %b, "players paired");
                        pairings.push(MatchPairing {
                            room_id,
                            players: [qa.entry, qb.entry],
                            created_at: now_millis(),
                        });
                    }
                    Err(SessionError::PlayerInMatch(busy)) => {
                        // Already playing elsewhere: drop the stale entry and
                        // leave the other player waiting.
                        warn!(player_id = %busy, "queued player already in a match, dropping entry");
                        state.entries.remove(&busy);
                    }
                    Err(e) => warn!(error = %e, "could not create session for pairing"),
                }
            }

            self.record_size(state.entries.len());
            pairings
        };

        if !pairings.is_empty() {
            self.pending.lock().extend(pairings.iter().cloned());
            self.record_pairings(pairings.len());
            let handlers: Vec<PairHandler> = self.handlers.read().clone();
            for pairing in &pairings {
                for handler in &handlers {
                    handler(pairing);
                }
            }
        }

        pairings
    }

    fn select_pairs(&self, state: &QueueState, now: Instant) -> Vec<(PlayerId, PlayerId)> {
        let mut order: Vec<&Queued> = state.entries.values().collect();
        order.sort_by_key(|q| q.seq);

        let windows: Vec<f64> = order
            .iter()
            .map(|q| self.config.window(now.saturating_duration_since(q.queued_at)))
            .collect();

        let mut used: HashSet<usize> = HashSet::new();
        let mut pairs = Vec::new();

        for i in 0..order.len() {
            if used.contains(&i) {
                continue;
            }

            let mut best: Option<(i64, usize)> = None;
            for j in 0..order.len() {
                if i == j || used.contains(&j) {
                    continue;
                }
                let gap = (order[i].entry.rating as i64 - order[j].entry.rating as i64).abs();
                if gap as f64 > windows[i].max(windows[j]) {
                    continue;
                }
                // order is by seq, so the first j at a given gap joined earliest
                if best.map_or(true, |(best_gap, _)| gap < best_gap) {
                    best = Some((gap, j));
                }
            }

            if let Some((_, j)) = best {
                used.insert(i);
                used.insert(j);
                pairs.push((order[i].entry.player_id.clone(), order[j].entry.player_id.clone()));
            }
        }

        pairs
    }

    #[cfg(feature = "metrics")]
    fn record_size(&self, size: usize) {
        if let Some(ref m) = self.metrics {
            m.queue_size.set(size as i64);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_size(&self, _size: usize) {}

    #[cfg(feature = "metrics")]
    fn record_pairings(&self, count: usize) {
        if let Some(ref m) = self.metrics {
            m.pairings_total.inc_by(count as u64);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_pairings(&self, _count: usize) {}
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, Player};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<MemoryDirectory>, Arc<SessionStore>, MatchQueue) {
        let directory = Arc::new(MemoryDirectory::new());
        let sessions = Arc::new(SessionStore::default());
        let queue = MatchQueue::new(QueueConfig::default(), directory.clone(), sessions.clone());
        (directory, sessions, queue)
    }

    #[test]
    fn test_join_and_leave() {
        let (_, _, queue) = setup();

        queue.join("u1", "Alice", 1500).unwrap();
        assert!(queue.is_queued("u1"));
        assert!(matches!(
            queue.join("u1", "Alice", 1500),
            Err(QueueError::AlreadyQueued(_))
        ));

        assert!(queue.leave("u1").is_some());
        assert!(queue.leave("u1").is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stats() {
        let (_, _, queue) = setup();
        let start = Instant::now();
        queue.join_at("u1", "Alice", 1000, start).unwrap();
        queue.join_at("u2", "Bob", 2000, start + Duration::from_secs(5)).unwrap();

        let stats = queue.stats(start + Duration::from_secs(12));
        assert_eq!(stats.waiting, 2);
        assert_eq!(stats.longest_wait_secs, 12);
    }

    #[test]
    fn test_banned_player_rejected() {
        let (directory, _, queue) = setup();
        directory.insert(Player::new("cheater", "Cheater", 1500.0));
        directory.set_banned("cheater", true);

        assert!(matches!(
            queue.join("cheater", "Cheater", 1500),
            Err(QueueError::Banned(_))
        ));
        assert!(!queue.is_queued("cheater"));
    }

    #[test]
    fn test_pairs_close_ratings() {
        let (_, sessions, queue) = setup();
        let now = Instant::now();

        queue.join_at("u1", "Alice", 1500, now).unwrap();
        queue.join_at("u2", "Bob", 1550, now).unwrap();

        let pairings = queue.pair_at(now);
        assert_eq!(pairings.len(), 1);
        assert!(queue.is_empty());
        assert!(sessions.contains(&pairings[0].room_id));
        assert!(sessions.is_in_match("u1"));
        assert_eq!(queue.drain_pairings(), pairings);
        assert!(queue.drain_pairings().is_empty());
    }

    #[test]
    fn test_window_widens_with_wait() {
        let (_, _, queue) = setup();
        let start = Instant::now();

        queue.join_at("u1", "Alice", 1500, start).unwrap();
        queue.join_at("u2", "Bob", 1800, start).unwrap();

        assert!(queue.pair_at(start).is_empty());
        assert!(queue.pair_at(start + Duration::from_secs(10)).is_empty());

        // 100 + 10/s * 20s = 300
        let pairings = queue.pair_at(start + Duration::from_secs(20));
        assert_eq!(pairings.len(), 1);
    }

    #[test]
    fn test_nearest_rating_preferred() {
        let (_, _, queue) = setup();
        let now = Instant::now();

        queue.join_at("anchor", "Anchor", 1500, now).unwrap();
        queue.join_at("far", "Far", 1590, now).unwrap();
        queue.join_at("near", "Near", 1510, now).unwrap();

        let pairings = queue.pair_at(now);
        assert_eq!(pairings.len(), 1);
        let ids: Vec<&str> = pairings[0].players.iter().map(|p| p.player_id.as_str()).collect();
        assert_eq!(ids, vec!["anchor", "near"]);
        assert!(queue.is_queued("far"));
    }

    #[test]
    fn test_tie_goes_to_earliest_joiner() {
        let (_, _, queue) = setup();
        let now = Instant::now();

        queue.join_at("anchor", "Anchor", 1500, now).unwrap();
        queue.join_at("first", "First", 1540, now).unwrap();
        queue.join_at("second", "Second", 1460, now).unwrap();

        let pairings = queue.pair_at(now);
        assert_eq!(pairings[0].players[1].player_id, "first");
    }

    #[test]
    fn test_in_match_player_cannot_queue() {
        let (_, sessions, queue) = setup();
        sessions.create("room", "u1", "u2", Instant::now()).unwrap();
        assert!(matches!(queue.join("u1", "Alice", 1500), Err(QueueError::InMatch(_))));
    }

    #[test]
    fn test_pair_handler_fires() {
        let (_, _, queue) = setup();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        queue.on_pair(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let now = Instant::now();
        for (id, rating) in [("a", 1500), ("b", 1510), ("c", 1700), ("d", 1720)] {
            queue.join_at(id, id, rating, now).unwrap();
        }
        assert_eq!(queue.pair_at(now).len(), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pair_handler_can_reenter_queue() {
        let (_, _, queue) = setup();
        let queue = Arc::new(queue);
        let weak = Arc::downgrade(&queue);
        let late = Arc::new(AtomicUsize::new(0));
        let late_counter = late.clone();

        queue.on_pair(move |pairing| {
            let Some(queue) = weak.upgrade() else { return };
            // Register another handler and requeue a rematch from inside
            let counter = late_counter.clone();
            queue.on_pair(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            let rematch = format!("{}-rematch", pairing.players[0].player_id);
            queue.join(&rematch, &rematch, 1500).unwrap();
            assert!(queue.stats(Instant::now()).waiting >= 1);
        });

        let now = Instant::now();
        queue.join_at("a", "a", 1500, now).unwrap();
        queue.join_at("b", "b", 1505, now).unwrap();
        assert_eq!(queue.pair_at(now).len(), 1);
        assert!(queue.is_queued("a-rematch") || queue.is_queued("b-rematch"));
        // Handlers added during dispatch fire from the next pairing on
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_joins_never_double_pair() {
        let (_, sessions, queue) = setup();
        let queue = Arc::new(queue);

        std::thread::scope(|s| {
            for t in 0..8 {
                let queue = queue.clone();
                s.spawn(move || {
                    for i in 0..25 {
                        let id = format!("p{t}-{i}");
                        queue.join(&id, &id, 1500 + i).unwrap();
                        queue.pair();
                    }
                });
            }
        });
        let pairings = {
            let mut all = queue.drain_pairings();
            all.extend(queue.pair());
            all
        };

        let mut seen = HashSet::new();
        for p in &pairings {
            for entry in &p.players {
                assert!(seen.insert(entry.player_id.clone()), "{} paired twice", entry.player_id);
            }
        }
        assert_eq!(seen.len() + queue.len(), 200);
        assert_eq!(sessions.count(), pairings.len());
    }
}

//! Match session store.
//!
//! One [`MatchSession`] per room, each behind its own mutex so that reports
//! for different rooms never contend. Sessions move strictly forward:
//!
//! ```text
//! Open -> AwaitingResult -> Settled
//! ```
//!
//! The store also owns the free-practice lobbies (first two occupants of a
//! caller-named room become a session) and the timeouts the sweeper uses to
//! forfeit, abandon and purge sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::directory::PlayerId;
use crate::settlement::SettlementOutcome;

/// Session timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// One side reported and the other has been silent this long: forfeit.
    pub forfeit_timeout_secs: u64,
    /// Nobody reported for this long: drop the session without a result.
    pub abandon_timeout_secs: u64,
    /// How long settled sessions keep answering duplicate reports.
    pub settled_retention_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            forfeit_timeout_secs: 180,
            abandon_timeout_secs: 1800,
            settled_retention_secs: 600,
        }
    }
}

impl SessionConfig {
    pub fn forfeit_timeout(&self) -> Duration {
        Duration::from_secs(self.forfeit_timeout_secs)
    }

    pub fn abandon_timeout(&self) -> Duration {
        Duration::from_secs(self.abandon_timeout_secs)
    }

    pub fn settled_retention(&self) -> Duration {
        Duration::from_secs(self.settled_retention_secs)
    }
}

/// Synthetic opponent for player-vs-CPU matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuOpponent {
    pub name: String,
    pub rating: f64,
}

impl CpuOpponent {
    pub fn new(name: impl Into<String>, rating: f64) -> Self {
        Self {
            name: name.into(),
            rating,
        }
    }
}

/// One side of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Participant {
    Player(PlayerId),
    Cpu(CpuOpponent),
}

impl Participant {
    /// Identifier used in outcomes. CPU sides are prefixed with `cpu:`.
    pub fn id(&self) -> String {
        match self {
            Self::Player(id) => id.clone(),
            Self::Cpu(cpu) => format!("cpu:{}", cpu.name),
        }
    }

    pub fn player_id(&self) -> Option<&str> {
        match self {
            Self::Player(id) => Some(id),
            Self::Cpu(_) => None,
        }
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, Self::Cpu(_))
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Paired, no results yet.
    Open,
    /// At least one side reported; settlement not yet persisted.
    AwaitingResult,
    /// Outcome computed and persisted. Terminal.
    Settled,
}

/// A paired match.
#[derive(Debug, Clone)]
pub struct MatchSession {
    pub room_id: String,
    pub participants: [Participant; 2],
    pub state: SessionState,
    pub scores: [Option<i64>; 2],
    /// Computed outcome whose directory writes are not all done yet.
    pub(crate) pending: Option<SettlementOutcome>,
    /// Which sides' directory writes have been persisted.
    pub(crate) applied: [bool; 2],
    pub outcome: Option<SettlementOutcome>,
    pub created_at: Instant,
    pub first_report_at: Option<Instant>,
    pub settled_at: Option<Instant>,
}

impl MatchSession {
    pub fn new(room_id: impl Into<String>, a: Participant, b: Participant, now: Instant) -> Self {
        Self {
            room_id: room_id.into(),
            participants: [a, b],
            state: SessionState::Open,
            scores: [None, None],
            pending: None,
            applied: [false, false],
            outcome: None,
            created_at: now,
            first_report_at: None,
            settled_at: None,
        }
    }

    /// Index of the side played by `player_id`.
    pub fn side_of(&self, player_id: &str) -> Option<usize> {
        self.participants
            .iter()
            .position(|p| p.player_id() == Some(player_id))
    }

    pub fn has_cpu(&self) -> bool {
        self.participants.iter().any(Participant::is_cpu)
    }

    /// Record a side's score. The first report for a side wins; returns
    /// false if that side had already reported.
    pub fn record_score(&mut self, side: usize, score: i64, now: Instant) -> bool {
        if self.scores[side].is_some() {
            return false;
        }
        self.scores[side] = Some(score);
        if self.state == SessionState::Open {
            self.state = SessionState::AwaitingResult;
            self.first_report_at = Some(now);
        }
        true
    }

    pub fn both_reported(&self) -> bool {
        self.scores.iter().all(Option::is_some)
    }

    /// The only side that has reported, if exactly one has.
    pub fn sole_reporter(&self) -> Option<usize> {
        match self.scores {
            [Some(_), None] => Some(0),
            [None, Some(_)] => Some(1),
            _ => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.state == SessionState::Settled
    }

    /// True once the forfeit timeout has run out on a half-reported session.
    pub fn forfeit_due(&self, now: Instant, timeout: Duration) -> bool {
        self.state == SessionState::AwaitingResult
            && self.sole_reporter().is_some()
            && self
                .first_report_at
                .is_some_and(|at| now.saturating_duration_since(at) >= timeout)
    }

    pub(crate) fn mark_settled(&mut self, outcome: SettlementOutcome, now: Instant) {
        self.pending = None;
        self.outcome = Some(outcome);
        self.state = SessionState::Settled;
        self.settled_at = Some(now);
    }
}

/// Shared handle to a session and its per-room lock.
pub type SessionHandle = Arc<Mutex<MatchSession>>;

/// Session store errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("room already exists: {0}")]
    RoomExists(String),

    #[error("player already in a match: {0}")]
    PlayerInMatch(PlayerId),

    #[error("a session needs two distinct participants")]
    SameParticipant,
}

/// Result of joining a free-practice lobby.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyJoin {
    /// First occupant; waiting for an opponent.
    Waiting,
    /// Second occupant arrived; a session was created for the room.
    Ready { room_id: String, opponent: PlayerId },
}

/// Match session store.
pub struct SessionStore {
    config: SessionConfig,
    sessions: DashMap<String, SessionHandle>,
    /// Players in an unsettled human-vs-human session: player -> room.
    active_players: DashMap<PlayerId, String>,
    /// Free-practice rooms with one occupant: room -> player.
    lobbies: Mutex<HashMap<String, PlayerId>>,
    /// Outcomes of settled CPU matches by match id. Outlives session purging
    /// so a retry with an old match id never rates twice.
    cpu_outcomes: DashMap<String, SettlementOutcome>,
    /// Serializes session creation so the player index and the session map
    /// change together.
    create_lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            active_players: DashMap::new(),
            lobbies: Mutex::new(HashMap::new()),
            cpu_outcomes: DashMap::new(),
            create_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create a human-vs-human session.
    pub fn create(&self, room_id: &str, a: &str, b: &str, now: Instant) -> Result<SessionHandle, SessionError> {
        if a == b {
            return Err(SessionError::SameParticipant);
        }

        let _guard = self.create_lock.lock();

        if self.sessions.contains_key(room_id) {
            return Err(SessionError::RoomExists(room_id.to_string()));
        }
        for id in [a, b] {
            if self.active_players.contains_key(id) {
                return Err(SessionError::PlayerInMatch(id.to_string()));
            }
        }

        let session = MatchSession::new(
            room_id,
            Participant::Player(a.to_string()),
            Participant::Player(b.to_string()),
            now,
        );
        let handle = Arc::new(Mutex::new(session));
        self.active_players.insert(a.to_string(), room_id.to_string());
        self.active_players.insert(b.to_string(), room_id.to_string());
        self.sessions.insert(room_id.to_string(), handle.clone());

        info!(room_id, player_a = a, player_b = b, "match session created");
        Ok(handle)
    }

    /// Look up a player-vs-CPU session, creating it on first use.
    ///
    /// CPU sessions do not enter the active-player index: they never block
    /// queueing.
    pub fn get_or_create_cpu(&self, room_id: &str, player_id: &str, cpu: &CpuOpponent, now: Instant) -> SessionHandle {
        let _guard = self.create_lock.lock();
        self.sessions
            .entry(room_id.to_string())
            .or_insert_with(|| {
                debug!(room_id, player_id, cpu = %cpu.name, "cpu session created");
                Arc::new(Mutex::new(MatchSession::new(
                    room_id,
                    Participant::Player(player_id.to_string()),
                    Participant::Cpu(cpu.clone()),
                    now,
                )))
            })
            .clone()
    }

    /// Settled outcome of a CPU match, even after its session was purged.
    pub fn cpu_outcome(&self, match_id: &str) -> Option<SettlementOutcome> {
        self.cpu_outcomes.get(match_id).map(|o| o.value().clone())
    }

    pub(crate) fn record_cpu_outcome(&self, outcome: &SettlementOutcome) {
        self.cpu_outcomes
            .entry(outcome.room_id.clone())
            .or_insert_with(|| outcome.clone());
    }

    pub fn get(&self, room_id: &str) -> Option<SessionHandle> {
        self.sessions.get(room_id).map(|s| s.value().clone())
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.sessions.contains_key(room_id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Room of the unsettled session a player is in.
    pub fn active_room(&self, player_id: &str) -> Option<String> {
        self.active_players.get(player_id).map(|r| r.value().clone())
    }

    pub fn is_in_match(&self, player_id: &str) -> bool {
        self.active_players.contains_key(player_id)
    }

    /// Drop a session's players from the active index. Call with the
    /// session's lock held, after it settles or is abandoned.
    pub(crate) fn release_players(&self, session: &MatchSession) {
        for p in &session.participants {
            if let Participant::Player(id) = p {
                self.active_players.remove_if(id, |_, room| room == &session.room_id);
            }
        }
    }

    /// Join a free-practice room. The first occupant waits; the second one
    /// turns the room into a session.
    pub fn join_lobby(&self, room_id: &str, player_id: &str, now: Instant) -> Result<LobbyJoin, SessionError> {
        if self.sessions.contains_key(room_id) {
            return Err(SessionError::RoomExists(room_id.to_string()));
        }

        let mut lobbies = self.lobbies.lock();
        match lobbies.get(room_id) {
            None => {
                lobbies.insert(room_id.to_string(), player_id.to_string());
                debug!(room_id, player_id, "lobby opened");
                Ok(LobbyJoin::Waiting)
            }
            Some(host) if host == player_id => Ok(LobbyJoin::Waiting),
            Some(host) => {
                let host = host.clone();
                self.create(room_id, &host, player_id, now)?;
                lobbies.remove(room_id);
                Ok(LobbyJoin::Ready {
                    room_id: room_id.to_string(),
                    opponent: host,
                })
            }
        }
    }

    /// Leave a lobby before it fills. No-op if the player is not its host.
    pub fn leave_lobby(&self, room_id: &str, player_id: &str) -> bool {
        let mut lobbies = self.lobbies.lock();
        if lobbies.get(room_id).is_some_and(|host| host == player_id) {
            lobbies.remove(room_id);
            return true;
        }
        false
    }

    /// Drop every lobby hosted by a player (disconnect).
    pub fn leave_all_lobbies(&self, player_id: &str) -> usize {
        let mut lobbies = self.lobbies.lock();
        let before = lobbies.len();
        lobbies.retain(|_, host| host != player_id);
        before - lobbies.len()
    }

    /// Sessions that are not settled yet.
    pub(crate) fn unsettled(&self) -> Vec<SessionHandle> {
        self.handles()
            .into_iter()
            .filter(|s| !s.lock().is_settled())
            .collect()
    }

    /// Snapshot of all session handles. Session locks must never be taken
    /// while a map guard is alive, so callers iterate this copy instead.
    fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Remove sessions nobody reported on within the abandon timeout.
    /// No rating changes. Returns the removed room ids.
    pub fn abandon_stale(&self, now: Instant) -> Vec<String> {
        let timeout = self.config.abandon_timeout();
        let mut abandoned = Vec::new();
        for handle in self.handles() {
            let session = handle.lock();
            if session.state != SessionState::Open
                || now.saturating_duration_since(session.created_at) < timeout
            {
                continue;
            }
            self.release_players(&session);
            self.sessions.remove(&session.room_id);
            info!(room_id = %session.room_id, "session abandoned without results");
            abandoned.push(session.room_id.clone());
        }
        abandoned
    }

    /// Remove settled sessions past their retention window.
    pub fn purge_settled(&self, now: Instant) -> usize {
        let retention = self.config.settled_retention();
        let mut purged = 0;
        for handle in self.handles() {
            let room_id = {
                let session = handle.lock();
                let expired = session
                    .settled_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= retention);
                if !expired {
                    continue;
                }
                session.room_id.clone()
            };
            // Settled is terminal, so dropping the lock first is safe
            if self
                .sessions
                .remove_if(&room_id, |_, h| Arc::ptr_eq(h, &handle))
                .is_some()
            {
                purged += 1;
            }
        }
        purged
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

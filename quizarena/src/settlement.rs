//! Settlement coordinator.
//!
//! Turns the two independently-arriving score reports of a room into one
//! outcome. All work on a room happens under that room's session lock, so
//! concurrent or repeated reports for the same room serialize while other
//! rooms proceed in parallel.
//!
//! The rating engine runs once per room: the computed outcome is parked on
//! the session (`pending`) and each side's directory write is marked as it
//! lands. If a write fails, the next report or sweep for that room resumes
//! with the same deltas and only writes the sides still missing.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::directory::{DirectoryError, PlayerDirectory, PlayerId};
use crate::rating::{MatchResult, RatingEngine, RatingSide};
use crate::session::{CpuOpponent, MatchSession, Participant, SessionHandle, SessionStore};

#[cfg(feature = "metrics")]
use crate::metrics::ArenaMetrics;

/// How a session reached settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    /// Both sides reported.
    Reported,
    /// One side reported and the other timed out.
    Forfeit,
    /// Player versus synthetic opponent.
    Cpu,
}

impl SettlementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reported => "reported",
            Self::Forfeit => "forfeit",
            Self::Cpu => "cpu",
        }
    }
}

/// One side of a settled match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideResult {
    /// Player id, or `cpu:<name>` for a synthetic opponent.
    pub participant: String,
    /// Reported score; `None` for a side that forfeited.
    pub score: Option<i64>,
    pub result: MatchResult,
    /// Rating delta computed for this side.
    pub delta: f64,
    /// False for guests and CPU sides: the delta was not persisted.
    pub rating_applied: bool,
    /// Public rating after the update, when it was applied.
    pub rating_after: Option<i32>,
}

/// Authoritative result of a room. Written once per room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementOutcome {
    pub room_id: String,
    /// `None` means a draw.
    pub winner: Option<String>,
    pub sides: [SideResult; 2],
    pub kind: SettlementKind,
    pub settled_at: DateTime<Utc>,
}

impl SettlementOutcome {
    pub fn is_draw(&self) -> bool {
        self.winner.is_none()
    }

    /// This participant's side of the outcome.
    pub fn side(&self, participant: &str) -> Option<&SideResult> {
        self.sides.iter().find(|s| s.participant == participant)
    }

    /// Participants whose rating was left untouched.
    pub fn unrated(&self) -> impl Iterator<Item = &str> {
        self.sides
            .iter()
            .filter(|s| !s.rating_applied)
            .map(|s| s.participant.as_str())
    }
}

/// Response to a score report.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    /// Score recorded; the opponent has not reported yet.
    Waiting { room_id: String },
    /// The room is settled. `cached` is true when this call did not settle
    /// it (duplicate or late report).
    Settled { outcome: SettlementOutcome, cached: bool },
}

impl ReportOutcome {
    pub fn outcome(&self) -> Option<&SettlementOutcome> {
        match self {
            Self::Waiting { .. } => None,
            Self::Settled { outcome, .. } => Some(outcome),
        }
    }
}

/// A single-sided report for a player-vs-CPU match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuMatchReport {
    /// Idempotency key: retries with the same id return the first outcome.
    pub match_id: String,
    pub player_id: PlayerId,
    pub player_score: i64,
    pub opponent: CpuOpponent,
    pub opponent_score: i64,
}

/// Settlement errors.
#[derive(Debug, Error)]
pub enum SettleError {
    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("player {player_id} is not in room {room_id}")]
    PlayerNotInRoom { room_id: String, player_id: PlayerId },

    #[error("room {0} is a cpu match")]
    CpuMatch(String),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
}

/// Settlement coordinator.
pub struct SettlementCoordinator {
    sessions: Arc<SessionStore>,
    directory: Arc<dyn PlayerDirectory>,
    engine: RatingEngine,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<ArenaMetrics>>,
}

impl SettlementCoordinator {
    pub fn new(sessions: Arc<SessionStore>, directory: Arc<dyn PlayerDirectory>, engine: RatingEngine) -> Self {
        Self {
            sessions,
            directory,
            engine,
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

    pub fn engine(&self) -> &RatingEngine {
        &self.engine
    }

    /// Record a side's score and settle the room once both are in.
    pub fn report_result(&self, room_id: &str, player_id: &str, score: i64) -> Result<ReportOutcome, SettleError> {
        self.report_result_at(room_id, player_id, score, Instant::now())
    }

    pub fn report_result_at(
        &self,
        room_id: &str,
        player_id: &str,
        score: i64,
        now: Instant,
    ) -> Result<ReportOutcome, SettleError> {
        let handle = self.sessions.get(room_id).ok_or_else(|| {
            debug!(room_id, player_id, "report for unknown room ignored");
            SettleError::RoomNotFound(room_id.to_string())
        })?;

        let mut session = handle.lock();

        let side = session
            .side_of(player_id)
            .ok_or_else(|| SettleError::PlayerNotInRoom {
                room_id: room_id.to_string(),
                player_id: player_id.to_string(),
            })?;

        if session.has_cpu() {
            return Err(SettleError::CpuMatch(room_id.to_string()));
        }

        if let Some(outcome) = &session.outcome {
            debug!(room_id, player_id, "room already settled, returning cached outcome");
            self.record_duplicate();
            return Ok(ReportOutcome::Settled {
                outcome: outcome.clone(),
                cached: true,
            });
        }

        // Past the deadline the silent side has already lost; a late score
        // does not reopen the match
        if session.forfeit_due(now, self.sessions.config().forfeit_timeout()) {
            info!(room_id, player_id, "report after forfeit deadline, settling as forfeit");
            let outcome = self.settle(&mut session, SettlementKind::Forfeit, now)?;
            return Ok(ReportOutcome::Settled { outcome, cached: false });
        }

        if !session.record_score(side, score, now) {
            debug!(room_id, player_id, "duplicate report, keeping first score");
            self.record_duplicate();
        }

        if !session.both_reported() {
            debug!(room_id, player_id, score, "waiting for opponent");
            return Ok(ReportOutcome::Waiting {
                room_id: room_id.to_string(),
            });
        }

        let outcome = self.settle(&mut session, SettlementKind::Reported, now)?;
        Ok(ReportOutcome::Settled { outcome, cached: false })
    }

    /// Settle a player-vs-CPU match. Retries with the same `match_id`
    /// return the first outcome without touching ratings again.
    pub fn settle_cpu(&self, report: &CpuMatchReport) -> Result<ReportOutcome, SettleError> {
        self.settle_cpu_at(report, Instant::now())
    }

    pub fn settle_cpu_at(&self, report: &CpuMatchReport, now: Instant) -> Result<ReportOutcome, SettleError> {
        if let Some(outcome) = self.sessions.cpu_outcome(&report.match_id) {
            return self.cached_cpu(report, outcome);
        }

        let handle = self
            .sessions
            .get_or_create_cpu(&report.match_id, &report.player_id, &report.opponent, now);
        let mut session = handle.lock();

        // The session may have been purged and recreated since the check above
        if let Some(outcome) = self.sessions.cpu_outcome(&report.match_id) {
            if !session.is_settled() {
                session.mark_settled(outcome.clone(), now);
            }
            return self.cached_cpu(report, outcome);
        }

        if session.side_of(&report.player_id) != Some(0) || !session.has_cpu() {
            return Err(SettleError::PlayerNotInRoom {
                room_id: report.match_id.clone(),
                player_id: report.player_id.clone(),
            });
        }

        if let Some(outcome) = session.outcome.clone() {
            return self.cached_cpu(report, outcome);
        }

        session.record_score(0, report.player_score, now);
        session.record_score(1, report.opponent_score, now);

        let outcome = self.settle(&mut session, SettlementKind::Cpu, now)?;
        Ok(ReportOutcome::Settled { outcome, cached: false })
    }

    fn cached_cpu(&self, report: &CpuMatchReport, outcome: SettlementOutcome) -> Result<ReportOutcome, SettleError> {
        if outcome.sides[0].participant != report.player_id {
            return Err(SettleError::PlayerNotInRoom {
                room_id: report.match_id.clone(),
                player_id: report.player_id.clone(),
            });
        }
        debug!(match_id = %report.match_id, "cpu match already settled");
        self.record_duplicate();
        Ok(ReportOutcome::Settled { outcome, cached: true })
    }

    /// Forfeit every half-reported session past its timeout and retry
    /// sessions whose directory writes failed earlier.
    pub fn sweep_forfeits(&self, now: Instant) -> Vec<SettlementOutcome> {
        let timeout = self.sessions.config().forfeit_timeout();
        let mut settled = Vec::new();

        for handle in self.sessions.unsettled() {
            match self.sweep_one(&handle, now, timeout) {
                Ok(Some(outcome)) => settled.push(outcome),
                Ok(None) => {}
                Err(e) => {
                    let room_id = handle.lock().room_id.clone();
                    warn!(room_id = %room_id, error = %e, "settlement retry failed");
                }
            }
        }
        settled
    }

    fn sweep_one(
        &self,
        handle: &SessionHandle,
        now: Instant,
        timeout: std::time::Duration,
    ) -> Result<Option<SettlementOutcome>, SettleError> {
        let mut session = handle.lock();
        if session.is_settled() {
            return Ok(None);
        }

        if session.pending.is_some() {
            let kind = session
                .pending
                .as_ref()
                .map(|p| p.kind)
                .unwrap_or(SettlementKind::Reported);
            return self.settle(&mut session, kind, now).map(Some);
        }

        // both in but the first settle attempt failed before computing
        if session.both_reported() {
            let kind = if session.has_cpu() {
                SettlementKind::Cpu
            } else {
                SettlementKind::Reported
            };
            return self.settle(&mut session, kind, now).map(Some);
        }

        if session.forfeit_due(now, timeout) {
            info!(room_id = %session.room_id, "opponent silent past timeout, forfeiting");
            return self.settle(&mut session, SettlementKind::Forfeit, now).map(Some);
        }

        Ok(None)
    }

    /// Compute (once) and persist (side by side) the room's outcome.
    /// Caller holds the session lock.
    fn settle(&self, session: &mut MatchSession, kind: SettlementKind, now: Instant) -> Result<SettlementOutcome, SettleError> {
        let mut outcome = match session.pending.take() {
            Some(pending) => pending,
            None => self.compute(session, kind)?,
        };

        for i in 0..2 {
            if session.applied[i] || !outcome.sides[i].rating_applied {
                continue;
            }
            let Some(player_id) = session.participants[i].player_id() else {
                continue;
            };
            let side = &outcome.sides[i];
            match self.directory.apply_match_result(player_id, side.delta, side.result) {
                Ok(player) => {
                    outcome.sides[i].rating_after = Some(player.rating);
                    session.applied[i] = true;
                }
                Err(e) => {
                    warn!(room_id = %session.room_id, player_id, error = %e, "rating update failed, will retry");
                    session.pending = Some(outcome);
                    return Err(e.into());
                }
            }
        }

        for guest in outcome.unrated() {
            if !guest.starts_with("cpu:") {
                warn!(room_id = %session.room_id, participant = guest, "guest side excluded from rating");
            }
        }

        self.sessions.release_players(session);
        if session.has_cpu() {
            self.sessions.record_cpu_outcome(&outcome);
        }
        session.mark_settled(outcome.clone(), now);
        self.record_settlement(&outcome);

        info!(
            room_id = %outcome.room_id,
            kind = outcome.kind.as_str(),
            winner = outcome.winner.as_deref().unwrap_or("draw"),
            delta_a = outcome.sides[0].delta,
            delta_b = outcome.sides[1].delta,
            "match settled"
        );
        Ok(outcome)
    }

    /// Run the rating engine for a session. Only called when no pending
    /// outcome exists, so it runs once per room.
    fn compute(&self, session: &MatchSession, kind: SettlementKind) -> Result<SettlementOutcome, SettleError> {
        let result_a = match kind {
            SettlementKind::Forfeit => match session.sole_reporter() {
                Some(0) => MatchResult::Won,
                _ => MatchResult::Lost,
            },
            SettlementKind::Reported | SettlementKind::Cpu => {
                MatchResult::from_scores(session.scores[0].unwrap_or(0), session.scores[1].unwrap_or(0))
            }
        };

        let mut sides = Vec::with_capacity(2);
        let mut registered = [false; 2];
        for (i, participant) in session.participants.iter().enumerate() {
            let score = session.scores[i].unwrap_or(0);
            let side = match participant {
                Participant::Player(id) => match self.directory.get_player(id)? {
                    Some(p) => {
                        registered[i] = true;
                        RatingSide::new(p.internal_rating, score, p.current_streak)
                    }
                    None => RatingSide::new(self.engine.config().unrated_rating, score, 0),
                },
                Participant::Cpu(cpu) => RatingSide::new(cpu.rating, score, 0),
            };
            sides.push(side);
        }

        let delta = self.engine.compute_with_result(sides[0], sides[1], result_a);
        let results = [result_a, result_a.opposite()];
        let deltas = [delta.a, delta.b];

        let side_result = |i: usize| SideResult {
            participant: session.participants[i].id(),
            score: session.scores[i],
            result: results[i],
            delta: deltas[i],
            rating_applied: registered[i],
            rating_after: None,
        };

        let winner = match result_a {
            MatchResult::Won => Some(session.participants[0].id()),
            MatchResult::Lost => Some(session.participants[1].id()),
            MatchResult::Drew => None,
        };

        Ok(SettlementOutcome {
            room_id: session.room_id.clone(),
            winner,
            sides: [side_result(0), side_result(1)],
            kind,
            settled_at: Utc::now(),
        })
    }

    #[cfg(feature = "metrics")]
    fn record_settlement(&self, outcome: &SettlementOutcome) {
        if let Some(ref m) = self.metrics {
            m.record_settlement(outcome);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_settlement(&self, _outcome: &SettlementOutcome) {}

    #[cfg(feature = "metrics")]
    fn record_duplicate(&self) {
        if let Some(ref m) = self.metrics {
            m.duplicate_reports_total.inc();
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_duplicate(&self) {}
}

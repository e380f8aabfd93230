//! Prometheus metrics for the match engine.
//!
//! # Example
//!
//! ```rust,ignore
//! use quizarena::metrics::ArenaMetrics;
//!
//! let metrics = ArenaMetrics::new()?;
//! metrics.queue_size.set(4);
//!
//! // Prometheus text format
//! let output = metrics.gather();
//! ```

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::settlement::SettlementOutcome;

/// Match engine metrics.
#[derive(Clone)]
pub struct ArenaMetrics {
    registry: Registry,

    // Queue
    /// Players currently waiting.
    pub queue_size: IntGauge,
    /// Pairings made by the queue.
    pub pairings_total: IntCounter,

    // Settlement
    /// Settlements by kind (reported, forfeit, cpu).
    pub settlements_total: IntCounterVec,
    /// Reports that arrived after their room settled.
    pub duplicate_reports_total: IntCounter,
    /// Sessions dropped before anyone reported.
    pub abandoned_sessions_total: IntCounter,
    /// Applied rating deltas.
    pub rating_delta: Histogram,

    // Seasons
    /// Rollover calls by status.
    pub rollovers_total: IntCounterVec,
}

impl ArenaMetrics {
    /// Create a metrics instance with every metric registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let queue_size = IntGauge::new("quizarena_queue_size", "Players waiting in the ranked queue")?;
        registry.register(Box::new(queue_size.clone()))?;

        let pairings_total = IntCounter::new("quizarena_pairings_total", "Pairings made by the queue")?;
        registry.register(Box::new(pairings_total.clone()))?;

        let settlements_total = IntCounterVec::new(
            Opts::new("quizarena_settlements_total", "Settled matches"),
            &["kind"],
        )?;
        registry.register(Box::new(settlements_total.clone()))?;

        let duplicate_reports_total = IntCounter::new(
            "quizarena_duplicate_reports_total",
            "Reports for rooms that were already settled",
        )?;
        registry.register(Box::new(duplicate_reports_total.clone()))?;

        let abandoned_sessions_total = IntCounter::new(
            "quizarena_abandoned_sessions_total",
            "Sessions dropped with no report",
        )?;
        registry.register(Box::new(abandoned_sessions_total.clone()))?;

        let rating_delta = Histogram::with_opts(
            HistogramOpts::new("quizarena_rating_delta", "Applied rating deltas")
                .buckets(vec![-48.0, -32.0, -16.0, -8.0, 0.0, 8.0, 16.0, 32.0, 48.0, 64.0]),
        )?;
        registry.register(Box::new(rating_delta.clone()))?;

        let rollovers_total = IntCounterVec::new(
            Opts::new("quizarena_rollovers_total", "Season rollover calls"),
            &["status"],
        )?;
        registry.register(Box::new(rollovers_total.clone()))?;

        Ok(Self {
            registry,
            queue_size,
            pairings_total,
            settlements_total,
            duplicate_reports_total,
            abandoned_sessions_total,
            rating_delta,
            rollovers_total,
        })
    }

    /// Gather all metrics in Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Record a fresh settlement.
    pub fn record_settlement(&self, outcome: &SettlementOutcome) {
        self.settlements_total
            .with_label_values(&[outcome.kind.as_str()])
            .inc();
        for side in outcome.sides.iter().filter(|s| s.rating_applied) {
            self.rating_delta.observe(side.delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rating::MatchResult;
    use crate::settlement::{SettlementKind, SideResult};
    use chrono::Utc;

    #[test]
    fn test_metrics_creation() {
        let metrics = ArenaMetrics::new().unwrap();
        metrics.queue_size.set(5);
        metrics.pairings_total.inc_by(2);

        let output = metrics.gather();
        assert!(output.contains("quizarena_queue_size 5"));
        assert!(output.contains("quizarena_pairings_total 2"));
    }

    #[test]
    fn test_record_settlement() {
        let metrics = ArenaMetrics::new().unwrap();
        let side = |id: &str, result, delta, applied| SideResult {
            participant: id.to_string(),
            score: Some(3),
            result,
            delta,
            rating_applied: applied,
            rating_after: None,
        };
        let outcome = SettlementOutcome {
            room_id: "r1".into(),
            winner: Some("a".into()),
            sides: [side("a", MatchResult::Won, 18.0, true), side("guest", MatchResult::Lost, -16.0, false)],
            kind: SettlementKind::Reported,
            settled_at: Utc::now(),
        };
        metrics.record_settlement(&outcome);

        let output = metrics.gather();
        assert!(output.contains("quizarena_settlements_total{kind=\"reported\"} 1"));
        assert!(output.contains("quizarena_rating_delta_count 1"));
    }
}

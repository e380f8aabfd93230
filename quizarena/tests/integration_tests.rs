//! Integration tests for quizarena

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use quizarena::directory::DirectoryError;
use quizarena::{
    Arena, ArenaError, MatchResult, MemoryDirectory, MemoryRewardSink, Player, PlayerDirectory, ReportOutcome,
    RolloverStatus,
};

/// Directory that counts rating writes and can be told to fail them.
struct CountingDirectory {
    inner: MemoryDirectory,
    applies: AtomicUsize,
    fail_for: Mutex<Option<String>>,
}

impl CountingDirectory {
    fn with_players(ids: &[(&str, f64)]) -> Arc<Self> {
        let inner = MemoryDirectory::new();
        for (id, rating) in ids {
            inner.insert(Player::new(*id, *id, *rating));
        }
        Arc::new(Self {
            inner,
            applies: AtomicUsize::new(0),
            fail_for: Mutex::new(None),
        })
    }

    fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    fn fail_writes_for(&self, id: Option<&str>) {
        *self.fail_for.lock() = id.map(str::to_string);
    }
}

impl PlayerDirectory for CountingDirectory {
    fn get_player(&self, id: &str) -> Result<Option<Player>, DirectoryError> {
        self.inner.get_player(id)
    }

    fn apply_match_result(&self, id: &str, delta: f64, result: MatchResult) -> Result<Player, DirectoryError> {
        if self.fail_for.lock().as_deref() == Some(id) {
            return Err(DirectoryError::Backend("connection reset".into()));
        }
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.inner.apply_match_result(id, delta, result)
    }

    fn list_top_by_rating(&self, n: usize, exclude_banned: bool) -> Result<Vec<Player>, DirectoryError> {
        self.inner.list_top_by_rating(n, exclude_banned)
    }

    fn reset_ratings(&self, baseline: f64) -> Result<usize, DirectoryError> {
        self.inner.reset_ratings(baseline)
    }
}

fn numbered_players(count: usize) -> Vec<(String, f64)> {
    (0..count)
        .map(|i| (format!("p{i:03}"), 1300.0 + (i % 7) as f64 * 40.0))
        .collect()
}

fn directory_for(players: &[(String, f64)]) -> Arc<CountingDirectory> {
    let ids: Vec<(&str, f64)> = players.iter().map(|(id, r)| (id.as_str(), *r)).collect();
    CountingDirectory::with_players(&ids)
}

/// Concurrent reports for the same room
#[test]
fn test_concurrent_reports_settle_once() {
    let players = numbered_players(40);
    let directory = directory_for(&players);
    let arena = Arena::builder(directory.clone()).build();

    for (round, pair) in players.chunks(2).enumerate() {
        let room = format!("room-{round}");
        let (a, b) = (pair[0].0.as_str(), pair[1].0.as_str());
        arena.sessions().create(&room, a, b, Instant::now()).unwrap();

        let barrier = Barrier::new(2);
        let results: Vec<ReportOutcome> = std::thread::scope(|s| {
            let handles: Vec<_> = [(a, 9), (b, 4)]
                .into_iter()
                .map(|(player, score)| {
                    let (arena, barrier, room) = (&arena, &barrier, &room);
                    s.spawn(move || {
                        barrier.wait();
                        arena.report_result(room, player, score).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let waiting = results
            .iter()
            .filter(|r| matches!(r, ReportOutcome::Waiting { .. }))
            .count();
        let fresh = results
            .iter()
            .filter(|r| matches!(r, ReportOutcome::Settled { cached: false, .. }))
            .count();
        assert_eq!((waiting, fresh), (1, 1), "round {round}");
        assert_eq!(directory.applies(), (round + 1) * 2);
    }
}

/// Duplicate reports after settlement
#[test]
fn test_duplicate_reports_never_reapply() {
    let directory = CountingDirectory::with_players(&[("alice", 1500.0), ("bob", 1500.0)]);
    let arena = Arena::builder(directory.clone()).build();
    arena.sessions().create("r1", "alice", "bob", Instant::now()).unwrap();

    arena.report_result("r1", "alice", 7).unwrap();
    let settled = arena.report_result("r1", "bob", 7).unwrap();
    let outcome = settled.outcome().unwrap().clone();
    assert!(outcome.is_draw());
    assert_eq!(directory.applies(), 2);

    let barrier = Barrier::new(8);
    std::thread::scope(|s| {
        for i in 0..8 {
            let (arena, barrier, outcome) = (&arena, &barrier, &outcome);
            s.spawn(move || {
                barrier.wait();
                let player = if i % 2 == 0 { "alice" } else { "bob" };
                match arena.report_result("r1", player, 100).unwrap() {
                    ReportOutcome::Settled { outcome: cached, cached: true } => assert_eq!(&cached, outcome),
                    other => panic!("expected cached outcome, got {other:?}"),
                }
            });
        }
    });

    assert_eq!(directory.applies(), 2);
}

/// Independent rooms settle in parallel
#[test]
fn test_parallel_rooms_all_settle() {
    let players = numbered_players(60);
    let directory = directory_for(&players);
    let arena = Arena::builder(directory.clone()).build();

    let rooms: Vec<(String, &str, &str)> = players
        .chunks(2)
        .enumerate()
        .map(|(i, pair)| (format!("room-{i}"), pair[0].0.as_str(), pair[1].0.as_str()))
        .collect();
    for (room, a, b) in &rooms {
        arena.sessions().create(room, a, b, Instant::now()).unwrap();
    }

    std::thread::scope(|s| {
        for (room, a, b) in &rooms {
            for (player, score) in [(*a, 3), (*b, 5)] {
                let arena = &arena;
                s.spawn(move || arena.report_result(room, player, score).unwrap());
            }
        }
    });

    assert_eq!(directory.applies(), rooms.len() * 2);
    for (room, a, b) in &rooms {
        let session = arena.sessions().get(room).unwrap();
        let outcome = session.lock().outcome.clone().unwrap();
        assert_eq!(outcome.winner.as_deref(), Some(*b));
        assert!(!arena.sessions().is_in_match(a));
    }
}

/// A failed directory write resumes with the same deltas
#[test]
fn test_failed_write_resumes_without_double_apply() {
    let directory = CountingDirectory::with_players(&[("alice", 1500.0), ("bob", 1500.0)]);
    let arena = Arena::builder(directory.clone()).build();
    arena.sessions().create("r1", "alice", "bob", Instant::now()).unwrap();

    directory.fail_writes_for(Some("bob"));
    arena.report_result("r1", "alice", 8).unwrap();
    let err = arena.report_result("r1", "bob", 2).unwrap_err();
    assert!(matches!(err, ArenaError::Settle(_)));
    assert!(!err.is_benign());
    assert_eq!(directory.applies(), 1);

    directory.fail_writes_for(None);
    let report = arena.sweep();
    assert_eq!(report.settled.len(), 1);
    let outcome = &report.settled[0];
    assert_eq!(directory.applies(), 2);

    let alice = directory.get_player("alice").unwrap().unwrap();
    let bob = directory.get_player("bob").unwrap().unwrap();
    assert!((alice.internal_rating - (1500.0 + outcome.sides[0].delta)).abs() < 1e-9);
    assert!((bob.internal_rating - (1500.0 + outcome.sides[1].delta)).abs() < 1e-9);
    assert_eq!(alice.wins, 1);
    assert_eq!(bob.losses, 1);

    let again = arena.report_result("r1", "bob", 2).unwrap();
    assert!(matches!(again, ReportOutcome::Settled { cached: true, .. }));
    assert_eq!(directory.applies(), 2);
}

/// Rollover twice for the same season
#[test]
fn test_double_rollover() {
    let players = numbered_players(14);
    let directory = directory_for(&players);
    directory.inner.set_banned("p003", true);
    let sink = Arc::new(MemoryRewardSink::new());
    let arena = Arena::builder(directory.clone()).reward_sink(sink.clone()).build();

    let first = arena.rollover_season(202610).unwrap();
    let second = arena.rollover_season(202610).unwrap();
    assert_eq!(first.status, RolloverStatus::Closed);
    assert_eq!(second.status, RolloverStatus::AlreadyClosed);
    assert!(first.snapshot_written);
    assert!(!second.snapshot_written);

    assert_eq!(sink.grants().len(), 10);
    let record = arena.season_record(202610).unwrap().unwrap();
    assert_eq!(record.snapshot.len(), 13);
    assert!(record.snapshot.iter().all(|e| e.player_id != "p003"));
    assert!(arena.seasons().record(202609).unwrap().is_none());

    for p in directory.list_top_by_rating(100, true).unwrap() {
        assert_eq!(p.rating, 1500);
        assert_eq!(p.internal_rating, 1500.0);
        assert_eq!((p.wins, p.losses, p.current_streak, p.best_streak), (0, 0, 0, 0));
    }
}

/// Scheduled and manual rollover racing
#[test]
fn test_racing_rollovers() {
    let players = numbered_players(30);
    let directory = directory_for(&players);
    let sink = Arc::new(MemoryRewardSink::new());
    let arena = Arena::builder(directory).reward_sink(sink.clone()).build();

    let barrier = Barrier::new(6);
    std::thread::scope(|s| {
        for _ in 0..6 {
            let (arena, barrier) = (&arena, &barrier);
            s.spawn(move || {
                barrier.wait();
                arena.trigger_rollover().unwrap();
            });
        }
    });

    let season = arena.season_code();
    let total: u64 = sink.grants().iter().map(|g| g.amount).sum();
    assert_eq!(sink.grants().len(), 10);
    assert_eq!(total, 1000 + 700 + 500 + 7 * 100);
    assert!(sink.grants().iter().all(|g| g.season == season));
    assert!(arena.season_record(season).unwrap().unwrap().closed);
}

/// Background sweeper pairs waiting players
#[tokio::test]
async fn test_sweeper_pairs_players() {
    let directory = CountingDirectory::with_players(&[("alice", 1500.0), ("bob", 1480.0)]);
    let arena = Arc::new(Arena::builder(directory).build());

    let paired = Arc::new(AtomicUsize::new(0));
    let counter = paired.clone();
    arena.on_pair(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    arena.enqueue("alice").unwrap();
    arena.enqueue("bob").unwrap();

    let sweeper = arena.clone().spawn_sweeper(Duration::from_millis(10));
    for _ in 0..200 {
        if paired.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    sweeper.abort();

    assert_eq!(paired.load(Ordering::SeqCst), 1);
    let pairings = arena.drain_pairings();
    assert_eq!(pairings.len(), 1);
    assert!(arena.sessions().is_in_match("alice"));
    assert!(arena.queue_stats().waiting == 0);
}

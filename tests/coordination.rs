//! Leader election, heartbeats, and watermark replay across replicas.

mod fixtures;

use std::sync::Arc;

use echovault::coord::{BroadcastHub, Coordinator};
use echovault::core::{EventPayload, ReplicaId, Seq0, StoreName};
use echovault::eventlog::{EventBus, EventLog, EventSink};
use echovault::sched::CancellationToken;
use echovault::{Clock, ManualTimeSource, TimeSource};

use fixtures::fast_limits;

struct Cluster {
    time: Arc<ManualTimeSource>,
    replicas: Vec<Replica>,
}

struct Replica {
    coordinator: Coordinator,
    log: EventLog,
    sink: EventSink,
}

impl Cluster {
    fn new(size: usize) -> Self {
        let time = Arc::new(ManualTimeSource::at(1_000_000));
        let hub = BroadcastHub::new(256);
        let mut replicas = Vec::new();
        for _ in 0..size {
            let replica_id = ReplicaId::random();
            let endpoint = hub.register(replica_id).unwrap();
            let time_dyn: Arc<dyn echovault::TimeSource> = time.clone();
            let clock = Arc::new(Clock::new(time_dyn));
            let log = EventLog::new(replica_id, 10_000);
            let sink = EventSink::new(log.clone(), EventBus::new(32));
            let coordinator =
                Coordinator::new(endpoint, clock, fast_limits(), log.clone(), sink.clone());
            replicas.push(Replica {
                coordinator,
                log,
                sink,
            });
        }
        Self { time, replicas }
    }

    fn start_all(&self) {
        for replica in &self.replicas {
            replica.coordinator.start();
        }
    }

    /// Deliver messages and tick until quiescent.
    fn settle(&self) {
        for _ in 0..20 {
            for replica in &self.replicas {
                replica.coordinator.pump();
                replica.coordinator.tick();
            }
        }
    }

    fn advance(&self, ms: u64) {
        self.time.advance(ms);
        self.settle();
    }

    fn leaders(&self) -> Vec<usize> {
        self.replicas
            .iter()
            .enumerate()
            .filter(|(_, r)| r.coordinator.is_primary())
            .map(|(i, _)| i)
            .collect()
    }
}

fn payload(n: u64) -> EventPayload {
    EventPayload::StorageUpdated {
        store: StoreName::Streams,
        key: Some(format!("k{n}")),
        count: None,
    }
}

#[test]
fn exactly_one_leader_at_steady_state() {
    let cluster = Cluster::new(4);
    cluster.start_all();
    cluster.settle();
    // Let the claim-ack window expire and heartbeats flow.
    cluster.advance(fast_limits().claim_ack_timeout_ms + 100);
    cluster.advance(fast_limits().heartbeat_interval_ms * 2);

    assert_eq!(cluster.leaders().len(), 1, "expected a unique leader");
}

#[test]
fn follower_replays_to_leader_watermark() {
    let cluster = Cluster::new(2);
    cluster.start_all();
    cluster.advance(fast_limits().claim_ack_timeout_ms + 100);
    let leaders = cluster.leaders();
    assert_eq!(leaders.len(), 1);
    let leader = leaders[0];
    let follower = 1 - leader;

    // The leader produces 12 events; the follower applies the first 5
    // out-of-band (its watermark sits at 5).
    for n in 1..=12u64 {
        cluster.replicas[leader]
            .log
            .append(payload(n), cluster.time.now_ms())
            .unwrap();
    }
    {
        let coordinator = &cluster.replicas[follower].coordinator;
        // Simulate having already applied 1..=5 from an earlier session.
        let events = match cluster.replicas[leader].log.read_from(Seq0::ZERO).unwrap() {
            echovault::eventlog::ReadOutcome::Events(events) => events,
            other => panic!("unexpected: {other:?}"),
        };
        for event in events.iter().take(5) {
            // Delivered through the replay path one by one.
            coordinator.handle(echovault::coord::Envelope {
                from: cluster.replicas[leader].coordinator.replica(),
                message: echovault::coord::CoordMessage::ReplayResponse {
                    to: coordinator.replica(),
                    events: vec![event.clone()],
                    compacted: false,
                    compacted_through: Seq0::ZERO,
                },
            });
        }
        assert_eq!(coordinator.applied_watermark().get(), 5);
    }

    // Heartbeat carries the watermark; the follower requests replay from
    // 6 and converges at 12.
    cluster.advance(fast_limits().heartbeat_interval_ms + 100);
    cluster.settle();

    assert_eq!(
        cluster.replicas[follower]
            .coordinator
            .applied_watermark()
            .get(),
        12
    );
}

#[test]
fn replayed_events_reach_the_local_bus_in_order() {
    let cluster = Cluster::new(2);
    cluster.start_all();
    cluster.advance(fast_limits().claim_ack_timeout_ms + 100);
    let leader = cluster.leaders()[0];
    let follower = 1 - leader;

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_sub = Arc::clone(&seen);
    let _sub = cluster.replicas[follower]
        .sink
        .bus()
        .subscribe(None, move |event| {
            seen_sub.lock().unwrap().push(event.seq.get());
        })
        .unwrap();

    for n in 1..=7u64 {
        cluster.replicas[leader]
            .log
            .append(payload(n), cluster.time.now_ms())
            .unwrap();
    }
    cluster.advance(fast_limits().heartbeat_interval_ms + 100);
    cluster.settle();

    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn follower_watermark_never_decreases() {
    let cluster = Cluster::new(2);
    cluster.start_all();
    cluster.advance(fast_limits().claim_ack_timeout_ms + 100);
    let leader = cluster.leaders()[0];
    let follower = 1 - leader;

    for n in 1..=6u64 {
        cluster.replicas[leader]
            .log
            .append(payload(n), cluster.time.now_ms())
            .unwrap();
    }
    cluster.advance(fast_limits().heartbeat_interval_ms + 100);
    let high = cluster.replicas[follower]
        .coordinator
        .applied_watermark()
        .get();
    assert_eq!(high, 6);

    // A stale replay response for an older range must not move it back.
    let events = match cluster.replicas[leader].log.read_from(Seq0::ZERO).unwrap() {
        echovault::eventlog::ReadOutcome::Events(events) => events,
        other => panic!("unexpected: {other:?}"),
    };
    cluster.replicas[follower].coordinator.handle(echovault::coord::Envelope {
        from: cluster.replicas[leader].coordinator.replica(),
        message: echovault::coord::CoordMessage::ReplayResponse {
            to: cluster.replicas[follower].coordinator.replica(),
            events: events[..3].to_vec(),
            compacted: false,
            compacted_through: Seq0::ZERO,
        },
    });
    assert_eq!(
        cluster.replicas[follower]
            .coordinator
            .applied_watermark()
            .get(),
        high
    );
}

#[test]
fn stale_leader_triggers_reelection() {
    let mut cluster = Cluster::new(3);
    cluster.start_all();
    cluster.advance(fast_limits().claim_ack_timeout_ms + 100);
    let first = cluster.leaders()[0];

    // Crash the leader: dropping it stops its heartbeats entirely.
    cluster.replicas.remove(first);
    cluster.advance(fast_limits().stale_connection_threshold_ms + 100);
    cluster.advance(fast_limits().claim_ack_timeout_ms + 100);

    assert_eq!(cluster.leaders().len(), 1, "a follower should have taken over");
}

#[test]
fn logout_hands_off_leadership() {
    let cluster = Cluster::new(2);
    cluster.start_all();
    cluster.advance(fast_limits().claim_ack_timeout_ms + 100);
    let leader = cluster.leaders()[0];
    let follower = 1 - leader;

    cluster.replicas[leader].coordinator.resign();
    // During the handoff window the outgoing leader defers new writes.
    assert!(!cluster.replicas[leader].coordinator.writes_admitted());

    cluster.settle();
    cluster.advance(fast_limits().claim_ack_timeout_ms + 100);

    assert!(cluster.replicas[follower].coordinator.is_primary());
    assert!(cluster.replicas[follower].coordinator.writes_admitted());
}

#[test]
fn compacted_replay_resets_follower_floor() {
    let cluster = Cluster::new(2);
    cluster.start_all();
    cluster.advance(fast_limits().claim_ack_timeout_ms + 100);
    let leader = cluster.leaders()[0];
    let follower = 1 - leader;

    for n in 1..=10u64 {
        cluster.replicas[leader]
            .log
            .append(payload(n), cluster.time.now_ms())
            .unwrap();
    }
    // Retention outran the follower.
    cluster.replicas[leader]
        .log
        .compact_through(Seq0::new(6))
        .unwrap();

    cluster.advance(fast_limits().heartbeat_interval_ms + 100);
    cluster.settle();

    // The follower reset to the compaction floor and caught up from there.
    assert_eq!(
        cluster.replicas[follower]
            .coordinator
            .applied_watermark()
            .get(),
        10
    );
}

#[test]
fn aborted_replay_is_never_applied() {
    let cluster = Cluster::new(2);
    cluster.start_all();
    cluster.advance(fast_limits().claim_ack_timeout_ms + 100);
    let leader = cluster.leaders()[0];
    let follower = 1 - leader;

    for n in 1..=4u64 {
        cluster.replicas[leader]
            .log
            .append(payload(n), cluster.time.now_ms())
            .unwrap();
    }

    let token = CancellationToken::new();
    cluster.replicas[follower]
        .coordinator
        .request_replay(token.clone());
    token.cancel();

    // Deliver the response after the abort.
    cluster.replicas[leader].coordinator.pump();
    cluster.replicas[follower].coordinator.pump();

    assert_eq!(
        cluster.replicas[follower]
            .coordinator
            .applied_watermark()
            .get(),
        0
    );
}

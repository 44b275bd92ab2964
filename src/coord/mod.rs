//! Tab coordinator: leader election, heartbeats, and watermark replay.
//!
//! Each replica runs one `Coordinator` attached to the broadcast hub. The
//! machine is driven by `pump()` (delivering queued messages) and
//! `tick()` (time-based transitions), which keeps every election and
//! replay path deterministic under a manual time source.

pub mod bus;
pub mod locks;

pub use bus::{BroadcastHub, Candidacy, CoordMessage, Envelope, HubEndpoint};
pub use locks::{AcquireOptions, LockError, LockGuard, LockLevel, LockManager};

use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::config::Limits;
use crate::core::clock::{Clock, Stamp};
use crate::core::{Event, ReplicaId, Seq0, Seq1, Watermarks};
use crate::eventlog::{EventLog, EventSink, ReadOutcome};
use crate::sched::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Waiting out the claim-ack window.
    Candidate,
    Leader,
    Follower { leader: ReplicaId },
}

impl Role {
    pub fn is_primary(self) -> bool {
        matches!(self, Role::Leader)
    }
}

struct CoordState {
    role: Role,
    candidacy: Candidacy,
    claim_deadline_ms: u64,
    /// Best claim seen this election, including our own.
    best_claim: Candidacy,
    last_heartbeat_rx_ms: u64,
    last_heartbeat_tx_ms: u64,
    last_watermark_tx_ms: u64,
    /// Highest leader-published watermark we know of.
    leader_watermark: Seq0,
    /// Per-producer applied watermarks. Sequences are scoped to the
    /// producing replica, so a leader change never replays old numbers.
    applied: Watermarks,
    /// The producer whose stream we currently follow.
    producer: Option<ReplicaId>,
    /// Abort token for the in-flight replay request, if any.
    replay_abort: Option<CancellationToken>,
    /// Leader drains writes until this instant during handoff.
    quiesce_until_ms: u64,
}

/// Per-replica coordination agent.
pub struct Coordinator {
    replica: ReplicaId,
    endpoint: HubEndpoint,
    clock: Arc<Clock>,
    limits: Limits,
    /// Leader-side source of replayable events.
    log: EventLog,
    /// Follower-side delivery of replayed events.
    sink: EventSink,
    state: Mutex<CoordState>,
}

impl Coordinator {
    pub fn new(
        endpoint: HubEndpoint,
        clock: Arc<Clock>,
        limits: Limits,
        log: EventLog,
        sink: EventSink,
    ) -> Self {
        let replica = endpoint.replica;
        let now = clock.now_ms();
        let candidacy = Candidacy::new(
            clock.tick(),
            rand::thread_rng().gen_range(0..16),
            replica,
        );
        Self {
            replica,
            endpoint,
            clock,
            limits: limits.clone(),
            log,
            sink,
            state: Mutex::new(CoordState {
                role: Role::Candidate,
                candidacy,
                claim_deadline_ms: now + limits.claim_ack_timeout_ms,
                best_claim: candidacy,
                last_heartbeat_rx_ms: now,
                last_heartbeat_tx_ms: 0,
                last_watermark_tx_ms: 0,
                leader_watermark: Seq0::ZERO,
                applied: Watermarks::new(),
                producer: None,
                replay_abort: None,
                quiesce_until_ms: 0,
            }),
        }
    }

    /// Announce candidacy. Call once after joining the hub.
    pub fn start(&self) {
        let candidacy = self.lock().candidacy;
        let _ = self.endpoint.broadcast(CoordMessage::Claim { candidacy });
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn role(&self) -> Role {
        self.lock().role
    }

    pub fn is_primary(&self) -> bool {
        self.lock().role.is_primary()
    }

    /// Our applied watermark for the stream we currently follow. A
    /// leader reports its own log position.
    pub fn applied_watermark(&self) -> Seq0 {
        let state = self.lock();
        if state.role.is_primary() {
            drop(state);
            return self.log.watermark().unwrap_or(Seq0::ZERO);
        }
        applied_for(&state)
    }

    /// Writes are deferred while an election or handoff is unresolved.
    pub fn writes_admitted(&self) -> bool {
        let state = self.lock();
        match state.role {
            Role::Candidate => false,
            Role::Leader => self.clock.now_ms() >= state.quiesce_until_ms,
            Role::Follower { .. } => true,
        }
    }

    /// Drain and handle every queued hub message.
    pub fn pump(&self) {
        while let Some(envelope) = self.endpoint.try_recv() {
            self.handle(envelope);
        }
    }

    /// Time-based transitions: claim resolution, heartbeats, staleness.
    pub fn tick(&self) {
        let now = self.clock.now_ms();
        let mut state = self.lock();

        match state.role {
            Role::Candidate => {
                if now >= state.claim_deadline_ms {
                    if state.best_claim == state.candidacy {
                        // No better claim arrived inside the ack window.
                        state.role = Role::Leader;
                        let _ = self.log.fast_forward(applied_for(&state));
                        tracing::info!(replica = %self.replica, "leadership claimed");
                        drop(state);
                        self.broadcast_heartbeat();
                    } else {
                        // Someone else won; wait for their heartbeat.
                        state.last_heartbeat_rx_ms = now;
                        state.producer = Some(state.best_claim.replica);
                        state.role = Role::Follower {
                            leader: state.best_claim.replica,
                        };
                    }
                }
            }
            Role::Leader => {
                if now.saturating_sub(state.last_heartbeat_tx_ms)
                    >= self.limits.heartbeat_interval_ms
                {
                    state.last_heartbeat_tx_ms = now;
                    state.last_watermark_tx_ms = now;
                    drop(state);
                    self.broadcast_heartbeat();
                } else if now.saturating_sub(state.last_watermark_tx_ms)
                    >= self.limits.watermark_broadcast_interval_ms
                {
                    state.last_watermark_tx_ms = now;
                    drop(state);
                    self.broadcast_watermark();
                }
            }
            Role::Follower { .. } => {
                if now.saturating_sub(state.last_heartbeat_rx_ms)
                    >= self.limits.stale_connection_threshold_ms
                {
                    tracing::info!(replica = %self.replica, "leader stale, starting election");
                    self.restart_election(&mut state, now);
                    let candidacy = state.candidacy;
                    drop(state);
                    let _ = self.endpoint.broadcast(CoordMessage::Claim { candidacy });
                }
            }
        }
    }

    /// Handle one incoming message.
    pub fn handle(&self, envelope: Envelope) {
        let now = self.clock.now_ms();
        match envelope.message {
            CoordMessage::Claim { candidacy } => self.on_claim(envelope.from, candidacy, now),
            CoordMessage::Ack { claimant } => {
                // Acks are informational under stamp ordering; the claim
                // window decides. Nothing to do unless addressed to us.
                let _ = claimant;
            }
            CoordMessage::Heartbeat {
                leader,
                candidacy,
                watermark,
            } => self.on_heartbeat(leader, candidacy, watermark, now),
            CoordMessage::HeartbeatResponse { .. } => {}
            CoordMessage::EventWatermark { seq } => self.on_watermark(envelope.from, seq),
            CoordMessage::ReplayRequest { from } => self.on_replay_request(envelope.from, from),
            CoordMessage::ReplayResponse {
                to,
                events,
                compacted,
                compacted_through,
            } => {
                if to == self.replica {
                    self.on_replay_response(events, compacted, compacted_through);
                }
            }
            CoordMessage::Logout => self.on_logout(envelope.from, now),
        }
    }

    /// Leader handoff: announce departure, quiesce in-flight writes, and
    /// demote our candidacy so any peer wins the next election. A sole
    /// replica simply re-elects itself after the window.
    pub fn resign(&self) {
        let mut state = self.lock();
        if !state.role.is_primary() {
            return;
        }
        let now = self.clock.now_ms();
        state.quiesce_until_ms = now + self.limits.handoff_quiesce_ms;
        state.candidacy = Candidacy::new(Stamp::new(u64::MAX, u32::MAX), 0x0F, self.replica);
        state.best_claim = state.candidacy;
        state.role = Role::Candidate;
        state.claim_deadline_ms =
            now + self.limits.handoff_quiesce_ms + self.limits.claim_ack_timeout_ms;
        drop(state);
        let _ = self.endpoint.broadcast(CoordMessage::Logout);
        tracing::info!(replica = %self.replica, "leader resigning");
    }

    /// Request replay of everything after our applied watermark.
    ///
    /// The abort token is honored on the response path: a cancelled
    /// request's events are never applied.
    pub fn request_replay(&self, abort: CancellationToken) {
        let mut state = self.lock();
        let from = applied_for(&state).next();
        state.replay_abort = Some(abort);
        drop(state);
        let _ = self.endpoint.broadcast(CoordMessage::ReplayRequest { from });
    }

    // ---- message handlers ----------------------------------------------

    fn on_claim(&self, from: ReplicaId, candidacy: Candidacy, now: u64) {
        let mut state = self.lock();
        if candidacy < state.best_claim {
            state.best_claim = candidacy;
        }

        match state.role {
            Role::Leader => {
                if state.candidacy < candidacy {
                    // Our claim predates theirs: assert leadership.
                    drop(state);
                    self.broadcast_heartbeat();
                } else {
                    // A better claim exists (e.g. ours was lost); yield.
                    state.role = Role::Follower { leader: from };
                    state.last_heartbeat_rx_ms = now;
                    drop(state);
                    let _ = self.endpoint.broadcast(CoordMessage::Ack { claimant: from });
                }
            }
            Role::Candidate | Role::Follower { .. } => {
                if candidacy < state.candidacy {
                    drop(state);
                    let _ = self.endpoint.broadcast(CoordMessage::Ack { claimant: from });
                }
            }
        }
    }

    fn on_heartbeat(&self, leader: ReplicaId, candidacy: Candidacy, watermark: Seq0, now: u64) {
        let mut state = self.lock();
        state.last_heartbeat_rx_ms = now;
        if candidacy < state.best_claim {
            state.best_claim = candidacy;
        }

        let yield_leadership = match state.role {
            Role::Leader => candidacy < state.candidacy,
            _ => true,
        };
        if yield_leadership && leader != self.replica {
            state.role = Role::Follower { leader };
            state.producer = Some(leader);
        }
        if watermark > state.leader_watermark {
            state.leader_watermark = watermark;
        }
        let behind =
            matches!(state.role, Role::Follower { .. }) && applied_for(&state) < watermark;
        drop(state);

        let _ = self.endpoint.send_to(
            leader,
            CoordMessage::HeartbeatResponse {
                follower: self.replica,
            },
        );
        if behind {
            self.request_replay(CancellationToken::new());
        }
    }

    fn on_watermark(&self, from: ReplicaId, seq: Seq0) {
        let behind = {
            let mut state = self.lock();
            if seq > state.leader_watermark {
                state.leader_watermark = seq;
            }
            let following = matches!(state.role, Role::Follower { leader } if leader == from);
            if following {
                state.producer = Some(from);
            }
            following && applied_for(&state) < seq
        };
        if behind {
            self.request_replay(CancellationToken::new());
        }
    }

    fn on_replay_request(&self, from: ReplicaId, first_wanted: Seq1) {
        if !self.is_primary() {
            return;
        }
        let cursor = first_wanted.prev_seq0();
        let (events, compacted, compacted_through) = match self.log.read_from(cursor) {
            Ok(ReadOutcome::Events(events)) => (events, false, Seq0::ZERO),
            Ok(ReadOutcome::Compacted { compacted_through }) => {
                (Vec::new(), true, compacted_through)
            }
            Err(err) => {
                tracing::warn!(error = %err, "replay read failed");
                return;
            }
        };
        let _ = self.endpoint.send_to(
            from,
            CoordMessage::ReplayResponse {
                to: from,
                events,
                compacted,
                compacted_through,
            },
        );
    }

    fn on_replay_response(&self, events: Vec<Event>, compacted: bool, compacted_through: Seq0) {
        let mut state = self.lock();
        if let Some(abort) = state.replay_abort.take() {
            if abort.is_cancelled() {
                // Aborted requests never complete.
                return;
            }
        }

        if compacted {
            // Retention outran us: reset projections and restart from the
            // leader's floor.
            tracing::info!(through = %compacted_through, "replay range compacted, resetting");
            if let Some(producer) = state.producer {
                state.applied.observe_at_least(&producer, compacted_through);
            }
            drop(state);
            self.request_replay(CancellationToken::new());
            return;
        }

        let mut applied = Vec::new();
        for event in events {
            let origin = event.origin;
            let current = state.applied.get(&origin);
            if event.seq.get() <= current.get() {
                // Duplicate from an overlapping replay; at-least-once.
                continue;
            }
            if state.applied.advance_contiguous(&origin, event.seq).is_err() {
                // Gap inside a replay batch: re-request from our watermark.
                break;
            }
            state.producer = Some(origin);
            applied.push(event);
        }
        let behind = applied_for(&state) < state.leader_watermark;
        drop(state);

        for event in &applied {
            if let Err(err) = self.sink.bus().publish(event) {
                tracing::warn!(error = %err, "replayed event publish failed");
            }
        }
        if behind {
            self.request_replay(CancellationToken::new());
        }
    }

    fn on_logout(&self, from: ReplicaId, now: u64) {
        let mut state = self.lock();
        let leader_left = match state.role {
            Role::Follower { leader } => leader == from,
            _ => false,
        };
        if leader_left {
            self.restart_election(&mut state, now);
            let candidacy = state.candidacy;
            drop(state);
            let _ = self.endpoint.broadcast(CoordMessage::Claim { candidacy });
        }
    }

    // ---- internals ------------------------------------------------------

    fn broadcast_heartbeat(&self) {
        let watermark = self.log.watermark().unwrap_or(Seq0::ZERO);
        let candidacy = self.lock().candidacy;
        let _ = self.endpoint.broadcast(CoordMessage::Heartbeat {
            leader: self.replica,
            candidacy,
            watermark,
        });
        self.broadcast_watermark();
    }

    fn broadcast_watermark(&self) {
        let watermark = self.log.watermark().unwrap_or(Seq0::ZERO);
        let _ = self
            .endpoint
            .broadcast(CoordMessage::EventWatermark { seq: watermark });
    }

    fn restart_election(&self, state: &mut CoordState, now: u64) {
        state.candidacy = Candidacy::new(
            self.clock.tick(),
            rand::thread_rng().gen_range(0..16),
            self.replica,
        );
        state.best_claim = state.candidacy;
        state.role = Role::Candidate;
        state.claim_deadline_ms = now + self.limits.claim_ack_timeout_ms;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CoordState> {
        self.state.lock().expect("coordinator lock poisoned")
    }
}

fn applied_for(state: &CoordState) -> Seq0 {
    state
        .producer
        .map(|producer| state.applied.get(&producer))
        .unwrap_or(Seq0::ZERO)
}

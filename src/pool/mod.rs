//! Worker pool: restartable compute workers with heartbeats and
//! backpressure.
//!
//! Submission picks the least-busy idle worker. When nothing is idle and
//! the pending count hits the backpressure threshold, intake suspends
//! until a result is consumed. Worker restart follows a strict order so
//! concurrent restarts never leave stale heartbeat state behind.

pub mod patterns;
pub mod protocol;
pub mod search;

pub use protocol::{EntryMeta, VectorEntry, VectorSource, WorkerRequest, WorkerResponse};
pub use search::{cosine_similarity, SearchHit, SearchStats, VectorBlock};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};

use crate::config::Limits;
use crate::core::error::{CoreError, ErrorKind};
use crate::core::{EventPayload, Stream, TimeSource};
use crate::eventlog::EventSink;

struct WorkerSlot {
    busy: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
    tx: Sender<WorkerRequest>,
}

struct PoolState {
    workers: BTreeMap<u64, WorkerSlot>,
    /// One heartbeat channel per live worker. Restart deletes this first.
    heartbeat_channels: BTreeMap<u64, Arc<AtomicU64>>,
    /// Last observed beat, deleted second during restart.
    heartbeat_ts: BTreeMap<u64, u64>,
    next_worker_id: u64,
    next_request_id: u64,
    pending: usize,
    intake_suspended: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InitState {
    Idle,
    InFlight { started_ms: u64 },
    Ready,
}

struct PoolInner {
    size: usize,
    limits: Limits,
    time: Arc<dyn TimeSource>,
    sink: EventSink,
    state: Mutex<PoolState>,
    init: Mutex<InitState>,
    init_cv: Condvar,
}

/// Cheap-clone handle to the pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

/// Pending result. Consuming it releases backpressure.
pub struct PoolTicket {
    rx: Receiver<WorkerResponse>,
    pool: WorkerPool,
    consumed: bool,
}

impl std::fmt::Debug for PoolTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolTicket")
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}

impl PoolTicket {
    /// Wait for the response. Consumption resumes suspended intake.
    pub fn wait(mut self) -> Result<WorkerResponse, CoreError> {
        let result = self
            .rx
            .recv()
            .map_err(|_| CoreError::transient("worker terminated before responding"));
        self.consume();
        result
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Result<WorkerResponse, CoreError> {
        let result = self
            .rx
            .recv_timeout(timeout)
            .map_err(|_| CoreError::cancelled("worker response timed out"));
        self.consume();
        result
    }

    fn consume(&mut self) {
        if !self.consumed {
            self.consumed = true;
            self.pool.result_consumed();
        }
    }
}

impl Drop for PoolTicket {
    fn drop(&mut self) {
        self.consume();
    }
}

/// Observability snapshot for tests and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub heartbeat_channels: usize,
    pub heartbeat_timestamps: usize,
    pub busy: usize,
    pub pending: usize,
    pub intake_suspended: bool,
}

impl WorkerPool {
    pub fn new(size: usize, limits: Limits, time: Arc<dyn TimeSource>, sink: EventSink) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                size: size.max(1),
                limits,
                time,
                sink,
                state: Mutex::new(PoolState {
                    workers: BTreeMap::new(),
                    heartbeat_channels: BTreeMap::new(),
                    heartbeat_ts: BTreeMap::new(),
                    next_worker_id: 1,
                    next_request_id: 1,
                    pending: 0,
                    intake_suspended: false,
                }),
                init: Mutex::new(InitState::Idle),
                init_cv: Condvar::new(),
            }),
        }
    }

    /// Deduplicated initialization: concurrent callers share one in-flight
    /// attempt; an attempt older than the staleness bound is abandoned and
    /// restarted; a failed attempt clears so the next caller retries.
    pub fn ensure_initialized(&self) -> Result<(), CoreError> {
        loop {
            let now = self.inner.time.now_ms();
            let mut init = self.inner.init.lock().expect("init lock poisoned");
            match *init {
                InitState::Ready => return Ok(()),
                InitState::InFlight { started_ms }
                    if now.saturating_sub(started_ms) <= self.inner.limits.worker_init_stale_ms =>
                {
                    // Share the in-flight attempt.
                    let (next, timeout) = self
                        .inner
                        .init_cv
                        .wait_timeout(init, Duration::from_millis(50))
                        .expect("init lock poisoned");
                    drop(next);
                    let _ = timeout;
                    continue;
                }
                InitState::Idle | InitState::InFlight { .. } => {
                    *init = InitState::InFlight { started_ms: now };
                }
            }
            drop(init);

            let result = self.spawn_initial_workers();
            let mut init = self.inner.init.lock().expect("init lock poisoned");
            match result {
                Ok(()) => {
                    *init = InitState::Ready;
                    self.inner.init_cv.notify_all();
                    return Ok(());
                }
                Err(err) => {
                    // Clear so a later caller can retry.
                    *init = InitState::Idle;
                    self.inner.init_cv.notify_all();
                    return Err(err);
                }
            }
        }
    }

    fn spawn_initial_workers(&self) -> Result<(), CoreError> {
        let mut state = self.lock_state();
        while state.workers.len() < self.inner.size {
            self.spawn_worker_locked(&mut state)?;
        }
        Ok(())
    }

    /// Submit a vector search.
    pub fn submit_search(
        &self,
        query_vector: Vec<f32>,
        source: VectorSource,
        threshold: f32,
        limit: usize,
    ) -> Result<PoolTicket, CoreError> {
        self.ensure_initialized()?;

        // Business-layer validation before anything is dispatched.
        let dimensions = match &source {
            VectorSource::Owned(entries) => {
                entries.first().map(|e| e.vector.len()).unwrap_or(0)
            }
            VectorSource::Shared { block, .. } => block.dimensions(),
        };
        search::validate_query(&query_vector, dimensions)?;

        let (reply_tx, reply_rx) = bounded(1);
        self.dispatch(move |id| WorkerRequest::Search {
            id,
            query_vector,
            source,
            threshold,
            limit,
            reply: reply_tx,
        })?;
        Ok(PoolTicket {
            rx: reply_rx,
            pool: self.clone(),
            consumed: false,
        })
    }

    /// Run every pattern detector over the streams, emitting events.
    pub fn detect_patterns(&self, streams: Vec<Stream>) -> Result<Vec<(String, serde_json::Value)>, CoreError> {
        self.ensure_initialized()?;
        let started = self.inner.time.now_ms();
        let (reply_tx, reply_rx) = bounded(1);
        self.dispatch(move |id| WorkerRequest::DetectPatterns {
            id,
            streams,
            reply: reply_tx,
        })?;
        let ticket = PoolTicket {
            rx: reply_rx,
            pool: self.clone(),
            consumed: false,
        };

        match ticket.wait()? {
            WorkerResponse::Patterns { patterns, .. } => {
                let now = self.inner.time.now_ms();
                for (name, result) in &patterns {
                    self.inner.sink.emit(
                        EventPayload::PatternDetected {
                            pattern_name: name.clone(),
                            result: result.clone(),
                        },
                        now,
                    );
                }
                self.inner.sink.emit(
                    EventPayload::PatternAllComplete {
                        patterns: patterns.iter().map(|(n, _)| n.clone()).collect(),
                        duration_ms: now.saturating_sub(started),
                    },
                    now,
                );
                Ok(patterns)
            }
            WorkerResponse::Error { message, .. } => {
                Err(CoreError::new(crate::core::error::classify_message(&message), message))
            }
            other => Err(CoreError::transient(format!(
                "unexpected worker response {:?}",
                other.id()
            ))),
        }
    }

    /// Active liveness probe over the wire protocol.
    ///
    /// Returns `false` when the worker misses the reply deadline (wedged
    /// or mid-request); heartbeat staleness remains the restart trigger.
    pub fn ping_worker(&self, worker_id: u64, timeout: Duration) -> Result<bool, CoreError> {
        let (reply_tx, reply_rx) = bounded(1);
        {
            let mut state = self.lock_state();
            let request_id = state.next_request_id;
            state.next_request_id += 1;
            let Some(slot) = state.workers.get(&worker_id) else {
                return Err(CoreError::validation(format!(
                    "no worker {worker_id} registered"
                )));
            };
            if slot
                .tx
                .send(WorkerRequest::Ping {
                    id: request_id,
                    reply: reply_tx,
                })
                .is_err()
            {
                return Err(CoreError::transient("worker channel closed"));
            }
        }
        Ok(matches!(
            reply_rx.recv_timeout(timeout),
            Ok(WorkerResponse::Pong { .. })
        ))
    }

    /// Health-check every worker and restart the stale ones.
    pub fn check_workers(&self) -> usize {
        let now = self.inner.time.now_ms();
        let stale: Vec<u64> = {
            let state = self.lock_state();
            state
                .heartbeat_channels
                .iter()
                .filter(|(_, beat)| {
                    now.saturating_sub(beat.load(Ordering::SeqCst))
                        > self.inner.limits.stale_worker_timeout_ms
                })
                .map(|(id, _)| *id)
                .collect()
        };
        let count = stale.len();
        for id in stale {
            self.restart_worker(id);
        }
        count
    }

    /// Atomically replace one worker.
    ///
    /// Order matters and is protected by the state lock end to end:
    /// heartbeat channel out first, then the timestamp, then the worker
    /// itself, then a fresh registration. Concurrent restarts serialize
    /// here, which is what keeps stale references impossible.
    pub fn restart_worker(&self, id: u64) -> bool {
        let mut state = self.lock_state();
        if !state.workers.contains_key(&id) {
            return false;
        }
        // 1. Close and delete the heartbeat channel.
        state.heartbeat_channels.remove(&id);
        // 2. Delete the heartbeat timestamp.
        state.heartbeat_ts.remove(&id);
        // 3. Terminate the old worker (dropping its sender ends its loop).
        state.workers.remove(&id);
        // 4. Construct the replacement and register fresh state.
        if let Err(err) = self.spawn_worker_locked(&mut state) {
            tracing::error!(worker = id, error = %err, "worker respawn failed");
            return false;
        }
        tracing::info!(worker = id, "worker restarted");
        true
    }

    /// Grow or shrink the live worker set.
    pub fn resize(&self, size: usize) -> Result<(), CoreError> {
        let size = size.max(1);
        let mut state = self.lock_state();
        while state.workers.len() < size {
            self.spawn_worker_locked(&mut state)?;
        }
        while state.workers.len() > size {
            let last = state.workers.keys().next_back().copied();
            let Some(id) = last else { break };
            state.heartbeat_channels.remove(&id);
            state.heartbeat_ts.remove(&id);
            state.workers.remove(&id);
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            workers: state.workers.len(),
            heartbeat_channels: state.heartbeat_channels.len(),
            heartbeat_timestamps: state.heartbeat_ts.len(),
            busy: state
                .workers
                .values()
                .filter(|w| w.busy.load(Ordering::SeqCst))
                .count(),
            pending: state.pending,
            intake_suspended: state.intake_suspended,
        }
    }

    // ---- internals ------------------------------------------------------

    fn dispatch<F>(&self, build: F) -> Result<(), CoreError>
    where
        F: FnOnce(u64) -> WorkerRequest,
    {
        let mut state = self.lock_state();
        if state.intake_suspended {
            return Err(CoreError::new(
                ErrorKind::RateLimit,
                "pool intake suspended under backpressure",
            ));
        }

        let request_id = state.next_request_id;
        state.next_request_id += 1;

        // Least-busy idle worker; otherwise the least-loaded one queues.
        let target = state
            .workers
            .iter()
            .filter(|(_, w)| !w.busy.load(Ordering::SeqCst))
            .min_by_key(|(_, w)| w.processed.load(Ordering::SeqCst))
            .map(|(id, _)| *id)
            .or_else(|| {
                state
                    .workers
                    .iter()
                    .min_by_key(|(_, w)| w.processed.load(Ordering::SeqCst))
                    .map(|(id, _)| *id)
            });
        let Some(target) = target else {
            return Err(CoreError::transient("no workers available"));
        };

        let request = build(request_id);
        if state.workers[&target].tx.send(request).is_err() {
            return Err(CoreError::transient("worker channel closed"));
        }
        state.pending += 1;

        let idle_exists = state
            .workers
            .values()
            .any(|w| !w.busy.load(Ordering::SeqCst));
        if !idle_exists && state.pending >= self.inner.limits.pool_backpressure_threshold {
            state.intake_suspended = true;
            let queued = state.pending;
            drop(state);
            self.inner
                .sink
                .emit(EventPayload::Backpressure { queued }, self.inner.time.now_ms());
            tracing::warn!(queued, "pool backpressure, intake suspended");
        }
        Ok(())
    }

    fn result_consumed(&self) {
        let mut state = self.lock_state();
        state.pending = state.pending.saturating_sub(1);
        if state.intake_suspended && state.pending < self.inner.limits.pool_backpressure_threshold {
            state.intake_suspended = false;
        }
    }

    fn spawn_worker_locked(&self, state: &mut PoolState) -> Result<(), CoreError> {
        let id = state.next_worker_id;
        state.next_worker_id += 1;

        let busy = Arc::new(AtomicBool::new(false));
        let processed = Arc::new(AtomicU64::new(0));
        let beat = Arc::new(AtomicU64::new(self.inner.time.now_ms()));
        let (tx, rx) = unbounded::<WorkerRequest>();

        let worker_busy = Arc::clone(&busy);
        let worker_processed = Arc::clone(&processed);
        let worker_beat = Arc::clone(&beat);
        let worker_time = Arc::clone(&self.inner.time);

        std::thread::Builder::new()
            .name(format!("echovault-worker-{id}"))
            .spawn(move || worker_loop(rx, worker_busy, worker_processed, worker_beat, worker_time))
            .map_err(|e| CoreError::transient(format!("worker spawn failed: {e}")))?;

        state.workers.insert(
            id,
            WorkerSlot {
                busy,
                processed,
                tx,
            },
        );
        state.heartbeat_channels.insert(id, Arc::clone(&beat));
        state
            .heartbeat_ts
            .insert(id, beat.load(Ordering::SeqCst));
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.inner.state.lock().expect("pool lock poisoned")
    }
}

fn worker_loop(
    rx: Receiver<WorkerRequest>,
    busy: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
    beat: Arc<AtomicU64>,
    time: Arc<dyn TimeSource>,
) {
    loop {
        // Beat even while idle so staleness means a wedged worker, not a
        // quiet one.
        beat.store(time.now_ms(), Ordering::SeqCst);
        let request = match rx.recv_timeout(Duration::from_millis(1_000)) {
            Ok(request) => request,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
        };

        busy.store(true, Ordering::SeqCst);
        handle_request(request, &time);
        busy.store(false, Ordering::SeqCst);
        processed.fetch_add(1, Ordering::SeqCst);
    }
}

fn handle_request(request: WorkerRequest, time: &Arc<dyn TimeSource>) {
    match request {
        WorkerRequest::Ping { id, reply } => {
            let _ = reply.send(WorkerResponse::Pong { id });
        }
        WorkerRequest::DetectPatterns { id, streams, reply } => {
            let started = time.now_ms();
            let patterns: Vec<(String, serde_json::Value)> = patterns::registry()
                .into_iter()
                .map(|(name, detector)| (name.to_string(), detector(&streams)))
                .collect();
            let _ = reply.send(WorkerResponse::Patterns {
                id,
                patterns,
                duration_ms: time.now_ms().saturating_sub(started),
            });
        }
        WorkerRequest::Search {
            id,
            query_vector,
            source,
            threshold,
            limit,
            reply,
        } => {
            let response = match source {
                VectorSource::Shared { block, entries } => {
                    let meta: Vec<(String, serde_json::Value)> = entries
                        .into_iter()
                        .map(|e| (e.id, e.payload))
                        .collect();
                    if meta.len() != block.count() {
                        WorkerResponse::Error {
                            id,
                            message: format!(
                                "invalid request: {} metadata rows for {} vectors",
                                meta.len(),
                                block.count()
                            ),
                        }
                    } else {
                        let (results, stats) =
                            search::run_search(&block, &meta, &query_vector, threshold, limit);
                        WorkerResponse::Results { id, results, stats }
                    }
                }
                VectorSource::Owned(entries) => {
                    let records: Vec<crate::core::EmbeddingRecord> = entries
                        .iter()
                        .map(|e| crate::core::EmbeddingRecord {
                            id: e.id.clone(),
                            vector: e.vector.clone(),
                            payload: e.payload.clone(),
                            created_at: 0,
                        })
                        .collect();
                    match search::VectorBlock::from_records(&records) {
                        Ok(block) => {
                            let meta: Vec<(String, serde_json::Value)> = entries
                                .into_iter()
                                .map(|e| (e.id, e.payload))
                                .collect();
                            let (results, mut stats) =
                                search::run_search(&block, &meta, &query_vector, threshold, limit);
                            stats.shared_memory = false;
                            WorkerResponse::Results { id, results, stats }
                        }
                        Err(err) => WorkerResponse::Error {
                            id,
                            message: err.to_string(),
                        },
                    }
                }
            };
            let _ = reply.send(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ReplicaId, SystemTimeSource};
    use crate::eventlog::{EventBus, EventLog};
    use serde_json::json;

    fn pool(size: usize) -> WorkerPool {
        let sink = EventSink::new(EventLog::new(ReplicaId::random(), 1000), EventBus::new(16));
        WorkerPool::new(size, Limits::default(), Arc::new(SystemTimeSource), sink)
    }

    fn owned_entries() -> VectorSource {
        VectorSource::Owned(vec![
            VectorEntry {
                id: "a".to_string(),
                vector: vec![1.0, 0.0, 0.0],
                payload: json!({"n": 1}),
            },
            VectorEntry {
                id: "b".to_string(),
                vector: vec![0.0, 1.0, 0.0],
                payload: json!({"n": 2}),
            },
            VectorEntry {
                id: "c".to_string(),
                vector: vec![0.9, 0.1, 0.0],
                payload: json!({"n": 3}),
            },
        ])
    }

    #[test]
    fn search_through_pool_owned_path() {
        let pool = pool(2);
        let ticket = pool
            .submit_search(vec![1.0, 0.0, 0.0], owned_entries(), 0.5, 2)
            .unwrap();
        match ticket.wait().unwrap() {
            WorkerResponse::Results { results, stats, .. } => {
                assert_eq!(results.len(), 2);
                assert_eq!(results[0].id, "a");
                assert_eq!(results[1].id, "c");
                assert!(!stats.shared_memory);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn search_through_pool_shared_path() {
        let pool = pool(2);
        let records: Vec<_> = [("a", [1.0f32, 0.0, 0.0]), ("b", [0.0, 1.0, 0.0])]
            .iter()
            .map(|(id, v)| crate::core::EmbeddingRecord {
                id: id.to_string(),
                vector: v.to_vec(),
                payload: serde_json::Value::Null,
                created_at: 0,
            })
            .collect();
        let block = Arc::new(VectorBlock::from_records(&records).unwrap());
        let entries = records
            .iter()
            .map(|r| EntryMeta {
                id: r.id.clone(),
                payload: r.payload.clone(),
            })
            .collect();

        let ticket = pool
            .submit_search(
                vec![1.0, 0.0, 0.0],
                VectorSource::Shared { block, entries },
                0.5,
                10,
            )
            .unwrap();
        match ticket.wait().unwrap() {
            WorkerResponse::Results { results, stats, .. } => {
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].id, "a");
                assert!(stats.shared_memory);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn dimension_mismatch_rejected_before_dispatch() {
        let pool = pool(1);
        let err = pool
            .submit_search(vec![1.0, 0.0], owned_entries(), 0.5, 2)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn init_is_deduplicated_across_threads() {
        let pool = pool(3);
        let mut joins = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            joins.push(std::thread::spawn(move || pool.ensure_initialized()));
        }
        for join in joins {
            join.join().unwrap().unwrap();
        }
        assert_eq!(pool.stats().workers, 3);
    }

    #[test]
    fn concurrent_restarts_keep_state_consistent() {
        let pool = pool(4);
        pool.ensure_initialized().unwrap();

        let ids: Vec<u64> = {
            let state = pool.lock_state();
            state.workers.keys().copied().collect()
        };
        let mut joins = Vec::new();
        for id in ids {
            let pool = pool.clone();
            joins.push(std::thread::spawn(move || pool.restart_worker(id)));
        }
        for join in joins {
            assert!(join.join().unwrap());
        }

        let stats = pool.stats();
        assert_eq!(stats.workers, 4);
        assert_eq!(stats.heartbeat_channels, 4);
        assert_eq!(stats.heartbeat_timestamps, 4);

        // The new generation still serves requests.
        let ticket = pool
            .submit_search(vec![1.0, 0.0, 0.0], owned_entries(), 0.0, 10)
            .unwrap();
        assert!(matches!(
            ticket.wait().unwrap(),
            WorkerResponse::Results { .. }
        ));
    }

    #[test]
    fn ping_reaches_live_workers() {
        let pool = pool(2);
        pool.ensure_initialized().unwrap();

        let ids: Vec<u64> = {
            let state = pool.lock_state();
            state.workers.keys().copied().collect()
        };
        for id in ids {
            assert!(pool.ping_worker(id, Duration::from_secs(2)).unwrap());
        }
        assert!(pool.ping_worker(9_999, Duration::from_millis(10)).is_err());
    }

    #[test]
    fn pattern_detection_end_to_end() {
        let pool = pool(1);
        let streams = vec![
            Stream {
                ts: "2024-01-01".to_string(),
                track: "hit".to_string(),
                artist: "A".to_string(),
                ms_played: 1000,
                context: None,
            },
            Stream {
                ts: "2024-01-02".to_string(),
                track: "hit".to_string(),
                artist: "A".to_string(),
                ms_played: 2000,
                context: None,
            },
        ];
        let patterns = pool.detect_patterns(streams).unwrap();
        let names: Vec<_> = patterns.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["top_artist", "heavy_rotation", "listening_totals"]);
    }

    #[test]
    fn backpressure_suspends_intake_until_result_consumed() {
        let pool = pool(1);
        pool.ensure_initialized().unwrap();
        {
            let mut state = pool.lock_state();
            state.intake_suspended = true;
            state.pending = Limits::default().pool_backpressure_threshold;
        }

        let err = pool
            .submit_search(vec![1.0, 0.0, 0.0], owned_entries(), 0.5, 2)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimit);

        // Consuming a result lifts the suspension.
        pool.result_consumed();
        assert!(!pool.stats().intake_suspended);
        let ticket = pool
            .submit_search(vec![1.0, 0.0, 0.0], owned_entries(), 0.5, 2)
            .unwrap();
        assert!(matches!(
            ticket.wait().unwrap(),
            WorkerResponse::Results { .. }
        ));
    }

    #[test]
    fn resize_grows_and_shrinks() {
        let pool = pool(2);
        pool.ensure_initialized().unwrap();
        pool.resize(5).unwrap();
        assert_eq!(pool.stats().workers, 5);
        assert_eq!(pool.stats().heartbeat_channels, 5);
        pool.resize(1).unwrap();
        assert_eq!(pool.stats().workers, 1);
        assert_eq!(pool.stats().heartbeat_channels, 1);
    }
}

//! Operation scheduler: a priority serializer for storage-mutating work.
//!
//! Writes execute serially on one executor thread in `(priority,
//! submission)` order; read-only operations with no declared write
//! dependency run immediately in parallel. Critical operations block
//! schema-changing work, and a pending reload fires only once the queue
//! has drained.

pub mod breaker;
pub mod retry;
pub mod timeout;

pub use breaker::{BreakerState, CircuitBreaker};
pub use retry::{retry_with_backoff, retry_with_backoff_using, RetryOutcome, RetryPolicy};
pub use timeout::{
    with_progressive_timeout, with_timeout, CancellationToken, ProgressiveHooks, TimeoutError,
};

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};

use crate::config::Limits;
use crate::core::error::CoreError;
use crate::core::TimeSource;
use crate::eventlog::EventSink;

/// Lower value runs first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
}

#[derive(Clone, Debug, Default)]
pub struct SubmitOptions {
    pub priority: Option<Priority>,
    /// Logical resource the op serializes against (informational; the
    /// executor serializes all queued writes).
    pub resource: Option<String>,
    pub timeout_ms: Option<u64>,
    /// Critical ops block schema-changing operations until they finish.
    pub critical: bool,
    /// Read-only ops with no write dependency run in parallel.
    pub read_only: bool,
    pub cancel: Option<CancellationToken>,
}

/// Handle to a submitted operation's eventual result.
pub struct OpTicket<T> {
    rx: Receiver<Result<T, CoreError>>,
    token: CancellationToken,
    timeout_ms: Option<u64>,
    operation: String,
}

impl<T> OpTicket<T> {
    /// Block for the result, honoring the submit-time timeout.
    pub fn wait(self) -> Result<T, CoreError> {
        match self.timeout_ms {
            None => self
                .rx
                .recv()
                .unwrap_or_else(|_| Err(CoreError::cancelled("scheduler shut down"))),
            Some(ms) => match self.rx.recv_timeout(Duration::from_millis(ms)) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => {
                    self.token.cancel();
                    Err(TimeoutError {
                        timeout_ms: ms,
                        operation: self.operation,
                    }
                    .into())
                }
                Err(RecvTimeoutError::Disconnected) => {
                    Err(CoreError::cancelled("scheduler shut down"))
                }
            },
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

struct QueuedOp {
    priority: Priority,
    seq: u64,
    token: CancellationToken,
    run: Box<dyn FnOnce() + Send>,
}

impl PartialEq for QueuedOp {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedOp {}

impl PartialOrd for QueuedOp {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedOp {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the smallest
        // (priority, seq) pair pops first.
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

struct SchedState {
    heap: BinaryHeap<QueuedOp>,
    next_seq: u64,
    executing: bool,
    shutdown: bool,
    reload_pending: bool,
    reload_ready: bool,
}

struct Shared {
    state: Mutex<SchedState>,
    cv: Condvar,
    critical_in_flight: AtomicUsize,
}

/// The scheduler. Dropping it drains nothing: queued ops receive a
/// cancellation error and the executor exits.
pub struct OpScheduler {
    shared: Arc<Shared>,
    limits: Limits,
    time: Arc<dyn TimeSource>,
    sink: EventSink,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    executor: Option<JoinHandle<()>>,
}

impl OpScheduler {
    pub fn new(limits: Limits, time: Arc<dyn TimeSource>, sink: EventSink) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                executing: false,
                shutdown: false,
                reload_pending: false,
                reload_ready: false,
            }),
            cv: Condvar::new(),
            critical_in_flight: AtomicUsize::new(0),
        });

        let executor = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("echovault-sched".to_string())
                .spawn(move || executor_loop(shared))
                .expect("spawn scheduler executor")
        };

        Self {
            shared,
            limits,
            time,
            sink,
            breakers: Mutex::new(HashMap::new()),
            executor: Some(executor),
        }
    }

    /// Submit an operation. Returns a ticket for the result.
    pub fn submit<T, F>(&self, operation: &str, op: F, opts: SubmitOptions) -> OpTicket<T>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Result<T, CoreError> + Send + 'static,
    {
        let token = opts.cancel.unwrap_or_default();
        let (tx, rx) = bounded::<Result<T, CoreError>>(1);
        let ticket = OpTicket {
            rx,
            token: token.clone(),
            timeout_ms: opts.timeout_ms,
            operation: operation.to_string(),
        };

        if opts.read_only {
            // Reads bypass the serializer entirely.
            let run_token = token.clone();
            std::thread::spawn(move || {
                let result = if run_token.is_cancelled() {
                    Err(CoreError::cancelled("operation aborted before start"))
                } else {
                    op(run_token)
                };
                let _ = tx.send(result);
            });
            return ticket;
        }

        let critical = opts.critical;
        if critical {
            self.shared.critical_in_flight.fetch_add(1, Ordering::SeqCst);
        }

        let shared_for_run = Arc::clone(&self.shared);
        let run_token = token.clone();
        let run: Box<dyn FnOnce() + Send> = Box::new(move || {
            let result = if run_token.is_cancelled() {
                Err(CoreError::cancelled("operation aborted before start"))
            } else {
                op(run_token)
            };
            if critical {
                shared_for_run
                    .critical_in_flight
                    .fetch_sub(1, Ordering::SeqCst);
            }
            let _ = tx.send(result);
        });

        let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(QueuedOp {
            priority: opts.priority.unwrap_or(Priority::Normal),
            seq,
            token,
            run,
        });
        drop(state);
        self.shared.cv.notify_one();
        ticket
    }

    /// True while a critical operation is queued or running; schema
    /// changes must wait.
    pub fn schema_changes_blocked(&self) -> bool {
        self.shared.critical_in_flight.load(Ordering::SeqCst) > 0
    }

    /// Ask for a reload once the queue drains.
    pub fn request_reload(&self) {
        let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
        if state.heap.is_empty() && !state.executing {
            state.reload_ready = true;
        } else {
            state.reload_pending = true;
        }
    }

    /// Consume a drained-queue reload signal, if one is ready.
    pub fn take_ready_reload(&self) -> bool {
        let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
        let ready = state.reload_ready;
        state.reload_ready = false;
        ready
    }

    /// Circuit breaker for a named resource, created on first use.
    pub fn breaker(&self, resource: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("breakers lock poisoned");
        Arc::clone(breakers.entry(resource.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                resource,
                self.limits.breaker_failure_threshold,
                self.limits.breaker_cooldown_ms,
                Arc::clone(&self.time),
                self.sink.clone(),
            ))
        }))
    }

    /// Retry policy builder bound to this scheduler's limits.
    pub fn retry_policy(
        &self,
        max_retries: u32,
        base_delay_override_ms: Option<u64>,
    ) -> Result<RetryPolicy, CoreError> {
        RetryPolicy::new(max_retries, base_delay_override_ms, &self.limits)
    }

    /// Block until every queued op has run (test and shutdown aid).
    pub fn drain(&self) {
        let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
        while !state.heap.is_empty() || state.executing {
            let (next, _) = self
                .shared
                .cv
                .wait_timeout(state, Duration::from_millis(20))
                .expect("scheduler lock poisoned");
            state = next;
        }
    }
}

impl Drop for OpScheduler {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
            state.shutdown = true;
        }
        self.shared.cv.notify_all();
        if let Some(handle) = self.executor.take() {
            let _ = handle.join();
        }
    }
}

fn executor_loop(shared: Arc<Shared>) {
    loop {
        let op = {
            let mut state = shared.state.lock().expect("scheduler lock poisoned");
            loop {
                if state.shutdown {
                    // Fail queued ops so tickets resolve.
                    while let Some(op) = state.heap.pop() {
                        op.token.cancel();
                        (op.run)();
                    }
                    return;
                }
                if let Some(op) = state.heap.pop() {
                    state.executing = true;
                    break op;
                }
                if state.reload_pending {
                    state.reload_pending = false;
                    state.reload_ready = true;
                }
                shared.cv.notify_all();
                state = shared
                    .cv
                    .wait_timeout(state, Duration::from_millis(50))
                    .expect("scheduler lock poisoned")
                    .0;
            }
        };

        (op.run)();

        let mut state = shared.state.lock().expect("scheduler lock poisoned");
        state.executing = false;
        if state.heap.is_empty() && state.reload_pending {
            state.reload_pending = false;
            state.reload_ready = true;
        }
        drop(state);
        shared.cv.notify_all();
    }
}

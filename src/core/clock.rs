//! HLC (Hybrid Logical Clock) over an injectable time source.
//!
//! The clock generates monotonically increasing stamps that form a total
//! order across all replicas, even when wall time stalls or jumps backward.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Wall-time provider. Production uses [`SystemTimeSource`]; tests drive
/// [`ManualTimeSource`] to make election and TTL paths deterministic.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually advanced time source for tests.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now_ms: AtomicU64,
}

impl ManualTimeSource {
    pub fn at(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// A hybrid logical stamp: wall milliseconds plus a tie-break counter.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Stamp {
    pub wall_ms: u64,
    pub counter: u32,
}

impl Stamp {
    pub fn new(wall_ms: u64, counter: u32) -> Self {
        Self { wall_ms, counter }
    }
}

/// Hybrid Logical Clock.
///
/// Guarantees:
/// - `tick()` returns a stamp strictly greater than any previous stamp
///   from this clock
/// - monotonic even if the wall clock goes backward
pub struct Clock {
    time: Arc<dyn TimeSource>,
    state: Mutex<ClockState>,
}

struct ClockState {
    wall_ms: u64,
    counter: u32,
}

impl Clock {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        let wall_ms = time.now_ms();
        Self {
            time,
            state: Mutex::new(ClockState { wall_ms, counter: 0 }),
        }
    }

    /// Generate a new stamp, advancing the clock.
    pub fn tick(&self) -> Stamp {
        let now = self.time.now_ms();
        let mut state = self.state.lock().expect("clock lock poisoned");

        if now > state.wall_ms {
            state.wall_ms = now;
            state.counter = 0;
        } else {
            state.counter += 1;
        }

        Stamp::new(state.wall_ms, state.counter)
    }

    /// Fold in a stamp observed from another replica.
    ///
    /// Ensures the next `tick()` produces a stamp greater than `remote`.
    pub fn receive(&self, remote: &Stamp) {
        let now = self.time.now_ms();
        let mut state = self.state.lock().expect("clock lock poisoned");

        if remote.wall_ms > state.wall_ms {
            state.wall_ms = remote.wall_ms;
            state.counter = remote.counter;
        } else if remote.wall_ms == state.wall_ms && remote.counter > state.counter {
            state.counter = remote.counter;
        }

        if now > state.wall_ms {
            state.wall_ms = now;
            state.counter = 0;
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.time.now_ms()
    }
}

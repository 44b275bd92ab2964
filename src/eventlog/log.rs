//! Append-only event log with monotonic sequence and compaction.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::core::{Event, EventPayload, ReplicaId, Seq0, Seq1};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventLogError {
    #[error("event log lock poisoned")]
    LockPoisoned,
}

/// What a reader gets back from a cursor read.
#[derive(Clone, Debug, PartialEq)]
pub enum ReadOutcome {
    /// Events following the cursor, in order.
    Events(Vec<Event>),
    /// The cursor fell behind compaction; the reader must reset its
    /// projections and restart from `compacted_through`.
    Compacted { compacted_through: Seq0 },
}

/// Append-only log for one producing replica.
///
/// `seq` is strictly increasing and never reused. Compaction drops the
/// oldest entries past the retention window; readers whose cursor falls
/// inside the dropped range are told to reset.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Mutex<LogState>>,
}

struct LogState {
    origin: ReplicaId,
    next_seq: Seq1,
    compacted_through: Seq0,
    retention_events: u64,
    entries: VecDeque<Event>,
}

impl EventLog {
    pub fn new(origin: ReplicaId, retention_events: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogState {
                origin,
                next_seq: Seq0::ZERO.next(),
                compacted_through: Seq0::ZERO,
                retention_events: retention_events.max(1),
                entries: VecDeque::new(),
            })),
        }
    }

    pub fn origin(&self) -> Result<ReplicaId, EventLogError> {
        Ok(self.lock()?.origin)
    }

    /// Append a payload, assigning the next sequence.
    pub fn append(&self, payload: EventPayload, ts: u64) -> Result<Event, EventLogError> {
        let mut state = self.lock()?;
        let seq = state.next_seq;
        state.next_seq = seq.next();
        let event = Event::new(seq, payload, ts, state.origin);
        state.entries.push_back(event.clone());

        // Retention-window compaction keeps the log bounded; the watermark
        // moves forward with it.
        while state.entries.len() as u64 > state.retention_events {
            if let Some(evicted) = state.entries.pop_front() {
                state.compacted_through = Seq0::new(evicted.seq.get());
            }
        }
        Ok(event)
    }

    /// Seed the sequence when rejoining as leader after replay.
    pub fn fast_forward(&self, applied: Seq0) -> Result<(), EventLogError> {
        let mut state = self.lock()?;
        if applied.next() > state.next_seq {
            state.next_seq = applied.next();
        }
        Ok(())
    }

    /// Read every event with `seq > cursor`.
    pub fn read_from(&self, cursor: Seq0) -> Result<ReadOutcome, EventLogError> {
        let state = self.lock()?;
        if cursor < state.compacted_through {
            return Ok(ReadOutcome::Compacted {
                compacted_through: state.compacted_through,
            });
        }
        let events = state
            .entries
            .iter()
            .filter(|e| e.seq.get() > cursor.get())
            .cloned()
            .collect();
        Ok(ReadOutcome::Events(events))
    }

    /// Highest assigned sequence (the producer watermark).
    pub fn watermark(&self) -> Result<Seq0, EventLogError> {
        let state = self.lock()?;
        Ok(state.next_seq.prev_seq0())
    }

    pub fn compacted_through(&self) -> Result<Seq0, EventLogError> {
        Ok(self.lock()?.compacted_through)
    }

    /// Drop entries at or below `through`, recording the checkpoint.
    pub fn compact_through(&self, through: Seq0) -> Result<(), EventLogError> {
        let mut state = self.lock()?;
        while state
            .entries
            .front()
            .is_some_and(|e| e.seq.get() <= through.get())
        {
            state.entries.pop_front();
        }
        if through > state.compacted_through {
            state.compacted_through = through;
        }
        Ok(())
    }

    pub fn len(&self) -> Result<usize, EventLogError> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, EventLogError> {
        Ok(self.lock()?.entries.is_empty())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LogState>, EventLogError> {
        self.inner.lock().map_err(|_| EventLogError::LockPoisoned)
    }
}

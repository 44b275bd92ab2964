//! Event log and bus: sequenced persistence plus in-process fan-out.

pub mod bus;
pub mod log;

pub use bus::{BusError, EventBus, Subscription};
pub use log::{EventLog, EventLogError, ReadOutcome};

use crate::core::{Event, EventPayload, Seq0};

/// Composition of log + bus used by every emitting subsystem: append to
/// the log for replayability, then fan out synchronously.
#[derive(Clone)]
pub struct EventSink {
    log: EventLog,
    bus: EventBus,
}

impl EventSink {
    pub fn new(log: EventLog, bus: EventBus) -> Self {
        Self { log, bus }
    }

    pub fn emit(&self, payload: EventPayload, ts: u64) -> Option<Event> {
        let event = match self.log.append(payload, ts) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "event append failed");
                return None;
            }
        };
        if let Err(err) = self.bus.publish(&event) {
            tracing::warn!(error = %err, "event publish failed");
        }
        Some(event)
    }

    /// Compact the log through `through` and publish the checkpoint event
    /// so readers learn their cursors may now be stale.
    pub fn compact_through(&self, through: Seq0, ts: u64) -> Option<Event> {
        if let Err(err) = self.log.compact_through(through) {
            tracing::warn!(error = %err, "event compaction failed");
            return None;
        }
        self.emit(
            EventPayload::Compacted {
                through_seq: through.get(),
            },
            ts,
        )
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

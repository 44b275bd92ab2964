//! In-process pub/sub with isolated handlers and replay.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::core::{Event, Seq0};

use super::log::{EventLog, EventLogError, ReadOutcome};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus lock poisoned")]
    LockPoisoned,
    #[error("subscriber limit reached ({max_subscribers})")]
    SubscriberLimitReached { max_subscribers: usize },
    #[error(transparent)]
    Log(#[from] EventLogError),
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Synchronous pub/sub. Handler panics are caught and logged so one bad
/// subscriber cannot starve its peers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusState>>,
}

struct BusState {
    max_subscribers: usize,
    next_id: u64,
    subscribers: BTreeMap<u64, Subscriber>,
}

struct Subscriber {
    /// Topic filter; `None` receives everything.
    topic: Option<String>,
    handler: Handler,
}

/// RAII subscription: dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    bus: EventBus,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut state) = self.bus.inner.lock() {
            state.subscribers.remove(&self.id);
        }
    }
}

impl EventBus {
    pub fn new(max_subscribers: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusState {
                max_subscribers,
                next_id: 1,
                subscribers: BTreeMap::new(),
            })),
        }
    }

    /// Register a handler, optionally filtered to one declared event name.
    pub fn subscribe<F>(&self, topic: Option<&str>, handler: F) -> Result<Subscription, BusError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut state = self.lock()?;
        if state.subscribers.len() >= state.max_subscribers {
            return Err(BusError::SubscriberLimitReached {
                max_subscribers: state.max_subscribers,
            });
        }
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(
            id,
            Subscriber {
                topic: topic.map(str::to_string),
                handler: Arc::new(handler),
            },
        );
        Ok(Subscription {
            id,
            bus: self.clone(),
        })
    }

    /// Deliver the log tail from `cursor` before going live.
    ///
    /// Delivery is at-least-once: an event landing between the tail read
    /// and registration may be seen twice, never zero times.
    pub fn subscribe_with_replay<F>(
        &self,
        log: &EventLog,
        cursor: Seq0,
        topic: Option<&str>,
        handler: F,
    ) -> Result<Subscription, BusError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let replaying = Arc::clone(&handler);
        let topic_owned = topic.map(str::to_string);

        let live = {
            let topic_owned = topic_owned.clone();
            self.subscribe(topic_owned.as_deref(), move |event| (handler)(event))?
        };

        if let ReadOutcome::Events(tail) = log.read_from(cursor)? {
            for event in &tail {
                if topic_matches(topic_owned.as_deref(), event) {
                    invoke_isolated(&replaying, event);
                }
            }
        }
        Ok(live)
    }

    /// Synchronously fan an event out to all matching subscribers.
    pub fn publish(&self, event: &Event) -> Result<(), BusError> {
        let handlers: Vec<Handler> = {
            let state = self.lock()?;
            state
                .subscribers
                .values()
                .filter(|s| topic_matches(s.topic.as_deref(), event))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        for handler in handlers {
            invoke_isolated(&handler, event);
        }
        Ok(())
    }

    pub fn subscriber_count(&self) -> Result<usize, BusError> {
        Ok(self.lock()?.subscribers.len())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BusState>, BusError> {
        self.inner.lock().map_err(|_| BusError::LockPoisoned)
    }
}

fn topic_matches(topic: Option<&str>, event: &Event) -> bool {
    topic.is_none_or(|t| t == event.payload.name())
}

fn invoke_isolated(handler: &Handler, event: &Event) {
    let result = catch_unwind(AssertUnwindSafe(|| handler(event)));
    if result.is_err() {
        tracing::warn!(event = event.payload.name(), "bus handler panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::core::{EventPayload, ReplicaId, Seq1, StoreName};
    use uuid::Uuid;

    fn event(seq: u64) -> Event {
        Event::new(
            Seq1::from_u64(seq).unwrap(),
            EventPayload::StorageUpdated {
                store: StoreName::Streams,
                key: None,
                count: None,
            },
            0,
            ReplicaId::new(Uuid::from_bytes([1u8; 16])),
        )
    }

    #[test]
    fn publish_reaches_matching_subscribers() {
        let bus = EventBus::new(8);
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_all = Arc::clone(&seen);
        let _all = bus
            .subscribe(None, move |_| {
                seen_all.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let seen_other = Arc::clone(&seen);
        let _other = bus
            .subscribe(Some("pattern:detected"), move |_| {
                seen_other.fetch_add(100, Ordering::SeqCst);
            })
            .unwrap();

        bus.publish(&event(1)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_panic_does_not_starve_peers() {
        let bus = EventBus::new(8);
        let seen = Arc::new(AtomicUsize::new(0));

        let _bad = bus
            .subscribe(None, |_| panic!("subscriber bug"))
            .unwrap();
        let seen_ok = Arc::clone(&seen);
        let _ok = bus
            .subscribe(None, move |_| {
                seen_ok.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        bus.publish(&event(1)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_unsubscribes() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe(None, |_| {}).unwrap();
        assert_eq!(bus.subscriber_count().unwrap(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count().unwrap(), 0);
    }

    #[test]
    fn replay_delivers_tail_before_live() {
        let log = EventLog::new(ReplicaId::new(Uuid::from_bytes([1u8; 16])), 100);
        for _ in 0..3 {
            log.append(
                EventPayload::StorageUpdated {
                    store: StoreName::Streams,
                    key: None,
                    count: None,
                },
                0,
            )
            .unwrap();
        }

        let bus = EventBus::new(8);
        let seqs = Arc::new(Mutex::new(Vec::new()));
        let seqs_sub = Arc::clone(&seqs);
        let _sub = bus
            .subscribe_with_replay(&log, Seq0::new(1), None, move |event| {
                seqs_sub.lock().unwrap().push(event.seq.get());
            })
            .unwrap();

        let live = log
            .append(
                EventPayload::StorageUpdated {
                    store: StoreName::Streams,
                    key: None,
                    count: None,
                },
                0,
            )
            .unwrap();
        bus.publish(&live).unwrap();

        assert_eq!(*seqs.lock().unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn subscriber_limit_enforced() {
        let bus = EventBus::new(1);
        let _a = bus.subscribe(None, |_| {}).unwrap();
        assert!(matches!(
            bus.subscribe(None, |_| {}),
            Err(BusError::SubscriberLimitReached { .. })
        ));
    }
}

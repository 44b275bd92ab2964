//! Circuit breaker per named resource.

use std::sync::{Arc, Mutex};

use crate::core::error::{CoreError, ErrorKind};
use crate::core::{EventPayload, TimeSource};
use crate::eventlog::EventSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at_ms: u64,
    probe_in_flight: bool,
}

/// Failure gate: `CLOSED -> OPEN` after enough consecutive failures,
/// `OPEN -> HALF_OPEN` after the cooldown, and a single probe decides
/// whether to close or reopen.
pub struct CircuitBreaker {
    resource: String,
    failure_threshold: u32,
    cooldown_ms: u64,
    time: Arc<dyn TimeSource>,
    sink: EventSink,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(
        resource: impl Into<String>,
        failure_threshold: u32,
        cooldown_ms: u64,
        time: Arc<dyn TimeSource>,
        sink: EventSink,
    ) -> Self {
        Self {
            resource: resource.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown_ms,
            time,
            sink,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at_ms: 0,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Gate an attempt. `Ok` admits; in half-open only one probe at a time
    /// is admitted.
    pub fn check(&self) -> Result<(), CoreError> {
        let now = self.time.now_ms();
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                if now.saturating_sub(inner.opened_at_ms) >= self.cooldown_ms {
                    self.transition(&mut inner, BreakerState::HalfOpen, now);
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(self.rejection())
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.rejection())
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let now = self.time.now_ms();
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != BreakerState::Closed {
            self.transition(&mut inner, BreakerState::Closed, now);
        }
    }

    pub fn record_failure(&self) {
        let now = self.time.now_ms();
        let mut inner = self.lock();
        inner.probe_in_flight = false;
        match inner.state {
            BreakerState::HalfOpen => {
                // Failed probe reopens with a fresh cooldown.
                inner.opened_at_ms = now;
                self.transition(&mut inner, BreakerState::Open, now);
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.opened_at_ms = now;
                    self.transition(&mut inner, BreakerState::Open, now);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Run `op` under the breaker, recording the outcome.
    pub fn call<T, F>(&self, op: F) -> Result<T, CoreError>
    where
        F: FnOnce() -> Result<T, CoreError>,
    {
        self.check()?;
        match op() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                // Cancellations and validation say nothing about resource
                // health.
                if err.is_retryable() || err.kind() == ErrorKind::ServerError {
                    self.record_failure();
                } else {
                    let mut inner = self.lock();
                    inner.probe_in_flight = false;
                }
                Err(err)
            }
        }
    }

    fn rejection(&self) -> CoreError {
        CoreError::new(
            ErrorKind::Transient,
            format!("circuit open for resource `{}`", self.resource),
        )
        .with_context("resource", &self.resource)
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState, now: u64) {
        let from = inner.state;
        inner.state = to;
        tracing::info!(
            resource = %self.resource,
            from = from.as_str(),
            to = to.as_str(),
            "breaker state change"
        );
        self.sink.emit(
            EventPayload::BreakerState {
                resource: self.resource.clone(),
                state: to.as_str().to_string(),
            },
            now,
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().expect("breaker lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualTimeSource, ReplicaId};
    use crate::eventlog::{EventBus, EventLog};

    fn breaker(time: Arc<ManualTimeSource>) -> CircuitBreaker {
        let sink = EventSink::new(EventLog::new(ReplicaId::random(), 1000), EventBus::new(16));
        CircuitBreaker::new("provider", 3, 30_000, time, sink)
    }

    #[test]
    fn opens_after_failure_threshold() {
        let time = Arc::new(ManualTimeSource::at(0));
        let b = breaker(Arc::clone(&time));

        for _ in 0..2 {
            b.record_failure();
            assert_eq!(b.state(), BreakerState::Closed);
        }
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.check().is_err());
    }

    #[test]
    fn half_open_after_cooldown_single_probe() {
        let time = Arc::new(ManualTimeSource::at(0));
        let b = breaker(Arc::clone(&time));
        for _ in 0..3 {
            b.record_failure();
        }

        time.advance(29_999);
        assert!(b.check().is_err());

        time.advance(1);
        assert!(b.check().is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // Second caller is rejected while the probe is in flight.
        assert!(b.check().is_err());
    }

    #[test]
    fn successful_probe_closes() {
        let time = Arc::new(ManualTimeSource::at(0));
        let b = breaker(Arc::clone(&time));
        for _ in 0..3 {
            b.record_failure();
        }
        time.advance(30_000);
        assert!(b.check().is_ok());
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn failed_probe_reopens_with_fresh_cooldown() {
        let time = Arc::new(ManualTimeSource::at(0));
        let b = breaker(Arc::clone(&time));
        for _ in 0..3 {
            b.record_failure();
        }
        time.advance(30_000);
        assert!(b.check().is_ok());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        time.advance(29_999);
        assert!(b.check().is_err());
        time.advance(1);
        assert!(b.check().is_ok());
    }

    #[test]
    fn call_wraps_outcome_recording() {
        let time = Arc::new(ManualTimeSource::at(0));
        let b = breaker(Arc::clone(&time));

        for _ in 0..3 {
            let _ = b.call(|| -> Result<(), CoreError> {
                Err(CoreError::transient("boom"))
            });
        }
        assert_eq!(b.state(), BreakerState::Open);
    }
}

//! Timeouts and structured cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError};
use thiserror::Error;

use crate::core::error::{CoreError, ErrorKind};

/// Cooperative cancellation flag passed into every long-lived operation.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Early-out helper for loops inside long operations.
    pub fn check(&self) -> Result<(), CoreError> {
        if self.is_cancelled() {
            Err(CoreError::cancelled("operation aborted"))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("operation `{operation}` timed out after {timeout_ms}ms")]
pub struct TimeoutError {
    pub timeout_ms: u64,
    pub operation: String,
}

impl From<TimeoutError> for CoreError {
    fn from(err: TimeoutError) -> Self {
        CoreError::cancelled(err.to_string()).with_context("operation", &err.operation)
    }
}

/// Run `op` with a wall-clock budget.
///
/// The operation runs on its own thread and receives a token that is
/// cancelled when the budget expires; a timed-out operation never
/// completes into the caller. `fallback` substitutes the error result
/// when provided.
pub fn with_timeout<T, F>(
    op: F,
    timeout_ms: u64,
    operation: &str,
    fallback: Option<T>,
) -> Result<T, CoreError>
where
    T: Send + 'static,
    F: FnOnce(CancellationToken) -> Result<T, CoreError> + Send + 'static,
{
    let token = CancellationToken::new();
    let (tx, rx) = bounded::<Result<T, CoreError>>(1);
    let op_token = token.clone();
    std::thread::spawn(move || {
        let result = op(op_token);
        let _ = tx.send(result);
    });

    match rx.recv_timeout(Duration::from_millis(timeout_ms)) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
            token.cancel();
            match fallback {
                Some(value) => Ok(value),
                None => Err(TimeoutError {
                    timeout_ms,
                    operation: operation.to_string(),
                }
                .into()),
            }
        }
    }
}

/// Hooks observed by [`with_progressive_timeout`].
#[derive(Default)]
pub struct ProgressiveHooks {
    pub on_attempt: Option<Box<dyn FnMut(usize, u64) + Send>>,
    pub on_retry: Option<Box<dyn FnMut(usize) + Send>>,
}

/// Run `op` under increasing budgets, retrying only on timeout.
///
/// A non-timeout error surfaces immediately; exhausting every budget
/// returns the final timeout.
pub fn with_progressive_timeout<T, F>(
    op: F,
    budgets_ms: &[u64],
    operation: &str,
    mut hooks: ProgressiveHooks,
) -> Result<T, CoreError>
where
    T: Send + 'static,
    F: Fn(CancellationToken) -> Result<T, CoreError> + Send + Clone + 'static,
{
    assert!(!budgets_ms.is_empty(), "at least one budget required");

    let mut last_err = None;
    for (index, &budget) in budgets_ms.iter().enumerate() {
        if let Some(on_attempt) = hooks.on_attempt.as_mut() {
            on_attempt(index + 1, budget);
        }
        match with_timeout(op.clone(), budget, operation, None) {
            Ok(value) => return Ok(value),
            Err(err) if err.kind() == ErrorKind::Cancelled && is_timeout(&err) => {
                last_err = Some(err);
                if index + 1 < budgets_ms.len() {
                    if let Some(on_retry) = hooks.on_retry.as_mut() {
                        on_retry(index + 1);
                    }
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.expect("at least one attempt ran"))
}

fn is_timeout(err: &CoreError) -> bool {
    err.message().contains("timed out")
}

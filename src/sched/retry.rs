//! Resilient retry with classified errors and bounded backoff.

use std::time::Duration;

use rand::Rng;

use crate::config::Limits;
use crate::core::error::{CoreError, ErrorKind};

/// Validated retry configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub delay_cap_ms: u64,
    pub jitter_cap_ms: u64,
}

impl RetryPolicy {
    /// Build a policy, validating caller-provided knobs against limits:
    /// retries 0..=10, base-delay override 0..=60s.
    pub fn new(
        max_retries: u32,
        base_delay_override_ms: Option<u64>,
        limits: &Limits,
    ) -> Result<Self, CoreError> {
        if max_retries > limits.max_retries_cap {
            return Err(CoreError::validation(format!(
                "max_retries {max_retries} outside 0..={}",
                limits.max_retries_cap
            )));
        }
        let base_delay_ms = match base_delay_override_ms {
            Some(base) => {
                if base > limits.retry_base_delay_override_cap_ms {
                    return Err(CoreError::validation(format!(
                        "base delay {base}ms outside 0..={}ms",
                        limits.retry_base_delay_override_cap_ms
                    )));
                }
                base
            }
            None => limits.retry_base_delay_ms,
        };
        Ok(Self {
            max_retries,
            base_delay_ms,
            delay_cap_ms: limits.retry_delay_cap_ms,
            jitter_cap_ms: limits.retry_jitter_cap_ms,
        })
    }

    /// Delay before retry number `retry` (1-based): doubled base, capped,
    /// plus bounded jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        let base = self
            .base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.delay_cap_ms);
        let jitter = if self.jitter_cap_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_cap_ms)
        };
        Duration::from_millis(base + jitter)
    }
}

/// Outcome metadata alongside the result.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, CoreError>,
    pub attempts: u32,
    pub total_delay: Duration,
}

/// Run `op` with retries. The operation receives the 1-based attempt
/// number. Only `TRANSIENT`, `RATE_LIMIT`, `SERVER_ERROR`, and
/// `LEADERSHIP_LOST` retry; cancellation never does.
pub fn retry_with_backoff<T, F>(policy: &RetryPolicy, mut op: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Result<T, CoreError>,
{
    retry_with_backoff_using(policy, &mut op, |delay| std::thread::sleep(delay))
}

/// Same, with an injected sleeper (tests record delays instead of waiting).
pub fn retry_with_backoff_using<T, F, S>(
    policy: &RetryPolicy,
    op: &mut F,
    mut sleep: S,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Result<T, CoreError>,
    S: FnMut(Duration),
{
    let mut total_delay = Duration::ZERO;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op(attempt) {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    total_delay,
                };
            }
            Err(err) => {
                let retries_left = policy.max_retries.saturating_sub(attempt - 1);
                if !err.is_retryable() || retries_left == 0 {
                    if err.kind() == ErrorKind::Cancelled {
                        tracing::debug!(attempts = attempt, "operation cancelled, not retrying");
                    }
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                        total_delay,
                    };
                }
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after backoff"
                );
                total_delay += delay;
                sleep(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32, base: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: base,
            delay_cap_ms: 30_000,
            jitter_cap_ms: 100,
        }
    }

    #[test]
    fn validation_bounds_retries_and_base() {
        let limits = Limits::default();
        assert!(RetryPolicy::new(10, None, &limits).is_ok());
        assert!(RetryPolicy::new(11, None, &limits).is_err());
        assert!(RetryPolicy::new(3, Some(60_000), &limits).is_ok());
        assert!(RetryPolicy::new(3, Some(60_001), &limits).is_err());
    }

    #[test]
    fn transient_error_retries_to_success() {
        let policy = policy(2, 500);
        let mut delays = Vec::new();
        let mut calls = 0u32;
        let outcome = retry_with_backoff_using(
            &policy,
            &mut |_| {
                calls += 1;
                if calls <= 2 {
                    Err(CoreError::transient("network timeout"))
                } else {
                    Ok("ok")
                }
            },
            |d| delays.push(d),
        );

        assert_eq!(outcome.result.unwrap(), "ok");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(delays.len(), 2);
        // 500ms then 1000ms, each plus <=100ms jitter.
        assert!(delays[0] >= Duration::from_millis(500));
        assert!(delays[0] <= Duration::from_millis(600));
        assert!(delays[1] >= Duration::from_millis(1000));
        assert!(delays[1] <= Duration::from_millis(1100));
        assert!(outcome.total_delay >= Duration::from_millis(1500));
    }

    #[test]
    fn cancelled_never_retries() {
        let policy = policy(5, 10);
        let mut calls = 0u32;
        let outcome = retry_with_backoff_using(
            &policy,
            &mut |_| -> Result<(), CoreError> {
                calls += 1;
                Err(CoreError::cancelled("aborted by caller"))
            },
            |_| panic!("must not sleep"),
        );
        assert_eq!(calls, 1);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn validation_never_retries() {
        let policy = policy(5, 10);
        let mut calls = 0u32;
        let outcome = retry_with_backoff_using(
            &policy,
            &mut |_| -> Result<(), CoreError> {
                calls += 1;
                Err(CoreError::validation("bad shape"))
            },
            |_| {},
        );
        assert_eq!(calls, 1);
        assert!(outcome.result.is_err());
    }

    #[test]
    fn exhausted_retries_run_one_plus_max_executions() {
        let policy = policy(3, 1);
        let mut calls = 0u32;
        let outcome = retry_with_backoff_using(
            &policy,
            &mut |_| -> Result<(), CoreError> {
                calls += 1;
                Err(CoreError::new(ErrorKind::ServerError, "503"))
            },
            |_| {},
        );
        assert_eq!(calls, 4);
        assert_eq!(outcome.attempts, 4);
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay_ms: 1_000,
            delay_cap_ms: 30_000,
            jitter_cap_ms: 0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(16_000));
        assert_eq!(policy.delay_for(6), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(10), Duration::from_millis(30_000));
    }
}

//! Bounded retry for serialization conflicts.
//!
//! Serializable stores abort one side of a conflicting pair of
//! transactions. The aborted side is correct code that merely lost a race,
//! so the whole transaction body is run again after a jittered exponential
//! backoff. Nothing else is retried: connectivity failures and timeouts go
//! straight back to the caller.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::PhysicalError;

/// How many times, and how patiently, to retry an aborted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max_delay`, then jittered into `[delay/2, delay]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_micros() as u64;
        let jittered = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        Duration::from_micros(jittered)
    }

    fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `body` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. The last `TransactionAborted` is returned when
/// the budget runs out.
pub fn retry_on_abort<T, F>(policy: &RetryPolicy, mut body: F) -> Result<T, PhysicalError>
where
    F: FnMut() -> Result<T, PhysicalError>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match body() {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "transaction committed after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "transaction aborted, retrying: {}",
                    e
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.ceiling(0), Duration::from_millis(10));
        assert_eq!(policy.ceiling(2), Duration::from_millis(40));
        assert_eq!(policy.ceiling(10), Duration::from_millis(100));
        assert_eq!(policy.ceiling(64), Duration::from_millis(100));

        for attempt in 0..8 {
            let delay = policy.backoff(attempt);
            let ceiling = policy.ceiling(attempt);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling / 2);
        }
    }

    #[test]
    fn retries_aborts_until_success() {
        let calls = Cell::new(0);
        let result = retry_on_abort(&fast(), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(PhysicalError::TransactionAborted("40001".into()))
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry_on_abort(&fast(), || {
            calls.set(calls.get() + 1);
            Err(PhysicalError::TransactionAborted("40001".into()))
        });
        assert!(matches!(result, Err(PhysicalError::TransactionAborted(_))));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry_on_abort(&fast(), || {
            calls.set(calls.get() + 1);
            Err(PhysicalError::Unavailable("connection refused".into()))
        });
        assert!(matches!(result, Err(PhysicalError::Unavailable(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..fast()
        };
        let calls = Cell::new(0);
        let _: Result<(), _> = retry_on_abort(&policy, || {
            calls.set(calls.get() + 1);
            Err(PhysicalError::TransactionAborted("40001".into()))
        });
        assert_eq!(calls.get(), 1);
    }
}

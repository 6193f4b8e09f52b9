//! Bounded retry with backoff, shared by the challenge poll loop and the
//! orchestrator's per-task retries.

use crate::error::AcquireError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Never below 1.
    pub max_attempts: u32,
    /// Delay applied before the second attempt.
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    /// Growth factor applied to the delay for every further attempt.
    pub multiplier: f64,
    /// Hard cap on any single delay.
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    /// Adds up to half of `base_delay` of random jitter.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that waits the same `interval` between `attempts` tries.
    pub fn fixed(interval: Duration, attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            base_delay: interval,
            multiplier: 1.0,
            max_delay: interval,
            jitter: false,
        }
    }

    /// Delay to wait after the attempt with the given 0-based index failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let base = self.base_delay.as_secs_f64() * factor;
        let capped = if base.is_finite() {
            Duration::from_secs_f64(base).min(self.max_delay)
        } else {
            self.max_delay
        };

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = (self.base_delay.as_millis() / 2) as u64;
        if jitter_range_ms == 0 {
            return capped;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..jitter_range_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }

    /// [`delay_for_attempt`](Self::delay_for_attempt), stretched to any
    /// longer wait a rate limit in `err` advertises.
    pub fn delay_after(&self, attempt: u32, err: &AcquireError) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        match err {
            AcquireError::RateLimited {
                retry_after: Some(advertised),
            } => delay.max(*advertised),
            _ => delay,
        }
    }

    /// Number of attempts, never below 1.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    /// Operation succeeded.
    Success(T),
    /// Operation failed but may be attempted again.
    Retry(AcquireError),
    /// Operation failed permanently; stop immediately.
    Fail(AcquireError),
}

impl<T> RetryAction<T> {
    /// Classify a plain result using [`AcquireError::is_retryable`].
    pub fn from_result(result: Result<T, AcquireError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(e) if e.is_retryable() => Self::Retry(e),
            Err(e) => Self::Fail(e),
        }
    }
}

/// Execute an async operation under `policy`.
///
/// The closure receives the 0-based attempt number. After a `Retry` the
/// policy's delay for that attempt is slept out unless `token` is cancelled
/// first; a rate limit that advertises a longer wait gets that instead. Once attempts are exhausted the last error is returned.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T, AcquireError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let attempts = policy.attempts();
    let mut last_err = AcquireError::TransientFailure("no attempt made".to_string());

    for attempt in 0..attempts {
        if token.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }

        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if attempt + 1 >= attempts {
                    return Err(err);
                }
                let delay = policy.delay_after(attempt, &err);
                if policy.multiplier > 1.0 {
                    warn!(
                        attempt = attempt + 1,
                        max = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after failure"
                    );
                }
                last_err = err;
                tokio::select! {
                    _ = token.cancelled() => return Err(AcquireError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    Err(last_err)
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            jitter: false,
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let p = policy(10);
        assert_eq!(p.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(p.delay_for_attempt(8), Duration::from_secs(1));
        assert_eq!(p.delay_for_attempt(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let mut p = policy(5);
        p.jitter = true;
        for attempt in 0..10 {
            assert!(p.delay_for_attempt(attempt) <= p.max_delay);
        }
    }

    #[test]
    fn fixed_policy_is_flat() {
        let p = RetryPolicy::fixed(Duration::from_secs(1), 0);
        assert_eq!(p.attempts(), 1);
        assert_eq!(p.delay_for_attempt(5), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_retries() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result = retry_with_backoff(&policy(3), &token, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    RetryAction::Retry(AcquireError::TransientFailure("flaky".into()))
                } else {
                    RetryAction::Success(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_stops_immediately() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result: Result<(), _> = retry_with_backoff(&policy(5), &token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { RetryAction::from_result(Err(AcquireError::NotFound)) }
        })
        .await;
        assert!(matches!(result, Err(AcquireError::NotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let token = CancellationToken::new();
        let result: Result<(), _> = retry_with_backoff(&policy(2), &token, |n| async move {
            RetryAction::Retry(AcquireError::TransientFailure(format!("attempt {n}")))
        })
        .await;
        match result {
            Err(AcquireError::TransientFailure(msg)) => assert_eq!(msg, "attempt 1"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn advertised_retry_after_outlasts_backoff() {
        let token = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let result = retry_with_backoff(&policy(2), &token, |n| async move {
            if n == 0 {
                RetryAction::Retry(AcquireError::RateLimited {
                    retry_after: Some(Duration::from_secs(10)),
                })
            } else {
                RetryAction::Success(started.elapsed())
            }
        })
        .await;
        assert!(result.unwrap() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<(), _> = retry_with_backoff(&policy(3), &token, |_| async {
            RetryAction::Retry(AcquireError::TransientFailure("x".into()))
        })
        .await;
        assert!(matches!(result, Err(AcquireError::Cancelled)));
    }

    #[test]
    fn policy_deserializes_from_millis() {
        let p: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 4, "base_delay_ms": 250}"#).unwrap();
        assert_eq!(p.max_attempts, 4);
        assert_eq!(p.base_delay, Duration::from_millis(250));
        assert_eq!(p.multiplier, 2.0);
    }
}

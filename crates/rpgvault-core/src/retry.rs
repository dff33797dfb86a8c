//! Bounded exponential backoff for transient storage failures.
//!
//! A gateway call is attempted at most `max_attempts` times. After failed
//! attempt `n` (1-based) the worker sleeps for a delay drawn with equal
//! jitter from `[c/2, c]`, where `c = min(base * 2^(n-1), max)`. Only errors
//! that report [`StoreError::is_retryable`] are retried; everything else is
//! returned immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use rpgvault_db::StoreError;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;

/// Retry schedule for gateway calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Build a policy. `max_attempts` is clamped to at least one.
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
            base_delay,
            max_delay,
        }
    }

    /// Build a policy from the `retry` config section.
    pub const fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// A policy that never retries.
    pub const fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Total attempts including the first.
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt should follow failed attempt `attempt`.
    pub const fn should_retry(&self, attempt: u32, err: &StoreError) -> bool {
        err.is_retryable() && attempt < self.max_attempts
    }

    /// Upper bound of the delay after failed attempt `attempt` (1-based).
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let factor = 2_u64
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let ceiling = base_ms.checked_mul(factor).unwrap_or(u64::MAX).min(max_ms);
        Duration::from_millis(ceiling)
    }

    /// Jittered delay after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = u64::try_from(self.backoff_ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
        let half = ceiling.saturating_div(2);
        let jitter = rand::rng().random_range(0..=ceiling.saturating_sub(half));
        Duration::from_millis(half.saturating_add(jitter))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Bound a single gateway call by `timeout`, mapping expiry to
/// [`StoreError::Timeout`].
pub async fn with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_elapsed) => Err(StoreError::Timeout {
            elapsed_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Run `op` under `policy`.
///
/// When `cancel` is given and fires during a backoff sleep, the last error is
/// returned without further attempts. An attempt that is already running is
/// never interrupted by cancellation.
///
/// Returns the number of attempts made alongside the final result.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    mut op: F,
) -> (u32, Result<T, StoreError>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);

        let err = match op().await {
            Ok(value) => return (attempt, Ok(value)),
            Err(err) => err,
        };

        if !policy.should_retry(attempt, &err) {
            return (attempt, Err(err));
        }

        let delay = policy.delay_for(attempt);
        tracing::debug!(
            attempt,
            max_attempts = policy.max_attempts(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Retrying storage operation"
        );

        match cancel {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => {
                        tracing::debug!(attempt, "Retry backoff cancelled");
                        return (attempt, Err(err));
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn transient() -> StoreError {
        StoreError::Transient {
            message: String::from("database is locked"),
        }
    }

    #[test]
    fn ceiling_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_ceiling(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_ceiling(4), Duration::from_millis(800));
        assert_eq!(policy.backoff_ceiling(7), Duration::from_secs(5));
        assert_eq!(policy.backoff_ceiling(200), Duration::from_secs(5));
    }

    #[test]
    fn jittered_delay_stays_in_upper_half() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for(3);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
    }

    #[test]
    fn zero_attempts_clamps_to_one() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.max_attempts(), 1);
        assert!(!policy.should_retry(1, &transient()));
    }

    #[test]
    fn conflicts_are_not_retried() {
        let policy = RetryPolicy::default();
        let conflict = StoreError::Conflict {
            stored_revision: 3,
            base_revision: 1,
        };
        assert!(!policy.should_retry(1, &conflict));
        assert!(policy.should_retry(1, &transient()));
        assert!(!policy.should_retry(5, &transient()));
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);

        let (attempts, result) = run_with_retry(&policy, None, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err(transient()) } else { Ok(n) } }
        })
        .await;

        assert_eq!(attempts, 3);
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(1));
        let (attempts, result) =
            run_with_retry(&policy, None, || async {
                Err::<(), _>(transient())
            })
            .await;

        assert_eq!(attempts, 3);
        assert!(matches!(result, Err(StoreError::Transient { .. })));
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(StoreError::Timeout { elapsed_ms: 10 })));
    }

    #[tokio::test]
    async fn cancellation_stops_backoff() {
        let policy = RetryPolicy::new(5, Duration::from_secs(30), Duration::from_secs(30));
        let token = CancellationToken::new();
        token.cancel();

        let (attempts, result) =
            run_with_retry(&policy, Some(&token), || async {
                Err::<(), _>(transient())
            })
            .await;

        assert_eq!(attempts, 1);
        assert!(result.is_err());
    }
}

// =============================================================================
// Retry policy — exponential backoff with jitter for transient failures
// =============================================================================
//
// `backoff_delay` is the single backoff computation in the crate: the
// adapter's retry policy and the webhook consumer both schedule their
// retries through it.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use super::ExchangeError;

/// Delay before retry number `attempt` (0-based).
///
/// The base delay doubles per attempt (integer doubling, saturating) until it
/// hits `cap_ms`; the result is then stretched or shrunk by a factor drawn
/// uniformly from `[1 - jitter, 1 + jitter]` so concurrent sessions retrying
/// the same outage do not stampede in lockstep.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64, jitter: f64) -> Duration {
    // Shifts past 2^20 are already far beyond any sane cap.
    let exponential = base_ms.saturating_mul(1u64 << attempt.min(20));
    let capped = exponential.min(cap_ms);

    if jitter <= 0.0 {
        return Duration::from_millis(capped);
    }

    let spread = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
    Duration::from_millis((capped as f64 * spread).max(0.0) as u64)
}

/// Backoff configuration applied to every adapter call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay used as symmetric jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Run `operation`, retrying only errors classified as transient.
    ///
    /// Auth failures, rejections, and not-found errors propagate on the first
    /// occurrence — retrying them would only burn rate limit.
    pub async fn run<F, Fut, T>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = backoff_delay(
                        attempt,
                        self.base_delay_ms,
                        self.max_delay_ms,
                        self.jitter,
                    );
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient exchange error — retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: 0.0,
        }
    }

    #[test]
    fn delay_grows_exponentially_until_the_cap() {
        // No jitter: the schedule is deterministic.
        assert_eq!(backoff_delay(0, 50, 400, 0.0), Duration::from_millis(50));
        assert_eq!(backoff_delay(1, 50, 400, 0.0), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, 50, 400, 0.0), Duration::from_millis(200));
        assert_eq!(backoff_delay(3, 50, 400, 0.0), Duration::from_millis(400));
        assert_eq!(backoff_delay(9, 50, 400, 0.0), Duration::from_millis(400));
    }

    #[test]
    fn delay_survives_huge_attempt_counts() {
        // The doubling saturates instead of overflowing.
        assert_eq!(
            backoff_delay(u32::MAX, 1_000, 5_000, 0.0),
            Duration::from_millis(5_000)
        );
    }

    #[test]
    fn jitter_stays_within_the_spread_band() {
        for _ in 0..200 {
            let d = backoff_delay(4, 100, 1_000, 0.5);
            assert!(d >= Duration::from_millis(500), "below band: {d:?}");
            assert!(d <= Duration::from_millis(1_500), "above band: {d:?}");
        }
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let result = fast_policy()
            .run("test", || async { Ok::<_, ExchangeError>(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = fast_policy()
            .run("test", move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ExchangeError::Transient("flaky".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_retries_on_persistent_transient() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: Result<(), _> = fast_policy()
            .run("test", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ExchangeError::Transient("down".into()))
                }
            })
            .await;

        assert!(result.is_err());
        // Initial attempt + 3 retries.
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn auth_errors_are_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: Result<(), _> = fast_policy()
            .run("test", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ExchangeError::Auth("invalid key".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(ExchangeError::Auth(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

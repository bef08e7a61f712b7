//! Bounded exponential backoff with jitter.

use std::future::Future;
use std::time::Duration;

/// Exponential backoff calculator with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Next delay; grows by a factor of two up to `max`, plus up to 25% jitter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let capped = self.base.saturating_mul(factor).min(self.max);
        let jitter_ms = rand::random::<u64>() % (capped.as_millis() as u64 / 4 + 1);
        self.attempt = self.attempt.saturating_add(1);
        capped + Duration::from_millis(jitter_ms)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Wall-clock bound on a single attempt.
    pub attempt_timeout: Option<Duration>,
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The operation failed with an error that retrying cannot fix.
    #[error("{0}")]
    Permanent(E),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("last of {attempts} attempts timed out")]
    TimedOut { attempts: u32 },
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            attempt_timeout: None,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Run `operation` until it succeeds, fails with an error for which
    /// `retryable` returns false, or `max_attempts` is reached.
    pub async fn run<T, E, F, Fut>(
        &self,
        mut operation: F,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut backoff = Backoff::new(self.base_delay, self.max_delay);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match self.attempt_timeout {
                Some(limit) => tokio::time::timeout(limit, operation(attempt)).await.ok(),
                None => Some(operation(attempt).await),
            };

            match outcome {
                Some(Ok(value)) => return Ok(value),
                Some(Err(error)) if !retryable(&error) => return Err(RetryError::Permanent(error)),
                Some(Err(error)) if attempt >= self.max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    });
                }
                None if attempt >= self.max_attempts => {
                    return Err(RetryError::TimedOut { attempts: attempt });
                }
                Some(Err(error)) => {
                    tracing::debug!(attempt, %error, "attempt failed, backing off");
                }
                None => {
                    tracing::debug!(attempt, "attempt timed out, backing off");
                }
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_increases() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));

        let d1 = backoff.next_delay();
        let d2 = backoff.next_delay();
        let d3 = backoff.next_delay();

        assert!(d1.as_millis() >= 100);
        assert!(d2.as_millis() >= 200);
        assert!(d3.as_millis() >= 400);
    }

    #[test]
    fn backoff_caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        for _ in 0..80 {
            assert!(backoff.next_delay().as_millis() <= 625);
        }
    }

    #[test]
    fn backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert!(backoff.next_delay().as_millis() < 200);
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(50));

        let result: Result<u32, RetryError<String>> = policy
            .run(
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err("busy".to_string())
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_permanent_error_and_exhaustion() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(50));

        let permanent: Result<(), _> = policy
            .run(|_| async { Err("bad".to_string()) }, |error| error != "bad")
            .await;
        assert!(matches!(permanent, Err(RetryError::Permanent(_))));

        let exhausted: Result<(), _> = policy
            .run(|_| async { Err("busy".to_string()) }, |_| true)
            .await;
        assert!(matches!(
            exhausted,
            Err(RetryError::Exhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn run_bounds_each_attempt() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(50))
            .with_attempt_timeout(Duration::from_secs(1));

        let result: Result<(), RetryError<String>> = policy
            .run(
                |_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
                |_| true,
            )
            .await;
        assert!(matches!(result, Err(RetryError::TimedOut { attempts: 2 })));
    }
}

//! Retry policy implementation with exponential backoff

use rand::RngExt;
use rand::rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Backoff schedule for a single request
///
/// `max_attempts` counts every request, the first one included. The delay
/// before retry `k` is `initial_backoff * multiplier^(k-1)`, capped at
/// `max_backoff`; with the defaults that is 1 s, 2 s, 4 s, ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of requests
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add up to 30% random delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 7,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(64),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Default schedule with a different attempt budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Default schedule starting from a different delay
    pub fn with_initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Create retry policy from environment variables
    ///
    /// Reads `TESSERA_RETRY_MAX_ATTEMPTS`, `TESSERA_RETRY_INITIAL_BACKOFF_MS`
    /// and `TESSERA_RETRY_MAX_BACKOFF_MS`; unset or unparsable values keep
    /// their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_parse("TESSERA_RETRY_MAX_ATTEMPTS")
                .map_or(defaults.max_attempts, |n: u32| n.max(1)),
            initial_backoff: env_parse("TESSERA_RETRY_INITIAL_BACKOFF_MS")
                .map_or(defaults.initial_backoff, Duration::from_millis),
            max_backoff: env_parse("TESSERA_RETRY_MAX_BACKOFF_MS")
                .map_or(defaults.max_backoff, Duration::from_millis),
            ..defaults
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        let mut delay = Duration::from_secs_f64(capped);

        if self.jitter {
            let factor = rng().random_range(0.0..0.3);
            delay += Duration::from_secs_f64(capped * factor);
        }

        delay
    }

    /// Execute a function with retry logic
    pub async fn execute<F, Fut, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;

        loop {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.should_retry() || attempt >= self.max_attempts => {
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    if e.is_transient() {
                        tracing::debug!("Attempt {attempt} failed: {e}, retrying in {delay:?}");
                    } else {
                        tracing::warn!("Attempt {attempt} failed: {e}, retrying in {delay:?}");
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
#[allow(
    unsafe_code,
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::significant_drop_tightening
)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use reqwest::StatusCode;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_initial_backoff(Duration::from_millis(1))
    }

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(6), Duration::from_secs(32));
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy {
            max_backoff: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay < Duration::from_millis(2600));
        }
    }

    #[test]
    fn test_from_env() {
        let vars = [
            "TESSERA_RETRY_MAX_ATTEMPTS",
            "TESSERA_RETRY_INITIAL_BACKOFF_MS",
            "TESSERA_RETRY_MAX_BACKOFF_MS",
        ];
        for var in vars {
            unsafe {
                std::env::remove_var(var);
            }
        }
        assert_eq!(RetryPolicy::from_env(), RetryPolicy::default());

        unsafe {
            std::env::set_var("TESSERA_RETRY_MAX_ATTEMPTS", "3");
            std::env::set_var("TESSERA_RETRY_INITIAL_BACKOFF_MS", "250");
            std::env::set_var("TESSERA_RETRY_MAX_BACKOFF_MS", "not-a-number");
        }
        let policy = RetryPolicy::from_env();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(250));
        assert_eq!(policy.max_backoff, RetryPolicy::default().max_backoff);

        for var in vars {
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    #[tokio::test]
    async fn test_execute_success_on_first_try() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = fast_policy(3)
            .execute(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ProtocolError>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = fast_policy(4)
            .execute(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ProtocolError::HttpStatus(StatusCode::NOT_FOUND))
                }
            })
            .await;

        assert!(matches!(result, Err(ProtocolError::HttpStatus(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_execute_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = fast_policy(7)
            .execute(|| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProtocolError::Timeout)
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_stops_on_unretryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = fast_policy(7)
            .execute(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ProtocolError::NoBaseUrls)
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_waits_between_attempts() {
        let start = tokio::time::Instant::now();
        let result: Result<()> = RetryPolicy::default()
            .with_max_attempts(3)
            .execute(|| async { Err(ProtocolError::Timeout) })
            .await;

        assert!(result.is_err());
        // 1 s after the first failure, 2 s after the second
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}

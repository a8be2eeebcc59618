//! Bounded exponential backoff, applied by the gateway to every call.
//!
//! Only transient kinds (rate-limited, unavailable) are retried. Everything
//! else is returned to the caller on the first failure.

use std::future::Future;
use std::time::Duration;
use warden_core::error::ApiResult;
use warden_core::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based), capped at `max_delay`.
    /// Products too large (or not finite) for a `Duration` saturate to the cap.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Runs `call` until it succeeds, fails with a non-transient kind, or
    /// attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> ApiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.kind.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        kind = %e.kind,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(cfg: RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            multiplier: cfg.multiplier,
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use warden_core::{ApiError, ErrorKind};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn long_retry_budgets_saturate_at_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 100,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(policy.delay_for(70), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2000), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));

        let unbounded = RetryPolicy { multiplier: f64::INFINITY, ..policy };
        assert_eq!(unbounded.delay_for(3), Duration::from_secs(30));
        assert_eq!(RetryPolicy::none().delay_for(u32::MAX), Duration::ZERO);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = fast(5)
            .run("op", || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ApiError::new("op", ErrorKind::RateLimited, "429"))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: ApiResult<()> = fast(3)
            .run("op", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::new("op", ErrorKind::Unavailable, "503"))
            })
            .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Unavailable);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_fails_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: ApiResult<()> = fast(5)
            .run("op", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::new("op", ErrorKind::StaleToken, "etag"))
            })
            .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::StaleToken);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

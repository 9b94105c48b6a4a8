//! Shared upstream fetch utilities: retry policy and response handling.
//!
//! Every source fetcher runs its HTTP attempt through [`with_retry`], so
//! timeouts, backoff and error classification behave the same for both
//! networks.

use core::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{AffiliateError, Result};

/// Default number of attempts per fetch.
const DEFAULT_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound for a single backoff delay.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default timeout for a single attempt.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded exponential-backoff retry policy with a per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub attempts: u32,
    /// Delay before the first retry; doubled for every further retry.
    pub base_delay: Duration,
    /// Cap applied to every computed delay.
    pub max_delay: Duration,
    /// Timeout of a single attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the failed attempt number `attempt` (1-based):
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    #[inline]
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }
}

/// Runs `attempt` until it succeeds, fails permanently or the policy is
/// exhausted.
///
/// Each attempt is bounded by [`RetryPolicy::timeout`]; an elapsed
/// timeout becomes [`AffiliateError::Timeout`]. Only errors for which
/// [`AffiliateError::is_transient`] holds are retried. After the last
/// attempt the last error is returned unchanged.
///
/// # Errors
///
/// Returns the error of the final attempt, or the first non-transient
/// error.
#[inline]
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, label: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut current = 1_u32;
    loop {
        let outcome = match tokio::time::timeout(policy.timeout, attempt()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(AffiliateError::Timeout(policy.timeout)),
        };
        match outcome {
            Ok(value) => {
                if current > 1 {
                    debug!(label, attempt = current, "upstream fetch recovered");
                }
                return Ok(value);
            }
            Err(err) if current < attempts && err.is_transient() => {
                let delay = policy.backoff(current);
                warn!(
                    label,
                    attempt = current,
                    max_attempts = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "upstream fetch failed, retrying"
                );
                tokio::time::sleep(delay).await;
                current += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Sends `request` and returns the response body as text.
///
/// # Errors
///
/// Returns [`AffiliateError::Http`] on transport failure,
/// [`AffiliateError::Api`] on a non-success status and
/// [`AffiliateError::EmptyResponse`] when the body is blank.
#[inline]
pub async fn fetch_text(request: reqwest::RequestBuilder) -> Result<String> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_owned());
        return Err(AffiliateError::Api {
            status: status.as_u16(),
            message,
        });
    }
    let body = response.text().await?;
    if body.trim().is_empty() {
        return Err(AffiliateError::EmptyResponse);
    }
    Ok(body)
}

/// Builds the default HTTP client used by the source fetchers.
///
/// # Errors
///
/// Returns [`AffiliateError::Http`] if the client cannot be constructed.
#[inline]
pub fn default_http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(concat!("affiliate-catalog/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = fast_policy(5);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_secs(1));
        assert_eq!(policy.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.timeout, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = with_retry(fast_policy(3), "test", || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(AffiliateError::EmptyResponse)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_after_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = with_retry(fast_policy(3), "test", || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err(AffiliateError::Api {
                    status: 500 + u16::try_from(n).unwrap(),
                    message: "boom".to_owned(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(AffiliateError::Api { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = with_retry(fast_policy(3), "test", || {
            let _previous = counter.fetch_add(1, Ordering::SeqCst);
            async { Err(AffiliateError::Config("no token".to_owned())) }
        })
        .await;
        assert!(matches!(result, Err(AffiliateError::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out() {
        let policy = RetryPolicy {
            attempts: 2,
            timeout: Duration::from_millis(50),
            ..fast_policy(2)
        };
        let result: Result<()> = with_retry(policy, "test", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(AffiliateError::Timeout(d)) if d == Duration::from_millis(50)));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_tries_once() {
        let result = with_retry(fast_policy(0), "test", || async { Ok(7_u8) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}

//! Retry policy for coordination requests
//!
//! Delays grow linearly (`base_delay × attempt`). Client errors (4xx) are
//! permanent and returned at once; everything else is retried until the
//! budget runs out.

use crate::error::{AscError, Result};
use std::time::Duration;
use tracing::Span;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Delay unit; the nth retry waits `n × base_delay`
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Builder: set retry budget
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Builder: set base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        self.base_delay.saturating_mul(attempt as u32)
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

/// Execute an async operation under `policy`.
///
/// # Errors
///
/// Returns a permanent error unchanged, or [`AscError::RetriesExhausted`]
/// wrapping the last failure once the budget is spent.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, span: &Span, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
        }

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_permanent() => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt > policy.max_retries {
                    return Err(AscError::RetriesExhausted {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                tracing::debug!(parent: span, attempt, error = %e, "request failed, retrying");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::default().with_base_delay(Duration::from_millis(5))
    }

    #[test]
    fn test_linear_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(3));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[tokio::test]
    async fn test_eventual_success() {
        let attempts = AtomicUsize::new(0);
        let result = with_retry(&fast(), &Span::none(), || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(AscError::Http { status: 503, body: "busy".into() })
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(tokio_test::assert_ok!(result), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let attempts = AtomicUsize::new(0);
        let result: Result<()> = with_retry(&fast(), &Span::none(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(AscError::Http { status: 404, body: "no such agent".into() }) }
        })
        .await;

        let err = tokio_test::assert_err!(result);
        assert_eq!(err.status(), Some(404));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_wraps_attempt_count() {
        let attempts = AtomicUsize::new(0);
        let result: Result<()> = with_retry(&fast(), &Span::none(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(AscError::Other("connection refused".into())) }
        })
        .await;

        match result {
            Err(AscError::RetriesExhausted { attempts: n, source }) => {
                assert_eq!(n, 4);
                assert!(source.to_string().contains("connection refused"));
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_between_attempts() {
        let start = tokio::time::Instant::now();
        let _: Result<()> = with_retry(&RetryPolicy::default(), &Span::none(), || async {
            Err(AscError::Other("down".into()))
        })
        .await;
        // 1s + 2s + 3s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));
    }
}

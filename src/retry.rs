//! Bounded retry with an injectable sleep strategy.
//!
//! Provider calls are retried on a structured error classification rather
//! than on error-message text. Tests swap the sleeper for a no-op so retry
//! and timeout paths run in microseconds without touching global state.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use log::debug;

/// Future returned by [`Sleeper::sleep`].
pub type SleepFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Strategy for waiting between attempts.
pub trait Sleeper: Send + Sync {
    /// Suspends the caller for `duration`.
    fn sleep(&self, duration: Duration) -> SleepFuture<'_>;
}

/// Sleeper backed by the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Sleeper that returns immediately. For tests only.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSleeper;

impl Sleeper for NoopSleeper {
    fn sleep(&self, _duration: Duration) -> SleepFuture<'_> {
        Box::pin(std::future::ready(()))
    }
}

/// Budgeted exponential backoff applied around retryable operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total time allowed across all attempts.
    pub max_elapsed: Duration,
    /// Delay before the second attempt.
    pub initial_interval: Duration,
    /// Upper bound for any single delay.
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_elapsed: Duration::from_secs(600),
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Builds a policy with the given total budget, keeping default backoff
    /// intervals.
    #[must_use]
    pub fn with_max_elapsed(max_elapsed: Duration) -> Self {
        Self {
            max_elapsed,
            ..Self::default()
        }
    }

    /// Delay to wait after the given zero-based attempt number.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let doubled = self
            .initial_interval
            .checked_mul(1_u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.max_interval);
        doubled.min(self.max_interval)
    }
}

/// Outcome detail carried when a retry budget is exhausted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryExhausted {
    /// Operation label used in logs.
    pub operation: String,
    /// Number of attempts made.
    pub attempts: u32,
    /// Wall time spent across attempts.
    pub elapsed: Duration,
}

/// Runs `operation` until it succeeds, fails fatally, or the budget expires.
///
/// `is_retryable` classifies errors; a non-retryable error propagates on the
/// spot. When the budget expires, the final error is returned to the caller
/// together with [`RetryExhausted`] detail.
///
/// # Errors
///
/// Returns the last error produced by `operation`, paired with exhaustion
/// detail when retries were given up rather than the error being fatal.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    label: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, (E, Option<RetryExhausted>)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !is_retryable(&err) => return Err((err, None)),
            Err(err) => {
                let elapsed = started.elapsed();
                if elapsed >= policy.max_elapsed {
                    return Err((
                        err,
                        Some(RetryExhausted {
                            operation: label.to_owned(),
                            attempts: attempt + 1,
                            elapsed,
                        }),
                    ));
                }
                let delay = policy.backoff_for_attempt(attempt);
                debug!("{label}: transient failure on attempt {}, retrying in {delay:?}", attempt + 1);
                sleeper.sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone, Debug, Eq, PartialEq)]
    enum FakeError {
        Transient,
        Fatal,
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_elapsed: Duration::from_millis(50),
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry(
            &policy(),
            &NoopSleeper,
            "op",
            |err: &FakeError| *err == FakeError::Transient,
            move || {
                let tally = Arc::clone(&counter);
                async move {
                    if tally.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(FakeError::Transient)
                    } else {
                        Ok(7)
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32, _> = retry(
            &policy(),
            &NoopSleeper,
            "op",
            |err: &FakeError| *err == FakeError::Transient,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(FakeError::Fatal) }
            },
        )
        .await;
        let (err, exhausted) = result.expect_err("fatal should propagate");
        assert_eq!(err, FakeError::Fatal);
        assert!(exhausted.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_reports_attempts() {
        let result: Result<u32, _> = retry(
            &RetryPolicy {
                max_elapsed: Duration::from_millis(0),
                ..policy()
            },
            &NoopSleeper,
            "create_disk",
            |_: &FakeError| true,
            || async { Err(FakeError::Transient) },
        )
        .await;
        let (err, exhausted) = result.expect_err("budget should expire");
        assert_eq!(err, FakeError::Transient);
        let detail = exhausted.expect("exhaustion detail");
        assert_eq!(detail.operation, "create_disk");
        assert_eq!(detail.attempts, 1);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let p = RetryPolicy {
            max_elapsed: Duration::from_secs(60),
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(5),
        };
        assert_eq!(p.backoff_for_attempt(0), Duration::from_secs(1));
        assert_eq!(p.backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(p.backoff_for_attempt(2), Duration::from_secs(4));
        assert_eq!(p.backoff_for_attempt(3), Duration::from_secs(5));
        assert_eq!(p.backoff_for_attempt(31), Duration::from_secs(5));
    }
}

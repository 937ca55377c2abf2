//! Reconnect and timeout utilities.
//!
//! The session core never retries on its own. These helpers exist for the
//! caller that owns reconnect policy (the command line front end), plus the
//! timeout wrapper used to bound connect and handshake phases.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

/// Policy controlling reconnect attempts and exponential backoff behavior.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Backoff suited to re-opening a caster session after a dropped link.
    ///
    /// `retries` is the number of reconnects after the first attempt.
    pub fn reconnect(retries: usize) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter: Duration::from_millis(500),
        }
    }

    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 1-based and should correspond to the attempt that just
    /// failed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `should_retry` determines whether each
/// error is retryable.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    op: Op,
    should_retry: ShouldRetry,
) -> Result<T, E>
where
    E: Display,
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    match retry_until(policy, op, should_retry, std::future::pending::<()>()).await {
        Some(result) => result,
        None => unreachable!("a pending future never cancels"),
    }
}

/// Like [`retry_async`], but gives up as soon as `cancel` resolves.
///
/// Both the running attempt and the backoff sleep are abandoned on cancel,
/// in which case `None` is returned.
pub async fn retry_until<T, E, Op, Fut, ShouldRetry, Cancel>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
    cancel: Cancel,
) -> Option<Result<T, E>>
where
    E: Display,
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
    Cancel: Future<Output = ()>,
{
    let max_attempts = policy.max_attempts.max(1);
    tokio::pin!(cancel);

    for attempt in 1..=max_attempts {
        let outcome = tokio::select! {
            outcome = op(attempt) => outcome,
            _ = &mut cancel => return None,
        };

        match outcome {
            Ok(value) => return Some(Ok(value)),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Some(Err(error));
                }

                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    event = "reconnect_scheduled",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error
                );
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut cancel => return None,
                    }
                }
            }
        }
    }

    unreachable!("max_attempts is always at least 1")
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{retry_async, retry_until, with_timeout, RetryPolicy};
    use crate::error::NtripError;

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            jitter: Duration::from_millis(0),
        }
    }

    #[test]
    fn reconnects_after_interrupted_stream() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let calls = Arc::new(AtomicUsize::new(0));

            let result = retry_async(
                &fast_policy(3),
                {
                    let calls = Arc::clone(&calls);
                    move |_| {
                        let calls = Arc::clone(&calls);
                        async move {
                            let value = calls.fetch_add(1, Ordering::SeqCst);
                            if value < 2 {
                                Err(NtripError::StreamInterrupted(io::Error::from(
                                    io::ErrorKind::ConnectionReset,
                                )))
                            } else {
                                Ok("streamed")
                            }
                        }
                    }
                },
                NtripError::is_retryable,
            )
            .await;

            assert_eq!(result.expect("success"), "streamed");
            assert_eq!(calls.load(Ordering::SeqCst), 3);
        });
    }

    #[test]
    fn stops_on_bad_credentials() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let calls = Arc::new(AtomicUsize::new(0));

            let result: Result<(), NtripError> = retry_async(
                &fast_policy(5),
                {
                    let calls = Arc::clone(&calls);
                    move |_| {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err(NtripError::AuthenticationFailed {
                                status_line: "HTTP/1.1 401 Unauthorized".to_string(),
                            })
                        }
                    }
                },
                NtripError::is_retryable,
            )
            .await;

            assert!(matches!(
                result.expect_err("expected failure"),
                NtripError::AuthenticationFailed { .. }
            ));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn reconnect_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            jitter: Duration::ZERO,
            ..RetryPolicy::reconnect(10)
        };
        assert_eq!(policy.max_attempts, 11);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn cancel_during_backoff_returns_promptly() {
        let policy = RetryPolicy {
            jitter: Duration::ZERO,
            ..RetryPolicy::reconnect(10)
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let started = tokio::time::Instant::now();

        let result: Option<Result<(), NtripError>> = retry_until(
            &policy,
            {
                let calls = Arc::clone(&calls);
                move |_| {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(NtripError::StreamInterrupted(io::Error::from(
                            io::ErrorKind::ConnectionReset,
                        )))
                    }
                }
            },
            NtripError::is_retryable,
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await;

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn cancel_abandons_a_running_attempt() {
        let result: Option<Result<(), NtripError>> = retry_until(
            &RetryPolicy::none(),
            |_| std::future::pending(),
            NtripError::is_retryable,
            tokio::time::sleep(Duration::from_millis(20)),
        )
        .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn with_timeout_reports_elapsed() {
        let result = with_timeout(Duration::from_millis(10), std::future::pending::<()>()).await;
        assert!(result.is_err());
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Timeout-and-retry combinator independent of any transport.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Number of attempts, retried back to back.
    Immediate(u32),
    /// Number of attempts, and milliseconds to wait between them.
    LinearBackoff(u32, u64),
}

impl RetryStrategy {
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::Immediate(attempts) | Self::LinearBackoff(attempts, _) => (*attempts).max(1),
        }
    }

    pub fn backoff(&self) -> Duration {
        match self {
            Self::Immediate(_) => Duration::ZERO,
            Self::LinearBackoff(_, delay_ms) => Duration::from_millis(*delay_ms),
        }
    }
}

/// Why a single attempt did not succeed.
#[derive(Debug, PartialEq, Eq)]
pub enum AttemptFailure<E> {
    TimedOut,
    Failed(E),
}

/// Final outcome of a retry loop that never succeeded.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryFailure<E> {
    Exhausted {
        attempts: u32,
        last: AttemptFailure<E>,
    },
    Cancelled {
        attempts: u32,
    },
}

/// Runs an attempt under a per-attempt deadline until it succeeds, the
/// strategy's attempts are spent, or the token is cancelled.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    pub deadline: Duration,
    pub strategy: RetryStrategy,
}

impl Retry {
    pub fn new(deadline: Duration, strategy: RetryStrategy) -> Self {
        Self { deadline, strategy }
    }

    /// Calls `attempt` with the 1-based attempt number.
    ///
    /// An attempt still running at the deadline is dropped. Cancellation is
    /// checked before each attempt and during backoff, never mid-attempt.
    /// On success returns the value and the number of attempts made.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<(T, u32), RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.strategy.max_attempts();
        let backoff = self.strategy.backoff();
        let mut last = AttemptFailure::TimedOut;

        for n in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(RetryFailure::Cancelled { attempts: n - 1 });
            }
            match tokio::time::timeout(self.deadline, attempt(n)).await {
                Ok(Ok(value)) => return Ok((value, n)),
                Ok(Err(e)) => last = AttemptFailure::Failed(e),
                Err(_) => last = AttemptFailure::TimedOut,
            }
            debug!("Attempt {}/{} failed", n, max_attempts);

            if n < max_attempts && !backoff.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(RetryFailure::Cancelled { attempts: n }),
                }
            }
        }

        Err(RetryFailure::Exhausted {
            attempts: max_attempts,
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    const DEADLINE: Duration = Duration::from_millis(1000);

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_times_out_after_every_attempt() {
        let retry = Retry::new(DEADLINE, RetryStrategy::Immediate(3));
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result: Result<((), u32), RetryFailure<()>> = retry
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::pending()
            })
            .await;

        assert_eq!(
            result,
            Err(RetryFailure::Exhausted {
                attempts: 3,
                last: AttemptFailure::TimedOut
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= DEADLINE * 3 && elapsed < DEADLINE * 3 + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_stops_further_attempts() {
        let retry = Retry::new(DEADLINE, RetryStrategy::Immediate(3));
        let calls = Arc::new(AtomicU32::new(0));

        let result = retry
            .run(&CancellationToken::new(), |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        tokio::time::sleep(DEADLINE * 2).await;
                    }
                    Ok::<_, ()>(n * 10)
                }
            })
            .await;

        assert_eq!(result, Ok((20, 2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_error_is_reported() {
        let retry = Retry::new(DEADLINE, RetryStrategy::Immediate(2));
        let result: Result<((), u32), _> = retry
            .run(&CancellationToken::new(), |n| async move { Err(n) })
            .await;
        assert_eq!(
            result,
            Err(RetryFailure::Exhausted {
                attempts: 2,
                last: AttemptFailure::Failed(2)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_backoff_waits_between_attempts() {
        let retry = Retry::new(DEADLINE, RetryStrategy::LinearBackoff(3, 250));
        let start = Instant::now();
        let result: Result<((), u32), _> = retry
            .run(&CancellationToken::new(), |_| async { Err("refused") })
            .await;
        assert!(matches!(result, Err(RetryFailure::Exhausted { attempts: 3, .. })));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(550));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_between_attempts() {
        let retry = Retry::new(DEADLINE, RetryStrategy::Immediate(3));
        let cancel = CancellationToken::new();

        let result: Result<((), u32), RetryFailure<()>> = retry
            .run(&cancel, |n| {
                let cancel = cancel.clone();
                async move {
                    if n == 2 {
                        cancel.cancel();
                    }
                    std::future::pending().await
                }
            })
            .await;

        // the in-flight attempt runs to its deadline before the loop stops
        assert_eq!(result, Err(RetryFailure::Cancelled { attempts: 2 }));
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        assert_eq!(RetryStrategy::Immediate(0).max_attempts(), 1);
        assert_eq!(RetryStrategy::LinearBackoff(4, 20).backoff(), Duration::from_millis(20));
    }
}

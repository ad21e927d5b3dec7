//! Exponential backoff with jitter.
//!
//! Used by the [`crate::RetryingInvoker`] for throttled agent calls. Attempt
//! numbers are zero-based: the delay after attempt `n` fails is
//! `base_delay * 2^n + uniform(0, jitter)`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use pipeline::{Clock, EngineConfig, Timestamp};

/// Exponent cap; keeps `2^n` from overflowing on absurd attempt counts.
const MAX_EXPONENT: u32 = 20;

/// Attempt budget and delay schedule for retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound of the uniform jitter; zero disables it.
    pub jitter: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: config.base_delay,
            jitter: config.jitter,
        }
    }

    /// Deterministic part of the delay after attempt `attempt` fails.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.min(MAX_EXPONENT))
    }

    /// Full delay after attempt `attempt` fails, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay_for(attempt) + random_jitter(self.jitter)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

fn random_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let fraction: f64 = rand::thread_rng().gen_range(0.0..1.0);
    max.mul_f64(fraction)
}

/// One backoff wait between two attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffEvent {
    /// Zero-based attempt that failed and triggered the wait.
    pub attempt: u32,
    pub delay: Duration,
}

/// Successful outcome of [`retry_with_backoff`].
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    pub backoff: Vec<BackoffEvent>,
}

/// Why [`retry_with_backoff`] gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryFailure<E> {
    /// The operation failed with an error the predicate does not retry.
    Terminal { error: E, attempts: u32 },
    /// Every attempt failed with a retryable error.
    Exhausted { last_error: E, attempts: u32 },
    /// The next backoff would end past the deadline.
    DeadlineExceeded { last_error: Option<E>, attempts: u32 },
    /// The cancellation token fired.
    Cancelled { attempts: u32 },
}

/// Per-call limits layered on top of the policy.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Absolute instant after which no further attempt starts.
    pub deadline: Option<Timestamp>,
    pub cancel: CancellationToken,
}

impl InvokeOptions {
    pub fn with_deadline(mut self, deadline: Timestamp) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Runs `op` until it succeeds, fails terminally, or the budget runs out.
///
/// `op` receives the zero-based attempt number. Between attempts the caller
/// sleeps on `clock` for [`BackoffPolicy::delay_for`]; the sleep is cut short
/// by cancellation.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    clock: &dyn Clock,
    policy: &BackoffPolicy,
    label: &str,
    is_retryable: P,
    options: &InvokeOptions,
    mut op: F,
) -> Result<Retried<T>, RetryFailure<E>>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = Vec::new();
    let mut attempt = 0;
    loop {
        if options.cancel.is_cancelled() {
            return Err(RetryFailure::Cancelled { attempts: attempt });
        }
        if let Some(deadline) = options.deadline {
            if clock.now() >= deadline {
                return Err(RetryFailure::DeadlineExceeded {
                    last_error: None,
                    attempts: attempt,
                });
            }
        }

        let error = match op(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt + 1,
                    backoff,
                })
            }
            Err(error) => error,
        };
        let attempts = attempt + 1;

        if !is_retryable(&error) {
            return Err(RetryFailure::Terminal { error, attempts });
        }
        if attempts >= max_attempts {
            return Err(RetryFailure::Exhausted {
                last_error: error,
                attempts,
            });
        }

        let delay = policy.delay_for(attempt);
        if let Some(deadline) = options.deadline {
            if clock.now().saturating_add(delay) > deadline {
                return Err(RetryFailure::DeadlineExceeded {
                    last_error: Some(error),
                    attempts,
                });
            }
        }

        warn!(
            label,
            attempt = attempts,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retryable failure; backing off"
        );
        backoff.push(BackoffEvent { attempt, delay });
        tokio::select! {
            _ = clock.sleep(delay) => {}
            _ = options.cancel.cancelled() => {
                return Err(RetryFailure::Cancelled { attempts });
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::MonotonicClock;

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_secs(1),
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn delays_double_per_attempt() {
        let policy = policy(5);
        let delays: Vec<_> = (0..4).map(|n| policy.delay_for(n)).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            jitter: Duration::from_secs(1),
            ..policy(5)
        };
        for attempt in 0..4 {
            let delay = policy.delay_for(attempt);
            let base = policy.base_delay_for(attempt);
            assert!(delay >= base);
            assert!(delay < base + Duration::from_secs(1));
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let delay = policy(5).base_delay_for(u32::MAX);
        assert!(delay >= Duration::from_secs(1 << 20));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_and_reports_backoff() {
        let clock = MonotonicClock::new();
        let start = clock.now();
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(
            &clock,
            &policy(5),
            "test",
            |_: &String| true,
            &InvokeOptions::default(),
            |_| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err("throttled".to_string())
                } else {
                    Ok("done")
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result.value, "done");
        assert_eq!(result.attempts, 4);
        let delays: Vec<_> = result.backoff.iter().map(|e| e.delay).collect();
        assert_eq!(delays, [1, 2, 4].map(Duration::from_secs).to_vec());
        assert_eq!(clock.now().saturating_since(start), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_stop_immediately() {
        let clock = MonotonicClock::new();
        let calls = AtomicU32::new(0);
        let result: Result<Retried<()>, _> = retry_with_backoff(
            &clock,
            &policy(5),
            "test",
            |e: &String| e == "throttled",
            &InvokeOptions::default(),
            |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("bad request".to_string())
            },
        )
        .await;

        assert_eq!(
            result.unwrap_err(),
            RetryFailure::Terminal {
                error: "bad request".to_string(),
                attempts: 1
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_the_budget_makes_exactly_max_attempts() {
        let clock = MonotonicClock::new();
        let calls = AtomicU32::new(0);
        let result: Result<Retried<()>, _> = retry_with_backoff(
            &clock,
            &policy(5),
            "test",
            |_: &String| true,
            &InvokeOptions::default(),
            |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("throttled".to_string())
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(RetryFailure::Exhausted { attempts: 5, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_prevents_a_backoff_that_would_overrun() {
        let clock = MonotonicClock::new();
        let options = InvokeOptions::default().with_deadline(clock.now().saturating_add(Duration::from_secs(2)));
        let result: Result<Retried<()>, _> = retry_with_backoff(
            &clock,
            &policy(5),
            "test",
            |_: &String| true,
            &options,
            |_| async { Err("throttled".to_string()) },
        )
        .await;

        // Attempt 0 backs off 1s; attempt 1 would need 2s more and overrun.
        assert!(matches!(
            result,
            Err(RetryFailure::DeadlineExceeded { attempts: 2, last_error: Some(_) })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let clock = MonotonicClock::new();
        let cancel = CancellationToken::new();
        let options = InvokeOptions::default().with_cancel(cancel.clone());
        let trigger = cancel.clone();
        let result: Result<Retried<()>, _> = retry_with_backoff(
            &clock,
            &policy(5),
            "test",
            |_: &String| true,
            &options,
            |_| {
                trigger.cancel();
                async { Err("throttled".to_string()) }
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), RetryFailure::Cancelled { attempts: 1 });
    }
}

//! Engine-level errors and the transient-failure retry used by every component
//! that writes to a store.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use pipeline::{Clock, ConfigError, JobId, RetryPolicy, StoreError};

use crate::fsm::InvalidTransition;

/// Errors returned by the [`crate::OrchestrationController`] entry points.
///
/// Stage failures and validation rejections are *not* errors: they are
/// reported through [`pipeline::JobResult::status`]. These variants cover the
/// conditions under which no trustworthy result can be produced.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An audit, artifact or job record could not be written or read.
    #[error("Persistence failure during {operation}: {message}")]
    Persistence {
        /// What was being persisted (e.g. `"audit begin"`).
        operation: &'static str,
        /// Underlying failure.
        message: String,
    },

    /// No job with the given identifier exists.
    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: JobId },

    /// The controller attempted a transition its table does not allow.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// The engine configuration is invalid.
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

impl EngineError {
    /// Wraps any failure as a [`EngineError::Persistence`] for `operation`.
    pub fn persistence(operation: &'static str, err: impl std::fmt::Display) -> Self {
        EngineError::Persistence {
            operation,
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Transient-failure retry
// ---------------------------------------------------------------------------

/// Attempts made for an operation that keeps failing transiently.
pub(crate) const STORE_ATTEMPTS: u32 = 3;

/// Errors that can signal "try again shortly".
pub(crate) trait TransientFailure: std::fmt::Display {
    /// Fixed pause before retrying, or `None` if the failure is not transient.
    fn transient_backoff(&self) -> Option<Duration>;
}

impl TransientFailure for StoreError {
    fn transient_backoff(&self) -> Option<Duration> {
        match self.retry_policy() {
            RetryPolicy::Retryable { after: Some(after) } => Some(after),
            _ => None,
        }
    }
}

/// Runs `op`, retrying transient store failures with a short fixed backoff.
///
/// Separate from the throttling policy of [`crate::RetryingInvoker`]: the delay
/// never grows and the attempt budget is small.
pub(crate) async fn retry_transient<T, E, F, Fut>(
    clock: &dyn Clock,
    operation: &'static str,
    mut op: F,
) -> Result<T, E>
where
    E: TransientFailure,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if attempt < STORE_ATTEMPTS => match err.transient_backoff() {
                Some(delay) => {
                    warn!(operation, attempt, error = %err, "transient store failure; retrying");
                    clock.sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(err),
            },
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::MonotonicClock;

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_fixed_backoff() {
        let clock = MonotonicClock::new();
        let start = clock.now();
        let calls = AtomicU32::new(0);
        let result: Result<u32, StoreError> = retry_transient(&clock, "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Transient {
                    message: "busy".into(),
                })
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            clock.now().saturating_since(start),
            pipeline::TRANSIENT_STORE_BACKOFF * 2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let clock = MonotonicClock::new();
        let calls = AtomicU32::new(0);
        let result: Result<u32, StoreError> = retry_transient(&clock, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable {
                message: "down".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(StoreError::Unavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let clock = MonotonicClock::new();
        let calls = AtomicU32::new(0);
        let result: Result<u32, StoreError> = retry_transient(&clock, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Transient {
                message: "still busy".into(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), STORE_ATTEMPTS);
    }
}

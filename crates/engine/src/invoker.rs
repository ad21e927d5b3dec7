//! Retrying invoker: the only path by which the engine calls a remote agent.
//!
//! Every attempt, including each retry, first takes a permit from the
//! [`GlobalRateLimiter`]. Throttling errors are retried with exponential
//! backoff; anything else fails the invocation after a single attempt. The
//! deadline in [`InvokeOptions`] also bounds the rate-limit wait, so no
//! attempt reaches the agent at or after it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use pipeline::{CallerId, Clock, EngineConfig, Stage, StageError, StageExecutor, StageRequest};

use crate::rate_limiter::{AcquireAborted, GlobalRateLimiter};
use crate::retry::{retry_with_backoff, BackoffEvent, BackoffPolicy, InvokeOptions, RetryFailure};

/// Successful logical call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Raw response text from the agent.
    pub response: String,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Backoff waits between attempts, in order.
    pub backoff: Vec<BackoffEvent>,
    /// Time spent waiting on the rate limiter across all attempts.
    pub rate_limit_wait: Duration,
    /// Wall-clock duration of the whole logical call.
    pub elapsed: Duration,
}

/// A logical call that did not produce a response.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvokeError {
    /// The agent failed with a non-throttling error.
    #[error("{stage} failed: {message}")]
    Terminal {
        stage: Stage,
        message: String,
        attempts: u32,
    },

    /// Every attempt was throttled.
    #[error("{stage} still throttled after {attempts} attempts: {last_error}")]
    Exhausted {
        stage: Stage,
        attempts: u32,
        last_error: String,
    },

    /// The stage deadline passed before a response arrived.
    #[error("{stage} exceeded its deadline after {attempts} attempts")]
    DeadlineExceeded { stage: Stage, attempts: u32 },

    /// The job was cancelled while the call was in progress.
    #[error("{stage} cancelled after {attempts} attempts")]
    Cancelled { stage: Stage, attempts: u32 },
}

impl InvokeError {
    /// Error text to record against the job: the agent's own message where
    /// there is one.
    pub fn message(&self) -> String {
        match self {
            InvokeError::Terminal { message, .. } => message.clone(),
            InvokeError::Exhausted { last_error, .. } => last_error.clone(),
            other => other.to_string(),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            InvokeError::Terminal { attempts, .. }
            | InvokeError::Exhausted { attempts, .. }
            | InvokeError::DeadlineExceeded { attempts, .. }
            | InvokeError::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Invokes stages through the rate limiter with throttling retries.
pub struct RetryingInvoker {
    executor: Arc<dyn StageExecutor>,
    limiter: Arc<GlobalRateLimiter>,
    clock: Arc<dyn Clock>,
    policy: BackoffPolicy,
}

impl RetryingInvoker {
    pub fn new(
        executor: Arc<dyn StageExecutor>,
        limiter: Arc<GlobalRateLimiter>,
        clock: Arc<dyn Clock>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            executor,
            limiter,
            clock,
            policy,
        }
    }

    pub fn from_config(
        config: &EngineConfig,
        executor: Arc<dyn StageExecutor>,
        limiter: Arc<GlobalRateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(executor, limiter, clock, BackoffPolicy::from_config(config))
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn limiter(&self) -> &GlobalRateLimiter {
        &self.limiter
    }

    /// Performs one logical call of `request.stage`.
    pub async fn invoke(
        &self,
        request: &StageRequest,
        options: &InvokeOptions,
    ) -> Result<Invocation, InvokeError> {
        let started = self.clock.now();
        let stage = request.stage;
        let caller = CallerId::from(&request.job_id);
        let waited_nanos = AtomicU64::new(0);

        let executor = self.executor.as_ref();
        let limiter = self.limiter.as_ref();
        let caller = &caller;
        let waited = &waited_nanos;

        let outcome = retry_with_backoff(
            self.clock.as_ref(),
            &self.policy,
            stage.as_str(),
            AttemptError::is_retryable,
            options,
            move |attempt| async move {
                let permit = limiter
                    .acquire(caller, options)
                    .await
                    .map_err(AttemptError::Aborted)?;
                let wait = u64::try_from(permit.waited().as_nanos()).unwrap_or(u64::MAX);
                waited.fetch_add(wait, Ordering::Relaxed);
                if let Some(deadline) = options.deadline {
                    // The claim itself can land late when the store is slow.
                    if permit.started_at() >= deadline {
                        return Err(AttemptError::Aborted(AcquireAborted::DeadlineExceeded {
                            waited: permit.waited(),
                        }));
                    }
                }
                debug!(
                    job_id = %request.job_id,
                    stage = %stage,
                    attempt = attempt + 1,
                    "invoking agent"
                );
                executor.execute(request).await.map_err(AttemptError::Stage)
            },
        )
        .await;

        let elapsed = self.clock.now().saturating_since(started);
        match outcome {
            Ok(retried) => {
                info!(
                    job_id = %request.job_id,
                    stage = %stage,
                    attempts = retried.attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "agent call succeeded"
                );
                Ok(Invocation {
                    response: retried.value,
                    attempts: retried.attempts,
                    backoff: retried.backoff,
                    rate_limit_wait: Duration::from_nanos(waited_nanos.load(Ordering::Relaxed)),
                    elapsed,
                })
            }
            // An aborted acquire means the attempt never reached the agent.
            Err(RetryFailure::Terminal {
                error: AttemptError::Aborted(aborted),
                attempts,
            }) => Err(match aborted {
                AcquireAborted::DeadlineExceeded { .. } => InvokeError::DeadlineExceeded {
                    stage,
                    attempts: attempts - 1,
                },
                AcquireAborted::Cancelled { .. } => InvokeError::Cancelled {
                    stage,
                    attempts: attempts - 1,
                },
            }),
            Err(RetryFailure::Terminal { error, attempts }) => Err(InvokeError::Terminal {
                stage,
                message: error.message(),
                attempts,
            }),
            Err(RetryFailure::Exhausted {
                last_error,
                attempts,
            }) => Err(InvokeError::Exhausted {
                stage,
                attempts,
                last_error: last_error.message(),
            }),
            Err(RetryFailure::DeadlineExceeded { attempts, .. }) => {
                Err(InvokeError::DeadlineExceeded { stage, attempts })
            }
            Err(RetryFailure::Cancelled { attempts }) => {
                Err(InvokeError::Cancelled { stage, attempts })
            }
        }
    }
}

/// Failure of a single attempt: either the agent answered with an error, or
/// the attempt never got a rate-limit slot.
#[derive(Debug)]
enum AttemptError {
    Stage(StageError),
    Aborted(AcquireAborted),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        matches!(self, AttemptError::Stage(err) if err.is_throttling())
    }

    fn message(&self) -> String {
        match self {
            AttemptError::Stage(err) => err.message().to_string(),
            AttemptError::Aborted(aborted) => aborted.to_string(),
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Stage(err) => write!(f, "{err}"),
            AttemptError::Aborted(aborted) => write!(f, "{aborted}"),
        }
    }
}

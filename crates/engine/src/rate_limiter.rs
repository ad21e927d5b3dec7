//! Global rate limiter serialising every outbound model call.
//!
//! The limiter state is one versioned record ([`RateLimitState`]) in the shared
//! [`KeyValueStore`]. A caller may proceed only after it has *claimed* the
//! record with a conditional write whose precondition is the version it read.
//! Because the claim is conditional, a caller that based its decision on a
//! superseded timestamp loses the write, re-reads, and waits again; two
//! callers can never both hold "may proceed" for windows shorter than the
//! minimum interval.
//!
//! The timestamp written is the instant the protected call starts, so the
//! interval is measured start-to-start and already includes however long the
//! previous call took.
//!
//! When the store cannot be reached the limiter degrades to in-process spacing
//! rather than blocking the pipeline forever.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use pipeline::{
    get_typed, CallerId, Clock, KeyValueStore, RateLimitState, StoreError, Timestamp,
    WritePrecondition, WriteResult,
};

use crate::error::retry_transient;
use crate::retry::InvokeOptions;

/// How a permit was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitScope {
    /// Claimed through the shared store; spacing holds system-wide.
    Global,
    /// The store was unreachable; spacing holds only within this process.
    LocalFallback,
}

/// Why [`GlobalRateLimiter::acquire`] gave up before a slot was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcquireAborted {
    /// The next free slot opens at or after the caller's deadline.
    #[error("rate limit slot not available before the deadline (waited {waited:?})")]
    DeadlineExceeded { waited: Duration },

    #[error("cancelled while waiting for a rate limit slot (waited {waited:?})")]
    Cancelled { waited: Duration },
}

/// Proof that a caller may start one protected call.
#[derive(Debug, Clone)]
#[must_use]
pub struct RateLimitPermit {
    caller: CallerId,
    started_at: Timestamp,
    waited: Duration,
    scope: PermitScope,
}

impl RateLimitPermit {
    /// Caller the permit was granted to.
    pub fn caller(&self) -> &CallerId {
        &self.caller
    }

    /// Instant recorded as the start of the protected call.
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Total time spent waiting for the slot.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Whether the permit came from the shared store or the local fallback.
    pub fn scope(&self) -> PermitScope {
        self.scope
    }
}

/// Spaces protected calls at least `min_interval` apart, start to start.
pub struct GlobalRateLimiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    key: String,
    min_interval: Duration,
    /// Start of the most recent call granted by this process.
    local_last: Mutex<Option<Timestamp>>,
    /// Serialises local-fallback callers while they wait.
    fallback_gate: tokio::sync::Mutex<()>,
}

impl GlobalRateLimiter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        key: impl Into<String>,
        min_interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            key: key.into(),
            min_interval,
            local_last: Mutex::new(None),
            fallback_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Configured minimum spacing.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Key of the shared rate-limit record.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Reads the shared record, for diagnostics.
    pub async fn current_state(&self) -> Result<Option<RateLimitState>, StoreError> {
        Ok(get_typed::<RateLimitState>(self.store.as_ref(), &self.key)
            .await?
            .map(|(state, _)| state))
    }

    /// Waits until `caller` may start a protected call, then records the start.
    ///
    /// Store failures never surface: the limiter logs them and falls back to
    /// spacing calls within this process. The wait is bounded by `options`: a
    /// slot that opens at or after the deadline is not waited for, and
    /// cancellation interrupts the wait.
    pub async fn acquire(
        &self,
        caller: &CallerId,
        options: &InvokeOptions,
    ) -> Result<RateLimitPermit, AcquireAborted> {
        let mut waited = Duration::ZERO;
        loop {
            self.check_limits(options, Duration::ZERO, waited)?;
            let current = match retry_transient(self.clock.as_ref(), "rate limit read", || {
                get_typed::<RateLimitState>(self.store.as_ref(), &self.key)
            })
            .await
            {
                Ok(current) => current,
                Err(err) => return self.acquire_locally(caller, options, waited, err).await,
            };

            if let Some((state, _)) = &current {
                let elapsed = self.clock.now().saturating_since(state.last_invocation_at);
                if elapsed < self.min_interval {
                    let wait = self.min_interval - elapsed;
                    self.check_limits(options, wait, waited)?;
                    info!(
                        caller = %caller,
                        last_caller = %state.last_caller,
                        wait_ms = wait.as_millis() as u64,
                        "rate limit: waiting for global slot"
                    );
                    self.sleep_within(wait, options, waited).await?;
                    waited += wait;
                    // Another caller may have claimed the slot while we slept.
                    continue;
                }
            }

            let precondition = match &current {
                Some((_, version)) => WritePrecondition::MatchesVersion(*version),
                None => WritePrecondition::DoesNotExist,
            };
            // Stamped per write attempt so a retried claim records when it landed.
            let mut claimed_at = self.clock.now();
            let written = retry_transient(self.clock.as_ref(), "rate limit claim", || {
                claimed_at = self.clock.now();
                let claim = RateLimitState {
                    last_invocation_at: claimed_at,
                    last_caller: caller.clone(),
                };
                async move {
                    let value = serde_json::to_value(&claim)
                        .map_err(|err| StoreError::corrupt(&self.key, err))?;
                    self.store.put(&self.key, value, precondition).await
                }
            })
            .await;
            match written {
                Ok(WriteResult::Success { version }) => {
                    self.note_local_start(claimed_at);
                    debug!(caller = %caller, version, waited_ms = waited.as_millis() as u64, "rate limit slot claimed");
                    return Ok(RateLimitPermit {
                        caller: caller.clone(),
                        started_at: claimed_at,
                        waited,
                        scope: PermitScope::Global,
                    });
                }
                Ok(WriteResult::PreconditionFailed { current_version }) => {
                    warn!(
                        caller = %caller,
                        ?current_version,
                        "rate limit slot claimed concurrently; re-checking"
                    );
                }
                Err(err) => return self.acquire_locally(caller, options, waited, err).await,
            }
        }
    }

    /// Delay still required, after a protected call that started at
    /// `permit.started_at()`, before the next caller may proceed.
    pub fn cooldown_remaining(&self, permit: &RateLimitPermit) -> Duration {
        let elapsed = self.clock.now().saturating_since(permit.started_at);
        self.min_interval.saturating_sub(elapsed)
    }

    fn note_local_start(&self, at: Timestamp) {
        if let Ok(mut last) = self.local_last.lock() {
            if last.map_or(true, |prev| prev < at) {
                *last = Some(at);
            }
        }
    }

    fn local_last(&self) -> Option<Timestamp> {
        self.local_last.lock().ok().and_then(|last| *last)
    }

    /// Fails when a wait of `wait` would end at or past the deadline, or the
    /// caller has been cancelled.
    fn check_limits(
        &self,
        options: &InvokeOptions,
        wait: Duration,
        waited: Duration,
    ) -> Result<(), AcquireAborted> {
        if options.cancel.is_cancelled() {
            return Err(AcquireAborted::Cancelled { waited });
        }
        match options.deadline {
            Some(deadline) if self.clock.now().saturating_add(wait) >= deadline => {
                Err(AcquireAborted::DeadlineExceeded { waited })
            }
            _ => Ok(()),
        }
    }

    /// Runs `fut` unless the deadline passes or the caller is cancelled first.
    async fn within<T>(
        &self,
        fut: impl Future<Output = T>,
        options: &InvokeOptions,
        waited: Duration,
    ) -> Result<T, AcquireAborted> {
        let deadline = async {
            match options.deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_since(self.clock.now());
                    self.clock.sleep(remaining).await
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            value = fut => Ok(value),
            _ = options.cancel.cancelled() => Err(AcquireAborted::Cancelled { waited }),
            _ = deadline => Err(AcquireAborted::DeadlineExceeded { waited }),
        }
    }

    async fn sleep_within(
        &self,
        wait: Duration,
        options: &InvokeOptions,
        waited: Duration,
    ) -> Result<(), AcquireAborted> {
        self.within(self.clock.sleep(wait), options, waited).await
    }

    async fn acquire_locally(
        &self,
        caller: &CallerId,
        options: &InvokeOptions,
        mut waited: Duration,
        cause: StoreError,
    ) -> Result<RateLimitPermit, AcquireAborted> {
        error!(
            caller = %caller,
            key = %self.key,
            error = %cause,
            "rate limit store unreachable; falling back to local spacing"
        );
        let _gate = self
            .within(self.fallback_gate.lock(), options, waited)
            .await?;
        if let Some(last) = self.local_last() {
            let elapsed = self.clock.now().saturating_since(last);
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                self.check_limits(options, wait, waited)?;
                self.sleep_within(wait, options, waited).await?;
                waited += wait;
            }
        }
        self.check_limits(options, Duration::ZERO, waited)?;
        let now = self.clock.now();
        self.note_local_start(now);
        Ok(RateLimitPermit {
            caller: caller.clone(),
            started_at: now,
            waited,
            scope: PermitScope::LocalFallback,
        })
    }
}

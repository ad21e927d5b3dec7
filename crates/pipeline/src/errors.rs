//! Port-level error and retry-policy types for the AgentForge pipeline domain.
//!
//! [`StoreError`] and [`StageError`] are produced by implementations of the
//! port traits in [`crate::ports`]. Engine-level errors (invoker exhaustion,
//! audit protocol violations) are defined in the `engine` crate on top of these.
//!
//! [`RetryPolicy`] is a cross-cutting concern: any error type that participates
//! in retry decisions must be able to produce a [`RetryPolicy`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// ## Rules
///
/// - `Retryable` errors: throttling responses from a remote agent, transient
///   store failures.
/// - `NonRetryable` errors: domain failures inside a stage, unreachable stores,
///   corrupt records, invalid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the minimum delay before retrying.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetryPolicy::Retryable { .. })
    }
}

/// Fixed back-off applied to [`StoreError::Transient`] failures.
pub const TRANSIENT_STORE_BACKOFF: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Failure reported by a [`crate::KeyValueStore`] or [`crate::BlobStore`].
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum StoreError {
    /// A short-lived failure (timeout, contention); retry after a short pause.
    #[error("Transient store failure: {message}")]
    Transient {
        /// Backend-specific description.
        message: String,
    },

    /// The store cannot be reached at all.
    #[error("Store unavailable: {message}")]
    Unavailable {
        /// Backend-specific description.
        message: String,
    },

    /// Optimistic concurrency kept failing for a read-modify-write cycle.
    #[error("Write conflict on '{key}' after {attempts} attempts")]
    Conflict {
        /// Contended key.
        key: String,
        /// Number of read-modify-write attempts made.
        attempts: u32,
    },

    /// A stored value could not be decoded into the expected record type.
    #[error("Corrupt value at '{key}': {message}")]
    Corrupt {
        /// Key holding the undecodable value.
        key: String,
        /// Decoder message.
        message: String,
    },
}

impl StoreError {
    /// How callers should treat this failure.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            StoreError::Transient { .. } => RetryPolicy::Retryable {
                after: Some(TRANSIENT_STORE_BACKOFF),
            },
            StoreError::Conflict { .. } => RetryPolicy::Retryable { after: None },
            StoreError::Unavailable { .. } | StoreError::Corrupt { .. } => {
                RetryPolicy::NonRetryable
            }
        }
    }

    /// Builds a [`StoreError::Corrupt`] from a decoding failure.
    pub fn corrupt(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        StoreError::Corrupt {
            key: key.into(),
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage errors
// ---------------------------------------------------------------------------

/// Failure reported by a [`crate::StageExecutor`].
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum StageError {
    /// The remote agent rejected the call because of rate limits.
    #[error("Throttled: {message}")]
    Throttled {
        /// Message returned by the agent runtime.
        message: String,
    },

    /// The stage failed for a reason retrying will not fix.
    #[error("{message}")]
    Failed {
        /// Raw error message.
        message: String,
    },
}

impl StageError {
    /// Returns `true` for the throttling class of errors.
    pub fn is_throttling(&self) -> bool {
        matches!(self, StageError::Throttled { .. })
    }

    /// Message as reported by the agent, without the classification prefix.
    pub fn message(&self) -> &str {
        match self {
            StageError::Throttled { message } | StageError::Failed { message } => message,
        }
    }

    /// How the retrying invoker should treat this failure.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            StageError::Throttled { .. } => RetryPolicy::Retryable { after: None },
            StageError::Failed { .. } => RetryPolicy::NonRetryable,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// An environment variable held a value the engine cannot use.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid value '{value}' for {variable}: {reason}")]
pub struct ConfigError {
    /// Offending variable name.
    pub variable: &'static str,
    /// Value as read.
    pub value: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_throttling_stage_errors_are_retryable() {
        let throttled = StageError::Throttled {
            message: "ThrottlingException: slow down".into(),
        };
        let failed = StageError::Failed {
            message: "bad input".into(),
        };
        assert!(throttled.is_throttling());
        assert!(throttled.retry_policy().is_retryable());
        assert!(!failed.is_throttling());
        assert_eq!(failed.retry_policy(), RetryPolicy::NonRetryable);
    }

    #[test]
    fn transient_store_errors_carry_the_fixed_backoff() {
        let err = StoreError::Transient {
            message: "timeout".into(),
        };
        assert_eq!(
            err.retry_policy(),
            RetryPolicy::Retryable {
                after: Some(TRANSIENT_STORE_BACKOFF)
            }
        );
        let err = StoreError::Unavailable {
            message: "connection refused".into(),
        };
        assert_eq!(err.retry_policy(), RetryPolicy::NonRetryable);
    }
}

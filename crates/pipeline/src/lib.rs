//! Core orchestration domain for AgentForge.
//!
//! This crate contains every domain concept, newtype identifier, persisted
//! record, port trait and cross-cutting error type used throughout the engine.
//! Infrastructure crates implement the traits defined here; they never add
//! domain rules.
//!
//! ## Architectural Layer
//!
//! **Business types + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype domain identifiers (`JobId`, `AgentName`, etc.) |
//! | [`types`] | Shared value types (`Timestamp`, `Stage`, status enums) |
//! | [`records`] | Persisted records (`Job`, `InferenceRecord`, `RateLimitState`) and `JobResult` |
//! | [`errors`] | Port-level error and retry-policy types |
//! | [`ports`] | Store, executor and clock traits |
//! | [`config`] | `EngineConfig` and its environment parsing |

pub mod config;
pub mod errors;
pub mod identifiers;
pub mod ports;
pub mod records;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use config::{EngineConfig, DEFAULT_RATE_LIMIT_NAMESPACE};
pub use errors::{ConfigError, RetryPolicy, StageError, StoreError, TRANSIENT_STORE_BACKOFF};
pub use identifiers::{ActionName, AgentName, CallerId, InvocationId, JobId};
pub use ports::{
    get_typed, update, BlobStore, Clock, KeyValueStore, StageExecutor, StageRequest, Versioned,
    WritePrecondition, WriteResult, MAX_UPDATE_ATTEMPTS,
};
pub use records::{ArtifactRef, InferenceRecord, Job, JobResult, RateLimitState};
pub use types::{ArtifactKind, InferenceStatus, JobStatus, Stage, Timestamp};

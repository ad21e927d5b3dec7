//! AgentForge orchestration engine.
//!
//! Runs a job through the five-stage agent pipeline (analysis, code
//! generation, architecture, validation, deployment) while keeping every
//! outbound model call globally rate limited and fully audited.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** Components here sequence calls between the domain
//! types in [`pipeline`] and the store/executor ports those types define. They
//! never talk to a concrete database, filesystem or HTTP client directly.
//!
//! ## Components
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`rate_limiter`] | [`GlobalRateLimiter`]: system-wide spacing of protected calls |
//! | [`retry`] | Exponential backoff with jitter, deadlines and cancellation |
//! | [`invoker`] | [`RetryingInvoker`]: rate limiter + executor + retry |
//! | [`audit`] | [`AuditRecorder`]: two-phase inference records |
//! | [`artifacts`] | [`ArtifactStore`]: raw and derived stage outputs |
//! | [`fsm`] | Pipeline states, events and the transition table |
//! | [`controller`] | [`OrchestrationController`]: `submit_job` / `get_job_status` |
//! | [`job_id`], [`jobs`] | Job identifiers and the job registry |
//! | [`stages`], [`convert`] | Stage input mapping, validation gate, output conversion |

pub mod artifacts;
pub mod audit;
pub mod clock;
pub mod controller;
pub mod convert;
pub mod error;
pub mod fsm;
pub mod invoker;
pub mod job_id;
pub mod jobs;
pub mod rate_limiter;
pub mod retry;
pub mod stages;

pub use artifacts::{ArtifactError, ArtifactStore, RAW_RESPONSE_FILENAME};
pub use audit::{AuditError, AuditHandle, AuditRecorder, TimeRange};
pub use clock::{MonotonicClock, SystemClock};
pub use controller::{config_from_env, OrchestrationController};
pub use error::EngineError;
pub use fsm::{InvalidTransition, PipelineEvent, PipelineState};
pub use invoker::{Invocation, InvokeError, RetryingInvoker};
pub use jobs::JobRegistry;
pub use rate_limiter::{AcquireAborted, GlobalRateLimiter, PermitScope, RateLimitPermit};
pub use retry::{BackoffEvent, BackoffPolicy, InvokeOptions};

//! Persisted records: jobs, audit entries, the rate-limit singleton, and the
//! aggregated result returned to callers.
//!
//! All records serialise to JSON objects so any [`crate::KeyValueStore`] can hold
//! them without knowing their shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    ActionName, AgentName, ArtifactKind, CallerId, InferenceStatus, InvocationId, JobId,
    JobStatus, Stage, Timestamp,
};

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One pipeline run.
///
/// Created when a run starts and mutated only by the orchestration controller.
/// Never deleted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Partition key for every record belonging to this run.
    pub job_id: JobId,

    /// The request that started the run.
    pub seed_request: String,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// Stage currently executing, or the last one attempted once terminal.
    pub current_stage: Option<Stage>,

    /// Converted output of every completed stage, in pipeline order.
    pub stage_results: BTreeMap<Stage, Value>,

    /// Stage that failed, when `status` is [`JobStatus::Failed`].
    pub failing_stage: Option<Stage>,

    /// Raw error message of the failure, when `status` is [`JobStatus::Failed`].
    pub error_message: Option<String>,

    /// Issues reported by the validation stage, when the gate rejected the run.
    #[serde(default)]
    pub validation_issues: Vec<String>,

    /// When the run was submitted.
    pub created_at: Timestamp,

    /// When the record last changed.
    pub updated_at: Timestamp,
}

impl Job {
    /// Creates a job in the [`JobStatus::Running`] state with no results yet.
    pub fn start(job_id: JobId, seed_request: impl Into<String>, now: Timestamp) -> Self {
        Self {
            job_id,
            seed_request: seed_request.into(),
            status: JobStatus::Running,
            current_stage: None,
            stage_results: BTreeMap::new(),
            failing_stage: None,
            error_message: None,
            validation_issues: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// One audit entry per logical stage invocation.
///
/// Keyed by `(job_id, timestamp)`. Created once with
/// [`InferenceStatus::Pending`] before the call and updated in place when the
/// call succeeds, fails terminally, or is aborted. Immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRecord {
    /// Job the invocation belongs to.
    pub job_id: JobId,

    /// Creation time of the record; second half of the key.
    pub timestamp: Timestamp,

    /// Identifier shared by every retry of the logical call.
    pub invocation_id: InvocationId,

    /// Agent that served the call.
    pub agent_name: AgentName,

    /// Action invoked on the agent.
    pub action_name: ActionName,

    /// Request exactly as sent.
    pub request_payload: String,

    /// Response exactly as received; `None` until the output phase.
    pub response_payload: Option<String>,

    /// Outcome of the call.
    pub status: InferenceStatus,

    /// Wall-clock duration of the logical call, including retries.
    pub duration_seconds: Option<f64>,

    /// Error text for [`InferenceStatus::Error`] records.
    pub error_message: Option<String>,

    /// When the record was finalised.
    pub completed_at: Option<Timestamp>,
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// The single global rate-limit record shared by every caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    /// Start instant of the most recent protected call anywhere in the system.
    pub last_invocation_at: Timestamp,

    /// Caller that made that call; diagnostic only.
    pub last_caller: CallerId,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Reference to one stored artifact blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Blob path: `{job_id}/{phase}/{stage_name}/{filename}`.
    pub path: String,

    /// Raw or derived form.
    pub kind: ArtifactKind,

    /// Size of the stored content.
    pub size_bytes: usize,
}

/// Aggregated outcome of a submitted job.
///
/// The three terminal shapes are distinguished by `status`:
/// - `completed`: every stage output plus the deployment `handle`.
/// - `validation_failed`: four stage outputs plus `validation_issues`.
/// - `failed`: outputs of the stages that completed, plus `failing_stage` and
///   the raw `error_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub status: JobStatus,
    pub stage_outputs: BTreeMap<Stage, Value>,
    pub failing_stage: Option<Stage>,
    pub error_message: Option<String>,
    pub validation_issues: Vec<String>,
    /// Designated handle field of the final stage's output, if present.
    pub handle: Option<Value>,
    /// Every artifact written during the run.
    pub artifacts: Vec<ArtifactRef>,
}

impl JobResult {
    /// Builds a result snapshot from a job record and the artifacts written so far.
    pub fn from_job(job: &Job, handle: Option<Value>, artifacts: Vec<ArtifactRef>) -> Self {
        Self {
            job_id: job.job_id.clone(),
            status: job.status,
            stage_outputs: job.stage_results.clone(),
            failing_stage: job.failing_stage,
            error_message: job.error_message.clone(),
            validation_issues: job.validation_issues.clone(),
            handle,
            artifacts,
        }
    }
}

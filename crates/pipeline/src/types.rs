//! Shared value types for the AgentForge pipeline domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! meaningful values with invariants (e.g. timestamps only move forward through
//! saturating arithmetic, stages have a fixed total order) and participate in
//! domain computations.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// domain API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    ///
    /// Prefer [`crate::Clock::now`] inside the engine so tests can substitute time.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        (self.0 - earlier.0).to_std().unwrap_or(Duration::ZERO)
    }

    /// Returns `self + duration`, saturating at the maximum representable instant.
    pub fn saturating_add(self, duration: Duration) -> Self {
        let delta = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        Self(self.0.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    /// Fixed-width, lexicographically sortable rendering used inside store keys.
    pub fn to_key_string(self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// One step of the fixed five-stage pipeline.
///
/// The derived `Ord` is the execution order; maps keyed by [`Stage`] therefore
/// iterate in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Requirements analysis of the seed request.
    Analysis,
    /// Code generation from the analysed requirements.
    CodeGeneration,
    /// Architecture design from requirements and code.
    Architecture,
    /// Quality validation; its output drives the validation gate.
    Validation,
    /// Deployment of everything produced so far.
    Deployment,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::Analysis,
        Stage::CodeGeneration,
        Stage::Architecture,
        Stage::Validation,
        Stage::Deployment,
    ];

    /// One-based position in the pipeline.
    pub fn ordinal(self) -> usize {
        match self {
            Stage::Analysis => 1,
            Stage::CodeGeneration => 2,
            Stage::Architecture => 3,
            Stage::Validation => 4,
            Stage::Deployment => 5,
        }
    }

    /// The stage that runs after this one, if any.
    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.ordinal()).copied()
    }

    /// Stable snake_case name, identical to the serialised form.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Analysis => "analysis",
            Stage::CodeGeneration => "code_generation",
            Stage::Architecture => "architecture",
            Stage::Validation => "validation",
            Stage::Deployment => "deployment",
        }
    }

    /// Remote agent serving this stage.
    pub fn agent_name(self) -> &'static str {
        match self {
            Stage::Analysis => "requirements-analyst",
            Stage::CodeGeneration => "code-generator",
            Stage::Architecture => "solution-architect",
            Stage::Validation => "quality-validator",
            Stage::Deployment => "deployment-manager",
        }
    }

    /// Action invoked on the agent.
    pub fn action_name(self) -> &'static str {
        match self {
            Stage::Analysis => "analyze_requirements",
            Stage::CodeGeneration => "generate_code",
            Stage::Architecture => "design_architecture",
            Stage::Validation => "validate",
            Stage::Deployment => "deploy",
        }
    }

    /// Artifact phase directory for this stage's outputs.
    pub fn phase(self) -> &'static str {
        match self {
            Stage::Analysis => "requirements",
            Stage::CodeGeneration => "code",
            Stage::Architecture => "architecture",
            Stage::Validation => "validation",
            Stage::Deployment => "deployment",
        }
    }

    /// File name of the derived (converted) artifact.
    pub fn derived_filename(self) -> &'static str {
        match self {
            Stage::Analysis => "requirements.json",
            Stage::CodeGeneration => "code.json",
            Stage::Architecture => "architecture.json",
            Stage::Validation => "validation.json",
            Stage::Deployment => "deployment.json",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a [`crate::Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Stages are still being invoked.
    Running,
    /// The validation gate rejected the run; deployment was skipped.
    ValidationFailed,
    /// Every stage completed.
    Completed,
    /// A stage failed terminally or its outputs could not be persisted.
    Failed,
}

impl JobStatus {
    /// Returns `true` for every status other than [`JobStatus::Running`].
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JobStatus::Running => "running",
            JobStatus::ValidationFailed => "validation_failed",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        })
    }
}

/// Status of an [`crate::InferenceRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceStatus {
    /// Input recorded; no outcome yet.
    Pending,
    /// The call returned a response.
    Success,
    /// The call failed terminally or was aborted.
    Error,
}

/// Which of the two artifact forms a blob holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// The response exactly as the agent returned it.
    Raw,
    /// The converted form extracted from the raw response.
    Derived,
}

//! Pipeline state machine.
//!
//! The controller never branches on ad-hoc flags: it feeds [`PipelineEvent`]s
//! into [`transition`] and acts on the state it gets back. Every legal move is
//! a row of [`TRANSITIONS`]; anything else is an [`InvalidTransition`].
//!
//! ```text
//! Start --Begin--> Running(Analysis)
//! Running(s) --StageSucceeded--> Running(next(s))      s != Validation, s != Deployment
//! Running(Validation) --StageSucceeded--> Gate
//! Gate --GatePassed--> Running(Deployment)
//! Gate --GateRejected--> ValidationFailed
//! Running(Deployment) --StageSucceeded--> Done
//! Running(s) --StageFailed--> Failed(s)
//! ```

use std::fmt;

use thiserror::Error;

use pipeline::{JobStatus, Stage};

/// Where a job is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Start,
    Running(Stage),
    /// Validation finished; its verdict decides whether deployment runs.
    Gate,
    Done,
    Failed(Stage),
    ValidationFailed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Done | PipelineState::Failed(_) | PipelineState::ValidationFailed
        )
    }

    /// Status persisted on the job record for this state.
    pub fn job_status(self) -> JobStatus {
        match self {
            PipelineState::Start | PipelineState::Running(_) | PipelineState::Gate => {
                JobStatus::Running
            }
            PipelineState::Done => JobStatus::Completed,
            PipelineState::Failed(_) => JobStatus::Failed,
            PipelineState::ValidationFailed => JobStatus::ValidationFailed,
        }
    }

    /// Stage currently executing, if any.
    pub fn stage(self) -> Option<Stage> {
        match self {
            PipelineState::Running(stage) => Some(stage),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Start => f.write_str("start"),
            PipelineState::Running(stage) => write!(f, "running({stage})"),
            PipelineState::Gate => f.write_str("gate"),
            PipelineState::Done => f.write_str("done"),
            PipelineState::Failed(stage) => write!(f, "failed({stage})"),
            PipelineState::ValidationFailed => f.write_str("validation_failed"),
        }
    }
}

/// Inputs that move the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineEvent {
    Begin,
    StageSucceeded,
    StageFailed,
    GatePassed,
    GateRejected,
}

/// Raised when an event has no row for the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid pipeline transition: {event:?} in state {from}")]
pub struct InvalidTransition {
    pub from: PipelineState,
    pub event: PipelineEvent,
}

use PipelineEvent as E;
use PipelineState as S;

/// Every legal `(from, event, to)` move.
pub const TRANSITIONS: [(PipelineState, PipelineEvent, PipelineState); 13] = [
    (S::Start, E::Begin, S::Running(Stage::Analysis)),
    (S::Running(Stage::Analysis), E::StageSucceeded, S::Running(Stage::CodeGeneration)),
    (S::Running(Stage::CodeGeneration), E::StageSucceeded, S::Running(Stage::Architecture)),
    (S::Running(Stage::Architecture), E::StageSucceeded, S::Running(Stage::Validation)),
    (S::Running(Stage::Validation), E::StageSucceeded, S::Gate),
    (S::Gate, E::GatePassed, S::Running(Stage::Deployment)),
    (S::Gate, E::GateRejected, S::ValidationFailed),
    (S::Running(Stage::Deployment), E::StageSucceeded, S::Done),
    (S::Running(Stage::Analysis), E::StageFailed, S::Failed(Stage::Analysis)),
    (S::Running(Stage::CodeGeneration), E::StageFailed, S::Failed(Stage::CodeGeneration)),
    (S::Running(Stage::Architecture), E::StageFailed, S::Failed(Stage::Architecture)),
    (S::Running(Stage::Validation), E::StageFailed, S::Failed(Stage::Validation)),
    (S::Running(Stage::Deployment), E::StageFailed, S::Failed(Stage::Deployment)),
];

/// Looks up the next state.
pub fn transition(
    from: PipelineState,
    event: PipelineEvent,
) -> Result<PipelineState, InvalidTransition> {
    TRANSITIONS
        .iter()
        .find(|(state, ev, _)| *state == from && *ev == event)
        .map(|(_, _, to)| *to)
        .ok_or(InvalidTransition { from, event })
}

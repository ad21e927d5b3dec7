//! The orchestration controller: runs one job through the five stages.
//!
//! Per stage: audit begin, rate-limited invocation with retries, audit
//! complete or fail, then raw and derived artifacts. Control flow is driven by
//! [`crate::fsm::transition`]; the controller only decides which event happened.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use pipeline::{
    ActionName, AgentName, ArtifactRef, BlobStore, Clock, EngineConfig, Job, JobId, JobResult,
    KeyValueStore, Stage, StageExecutor, StageRequest,
};

use crate::artifacts::ArtifactStore;
use crate::audit::AuditRecorder;
use crate::convert::extract_json;
use crate::error::EngineError;
use crate::fsm::{transition, PipelineEvent, PipelineState};
use crate::invoker::RetryingInvoker;
use crate::job_id;
use crate::jobs::JobRegistry;
use crate::rate_limiter::GlobalRateLimiter;
use crate::retry::InvokeOptions;
use crate::stages::{compose_input, deployment_handle, validation_verdict};

/// Reads [`EngineConfig`] from the process environment.
pub fn config_from_env() -> Result<EngineConfig, EngineError> {
    Ok(EngineConfig::from_lookup(|name| std::env::var(name).ok())?)
}

/// Output of one successful stage.
struct StageOutput {
    output: serde_json::Value,
    artifacts: [ArtifactRef; 2],
}

pub struct OrchestrationController {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    jobs: JobRegistry,
    audit: AuditRecorder,
    artifacts: ArtifactStore,
    invoker: RetryingInvoker,
}

impl OrchestrationController {
    /// Wires a controller over the given stores and executor.
    ///
    /// Controllers built over the same key-value store share one global rate
    /// limit, whether they live in this process or another.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn KeyValueStore>,
        blobs: Arc<dyn BlobStore>,
        executor: Arc<dyn StageExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = Arc::new(GlobalRateLimiter::new(
            store.clone(),
            clock.clone(),
            config.rate_limit_namespace.clone(),
            config.min_interval,
        ));
        let invoker = RetryingInvoker::from_config(&config, executor, limiter, clock.clone());
        Self {
            jobs: JobRegistry::new(store.clone(), clock.clone()),
            audit: AuditRecorder::new(store, clock.clone()),
            artifacts: ArtifactStore::new(blobs, clock.clone()),
            invoker,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn limiter(&self) -> &GlobalRateLimiter {
        self.invoker.limiter()
    }

    /// Runs a new job to completion.
    ///
    /// Stage failures and validation rejections are reported through the
    /// returned [`JobResult`]. `Err` means the job record itself could not be
    /// persisted.
    pub async fn submit_job(&self, seed_request: &str) -> Result<JobResult, EngineError> {
        self.submit_job_with(seed_request, CancellationToken::new())
            .await
    }

    /// As [`Self::submit_job`], checking `cancel` between retries.
    pub async fn submit_job_with(
        &self,
        seed_request: &str,
        cancel: CancellationToken,
    ) -> Result<JobResult, EngineError> {
        let now = self.clock.now();
        let job_id = job_id::generate(seed_request, None, now);
        let job = self
            .jobs
            .reserve(Job::start(job_id, seed_request, now))
            .await
            .map_err(|e| EngineError::persistence("job reserve", e))?;

        let span = info_span!("job", job_id = %job.job_id);
        self.run(job, cancel).instrument(span).await
    }

    /// Current record of `job_id`.
    pub async fn get_job_status(&self, job_id: &JobId) -> Result<Job, EngineError> {
        self.jobs
            .get(job_id)
            .await
            .map_err(|e| EngineError::persistence("job read", e))?
            .ok_or_else(|| EngineError::JobNotFound {
                job_id: job_id.clone(),
            })
    }

    async fn run(&self, mut job: Job, cancel: CancellationToken) -> Result<JobResult, EngineError> {
        info!(seed_len = job.seed_request.len(), "job started");
        let mut artifacts = Vec::new();
        let mut state = PipelineState::Start;

        while !state.is_terminal() {
            let event = match state {
                PipelineState::Start => PipelineEvent::Begin,
                PipelineState::Running(stage) => {
                    let span = info_span!("stage", job_id = %job.job_id, stage = %stage);
                    match self.run_stage(&job, stage, &cancel).instrument(span).await {
                        Ok(done) => {
                            job.stage_results.insert(stage, done.output);
                            artifacts.extend(done.artifacts);
                            PipelineEvent::StageSucceeded
                        }
                        Err(message) => {
                            job.failing_stage = Some(stage);
                            job.error_message = Some(message);
                            PipelineEvent::StageFailed
                        }
                    }
                }
                PipelineState::Gate => {
                    let verdict = validation_verdict(job.stage_results.get(&Stage::Validation));
                    if verdict.is_valid {
                        info!("validation passed");
                        PipelineEvent::GatePassed
                    } else {
                        warn!(issues = verdict.issues.len(), "validation rejected the build");
                        job.validation_issues = verdict.issues;
                        PipelineEvent::GateRejected
                    }
                }
                PipelineState::Done
                | PipelineState::Failed(_)
                | PipelineState::ValidationFailed => break,
            };

            state = transition(state, event)?;
            job.status = state.job_status();
            job.current_stage = state.stage();
            job.updated_at = self.clock.now();
            self.jobs
                .save(&job)
                .await
                .map_err(|e| {
                    error!(error = %e, "job record could not be saved");
                    EngineError::persistence("job save", e)
                })?;
        }

        let handle = match state {
            PipelineState::Done => deployment_handle(job.stage_results.get(&Stage::Deployment)),
            _ => None,
        };
        info!(status = %job.status, stages = job.stage_results.len(), "job finished");
        Ok(JobResult::from_job(&job, handle, artifacts))
    }

    /// Runs one stage. `Err` carries the message recorded against the job.
    async fn run_stage(
        &self,
        job: &Job,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> Result<StageOutput, String> {
        let request = StageRequest {
            job_id: job.job_id.clone(),
            stage,
            input: compose_input(stage, &job.seed_request, &job.stage_results),
        };
        let payload = request.input.to_string();

        let handle = self
            .audit
            .begin(
                &job.job_id,
                &AgentName::from(stage),
                &ActionName::from(stage),
                &payload,
            )
            .await
            .map_err(|e| persistence_failure("audit begin", e))?;

        let mut options = InvokeOptions::default().with_cancel(cancel.clone());
        if let Some(timeout) = self.config.stage_timeout {
            options = options.with_deadline(self.clock.now().saturating_add(timeout));
        }

        info!(agent = stage.agent_name(), "stage started");
        let invocation = match self.invoker.invoke(&request, &options).await {
            Ok(invocation) => invocation,
            Err(err) => {
                let message = err.message();
                warn!(attempts = err.attempts(), error = %err, "stage failed");
                return Err(match self.audit.fail(&handle, &message).await {
                    Ok(_) => message,
                    // The stage failure stays the primary cause; the lost audit
                    // outcome is reported alongside it.
                    Err(audit_err) => {
                        format!("{message}; {}", persistence_failure("audit fail", audit_err))
                    }
                });
            }
        };

        self.audit
            .complete(&handle, &invocation.response, invocation.elapsed)
            .await
            .map_err(|e| persistence_failure("audit complete", e))?;

        let output = extract_json(&invocation.response);
        let artifacts = self
            .artifacts
            .put_stage_output(&job.job_id, stage, &invocation.response, &output)
            .await
            .map_err(|e| persistence_failure("artifact write", e))?;

        info!(
            attempts = invocation.attempts,
            backoff_events = invocation.backoff.len(),
            rate_limit_wait_ms = invocation.rate_limit_wait.as_millis() as u64,
            "stage completed"
        );
        Ok(StageOutput { output, artifacts })
    }
}

fn persistence_failure(operation: &'static str, err: impl std::fmt::Display) -> String {
    let err = EngineError::persistence(operation, err);
    error!(error = %err, "persistence failure");
    err.to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pipeline::{JobStatus, StageError};
    use serde_json::json;
    use store::{MemoryBlobStore, MemoryKeyValueStore};

    use super::*;
    use crate::MonotonicClock;

    /// Answers every stage with a canned document; validation verdict configurable.
    struct Canned {
        valid: bool,
        seen: Mutex<Vec<Stage>>,
    }

    #[async_trait]
    impl StageExecutor for Canned {
        async fn execute(&self, request: &StageRequest) -> Result<String, StageError> {
            self.seen.lock().unwrap().push(request.stage);
            Ok(match request.stage {
                Stage::Validation => json!({"is_valid": self.valid, "issues": ["missing X"]}),
                Stage::Deployment => json!({"agent_arn": "arn:agent/1"}),
                other => json!({"stage": other.as_str()}),
            }
            .to_string())
        }
    }

    fn controller(valid: bool) -> (OrchestrationController, Arc<Canned>) {
        let executor = Arc::new(Canned {
            valid,
            seen: Mutex::new(Vec::new()),
        });
        let config = EngineConfig {
            min_interval: std::time::Duration::ZERO,
            jitter: std::time::Duration::ZERO,
            ..EngineConfig::default()
        };
        let controller = OrchestrationController::new(
            config,
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(MemoryBlobStore::new()),
            executor.clone(),
            Arc::new(MonotonicClock::new()),
        );
        (controller, executor)
    }

    #[tokio::test(start_paused = true)]
    async fn status_reflects_the_finished_job() {
        let (controller, _) = controller(true);
        let result = controller.submit_job("build a weather bot").await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.handle, Some(json!("arn:agent/1")));

        let job = controller.get_job_status(&result.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.current_stage, None);
        assert_eq!(job.stage_results.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_validation_skips_deployment() {
        let (controller, executor) = controller(false);
        let result = controller.submit_job("build a weather bot").await.unwrap();
        assert_eq!(result.status, JobStatus::ValidationFailed);
        assert_eq!(result.validation_issues, vec!["missing X".to_string()]);
        assert!(!executor.seen.lock().unwrap().contains(&Stage::Deployment));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_jobs_are_reported() {
        let (controller, _) = controller(true);
        let err = controller
            .get_job_status(&JobId::new("job-nope-20250101-000000").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::JobNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_jobs_fail_at_the_current_stage() {
        let (controller, _) = controller(true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = controller
            .submit_job_with("build a weather bot", cancel)
            .await
            .unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.failing_stage, Some(Stage::Analysis));
        assert!(result.stage_outputs.is_empty());
    }
}

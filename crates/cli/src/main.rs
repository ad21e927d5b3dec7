//! AgentForge CLI entry point.
//!
//! This binary is the composition root. It:
//!
//! 1. **Parses configuration**: command-line flags plus the engine's
//!    environment variables (`MIN_INTERVAL_SECONDS`, `MAX_RETRIES`, ...).
//! 2. **Wires observability**: `tracing-subscriber` with an env filter, human
//!    or JSON output, and OTLP span export when `OTEL_EXPORTER_OTLP_ENDPOINT`
//!    is set.
//! 3. **Constructs infrastructure**: filesystem stores under the data
//!    directory and the HTTP agent executor, injected into the
//!    [`engine::OrchestrationController`].
//! 4. **Runs a command**: submit a job, or inspect a job's status, audit
//!    trail or artifacts. Results are printed to stdout as JSON.

mod observability;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use agents::{AgentClientConfig, HttpStageExecutor};
use engine::{config_from_env, OrchestrationController, SystemClock};
use pipeline::{BlobStore, JobId, JobStatus, KeyValueStore};
use store::{FsBlobStore, FsKeyValueStore};

use crate::observability::LogFormat;

#[derive(Parser, Debug)]
#[command(name = "agentforge", version, about = "Rate-limited multi-agent build pipeline")]
struct Cli {
    /// Root directory of the job, audit and artifact stores
    #[arg(long, env = "AGENTFORGE_DATA_DIR", default_value = ".agentforge", global = true)]
    data_dir: PathBuf,

    /// Log output format
    #[arg(long, value_enum, env = "AGENTFORGE_LOG_FORMAT", default_value_t = LogFormat::Human, global = true)]
    log_format: LogFormat,

    /// Base URL of the agent runtime
    #[arg(long, env = "AGENT_ENDPOINT", default_value = "http://localhost:8080", global = true)]
    agent_endpoint: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a new job through the pipeline and print its result
    Submit(SubmitArgs),
    /// Print the stored record of a job
    Status(JobArgs),
    /// Print the audit trail of a job
    Records(RecordsArgs),
    /// List the artifacts of a job
    Artifacts(ArtifactsArgs),
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Natural-language description of the agent to build
    request: String,
}

#[derive(Args, Debug)]
struct JobArgs {
    /// Job identifier, e.g. job-friend-20251013-143022
    job_id: String,
}

#[derive(Args, Debug)]
struct RecordsArgs {
    /// Job identifier
    job_id: String,

    /// Return at most this many records, oldest first
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Args, Debug)]
struct ArtifactsArgs {
    /// Job identifier
    job_id: String,

    /// Only list artifacts of this phase (requirements, code, architecture, validation, deployment)
    #[arg(long)]
    phase: Option<String>,
}

/// Builds a controller over filesystem stores rooted at `data_dir`.
fn open_controller(data_dir: &Path, agent_endpoint: &str) -> Result<OrchestrationController> {
    let config = config_from_env().context("invalid engine configuration")?;
    let executor = HttpStageExecutor::new(&AgentClientConfig::new(agent_endpoint))
        .context("failed to configure agent client")?;
    let store: Arc<dyn KeyValueStore> = Arc::new(FsKeyValueStore::new(data_dir.join("state")));
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(data_dir.join("artifacts")));
    Ok(OrchestrationController::new(
        config,
        store,
        blobs,
        Arc::new(executor),
        Arc::new(SystemClock),
    ))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _telemetry = observability::init(cli.log_format)?;
    let controller = open_controller(&cli.data_dir, &cli.agent_endpoint)?;

    match cli.command {
        Commands::Submit(args) => submit(args, &controller).await,
        Commands::Status(args) => {
            let job_id = parse_job_id(&args.job_id)?;
            let job = controller
                .get_job_status(&job_id)
                .await
                .context("failed to read job status")?;
            print_json(&job)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Records(args) => {
            let job_id = parse_job_id(&args.job_id)?;
            let records = controller
                .audit()
                .records_for_job(&job_id, args.limit)
                .await
                .context("failed to read audit records")?;
            print_json(&records)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Artifacts(args) => {
            let job_id = parse_job_id(&args.job_id)?;
            let paths = controller
                .artifacts()
                .list(&job_id, args.phase.as_deref())
                .await
                .context("failed to list artifacts")?;
            print_json(&paths)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn submit(args: SubmitArgs, controller: &OrchestrationController) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling after the current attempt");
            on_interrupt.cancel();
        }
    });

    let result = controller
        .submit_job_with(&args.request, cancel)
        .await
        .context("job could not be persisted")?;
    info!(job_id = %result.job_id, status = %result.status, "job finished");
    print_json(&result)?;

    Ok(match result.status {
        JobStatus::Completed => ExitCode::SUCCESS,
        JobStatus::ValidationFailed => ExitCode::from(2),
        JobStatus::Failed | JobStatus::Running => ExitCode::FAILURE,
    })
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    if !engine::job_id::is_valid_job_id(raw) {
        return Err(anyhow!(
            "'{raw}' is not a job id (expected job-{{keyword}}-{{YYYYMMDD-HHMMSS}})"
        ));
    }
    JobId::new(raw).ok_or_else(|| anyhow!("job id must not be empty"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{text}");
    Ok(())
}

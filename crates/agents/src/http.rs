//! HTTP executor: `POST {endpoint}/agents/{agent_name}/invoke`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use pipeline::{Stage, StageError, StageExecutor, StageRequest};

/// Marker the agent runtime puts in throttling error bodies.
const THROTTLING_MARKER: &str = "ThrottlingException";

/// Longest body excerpt carried in an error message.
const MAX_ERROR_BODY: usize = 2_000;

#[derive(Debug, Error)]
pub enum AgentClientError {
    #[error("Invalid agent endpoint '{endpoint}': {message}")]
    InvalidEndpoint { endpoint: String, message: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

/// Connection settings for the agent runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentClientConfig {
    /// Base URL, e.g. `http://localhost:8080`.
    pub endpoint: String,
    pub connect_timeout: Duration,
    /// Bound on one HTTP request; agents can take minutes to answer.
    pub request_timeout: Duration,
}

impl AgentClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Serialize)]
struct InvokeBody<'a> {
    session_id: &'a str,
    input: &'a Value,
}

/// Calls one remote agent per stage.
pub struct HttpStageExecutor {
    client: reqwest::Client,
    base: String,
    request_timeout: Duration,
}

impl HttpStageExecutor {
    pub fn new(config: &AgentClientConfig) -> Result<Self, AgentClientError> {
        let parsed =
            reqwest::Url::parse(&config.endpoint).map_err(|e| AgentClientError::InvalidEndpoint {
                endpoint: config.endpoint.clone(),
                message: e.to_string(),
            })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AgentClientError::InvalidEndpoint {
                endpoint: config.endpoint.clone(),
                message: "scheme must be http or https".to_string(),
            });
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| AgentClientError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base: parsed.as_str().trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
        })
    }

    /// URL that serves `stage`.
    pub fn invoke_url(&self, stage: Stage) -> String {
        format!("{}/agents/{}/invoke", self.base, stage.agent_name())
    }
}

#[async_trait]
impl StageExecutor for HttpStageExecutor {
    async fn execute(&self, request: &StageRequest) -> Result<String, StageError> {
        let url = self.invoke_url(request.stage);
        debug!(url = %url, job_id = %request.job_id, "posting stage input");

        let response = self
            .client
            .post(&url)
            .json(&InvokeBody {
                session_id: request.job_id.as_str(),
                input: &request.input,
            })
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| StageError::Failed {
                message: format!("Agent request to {url} failed: {e}"),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| StageError::Failed {
            message: format!("Failed to read agent response: {e}"),
        })?;

        if status.is_success() {
            return Ok(response_text(&body));
        }
        let failure = classify_failure(status.as_u16(), &body);
        warn!(
            url = %url,
            status = status.as_u16(),
            throttled = failure.is_throttling(),
            "agent call rejected"
        );
        Err(failure)
    }
}

/// Classifies a non-success response.
///
/// HTTP 429 and any body naming a throttling exception are retryable;
/// everything else is terminal.
pub fn classify_failure(status: u16, body: &str) -> StageError {
    let excerpt: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
    if status == 429 || body.contains(THROTTLING_MARKER) {
        let message = if excerpt.is_empty() {
            format!("{THROTTLING_MARKER}: HTTP {status}")
        } else {
            excerpt
        };
        StageError::Throttled { message }
    } else {
        StageError::Failed {
            message: format!("HTTP {status}: {excerpt}"),
        }
    }
}

/// Extracts the agent's answer from a success body.
///
/// The runtime wraps answers as `{"output": "..."}`; anything else is taken
/// verbatim.
fn response_text(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => match map.get("output") {
            Some(Value::String(text)) => text.clone(),
            _ => body.to_string(),
        },
        _ => body.to_string(),
    }
}

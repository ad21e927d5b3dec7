//! Engine configuration.
//!
//! Parsing works against a lookup function rather than the process environment
//! so it stays free of I/O; the CLI passes `|name| std::env::var(name).ok()`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Default key of the global rate-limit record.
pub const DEFAULT_RATE_LIMIT_NAMESPACE: &str = "rate-limit/global-model-invocations";

/// Tunables for rate limiting, retries and deadlines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum spacing between the starts of any two protected calls.
    pub min_interval: Duration,
    /// Maximum attempts per logical call when the agent keeps throttling.
    pub max_retries: u32,
    /// Backoff base; attempt `n` waits `base_delay * 2^n` plus jitter.
    pub base_delay: Duration,
    /// Upper bound of the uniform jitter added to each backoff delay.
    pub jitter: Duration,
    /// Key of the singleton rate-limit record.
    pub rate_limit_namespace: String,
    /// Overall deadline for one stage invocation including retries.
    pub stage_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(30),
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            jitter: Duration::from_secs(1),
            rate_limit_namespace: DEFAULT_RATE_LIMIT_NAMESPACE.to_string(),
            stage_timeout: None,
        }
    }
}

impl EngineConfig {
    /// Builds a configuration from environment-style variables, falling back to
    /// defaults for anything unset.
    ///
    /// Recognised: `MIN_INTERVAL_SECONDS`, `MAX_RETRIES`, `BASE_DELAY_SECONDS`,
    /// `JITTER_SECONDS`, `RATE_LIMIT_NAMESPACE`, `STAGE_TIMEOUT_SECONDS`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("MIN_INTERVAL_SECONDS") {
            config.min_interval = parse_seconds("MIN_INTERVAL_SECONDS", &raw)?;
        }
        if let Some(raw) = lookup("MAX_RETRIES") {
            let retries: u32 = raw.trim().parse().map_err(|_| ConfigError {
                variable: "MAX_RETRIES",
                value: raw.clone(),
                reason: "expected a positive integer",
            })?;
            if retries == 0 {
                return Err(ConfigError {
                    variable: "MAX_RETRIES",
                    value: raw,
                    reason: "at least one attempt is required",
                });
            }
            config.max_retries = retries;
        }
        if let Some(raw) = lookup("BASE_DELAY_SECONDS") {
            config.base_delay = parse_seconds("BASE_DELAY_SECONDS", &raw)?;
        }
        if let Some(raw) = lookup("JITTER_SECONDS") {
            config.jitter = parse_seconds("JITTER_SECONDS", &raw)?;
        }
        if let Some(raw) = lookup("RATE_LIMIT_NAMESPACE") {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Err(ConfigError {
                    variable: "RATE_LIMIT_NAMESPACE",
                    value: raw,
                    reason: "must not be empty",
                });
            }
            config.rate_limit_namespace = trimmed.to_string();
        }
        if let Some(raw) = lookup("STAGE_TIMEOUT_SECONDS") {
            config.stage_timeout = Some(parse_seconds("STAGE_TIMEOUT_SECONDS", &raw)?);
        }

        Ok(config)
    }
}

fn parse_seconds(variable: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason| ConfigError {
        variable,
        value: raw.to_string(),
        reason,
    };
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| invalid("expected a number of seconds"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(invalid("must be a finite, non-negative number"));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| invalid("out of range"))
}

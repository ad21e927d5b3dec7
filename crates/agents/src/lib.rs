//! AgentForge remote agent adapter.
//!
//! Implements [`pipeline::StageExecutor`] by POSTing stage input to an agent
//! runtime over HTTP. The engine never sees transport details; it only sees
//! the raw response text or a classified [`pipeline::StageError`].
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** URL construction, request encoding, response decoding
//! and throttling classification live here. Retries do not: they belong to
//! the engine's invoker, which puts every attempt through the global rate
//! limiter.

mod http;

pub use http::{classify_failure, AgentClientConfig, AgentClientError, HttpStageExecutor};

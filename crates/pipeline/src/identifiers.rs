//! Newtype domain identifiers.
//!
//! Every domain concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging, for example, a
//! [`JobId`] with a [`CallerId`] even though both are strings under the hood.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Stage;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: String-backed
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies one pipeline run.
    ///
    /// Generated once per submission in the form `job-{keyword}-{YYYYMMDD-HHMMSS}`
    /// (optionally followed by a short disambiguating suffix). Used as the
    /// partition key for every audit record and artifact of the run.
    JobId
}

string_id! {
    /// Name of the remote agent that serves a stage (e.g. `"code-generator"`).
    AgentName
}

string_id! {
    /// Name of the action invoked on an agent (e.g. `"generate_code"`).
    ActionName
}

string_id! {
    /// Identity of a rate-limited caller, recorded for diagnostics only.
    CallerId
}

impl JobId {
    /// Builds `job-{keyword}-{stamp}`. The fixed prefix keeps it non-empty.
    pub fn compose(keyword: &str, stamp: &str) -> Self {
        Self(format!("job-{keyword}-{stamp}"))
    }

    /// Appends `-{suffix}` to disambiguate colliding ids.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self(format!("{}-{suffix}", self.0))
    }
}

// Conversions from values that are never empty.

impl From<&JobId> for CallerId {
    /// A job rate-limits under its own identifier.
    fn from(job_id: &JobId) -> Self {
        Self(job_id.0.clone())
    }
}

impl From<Stage> for AgentName {
    fn from(stage: Stage) -> Self {
        Self(stage.agent_name().to_string())
    }
}

impl From<Stage> for ActionName {
    fn from(stage: Stage) -> Self {
        Self(stage.action_name().to_string())
    }
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies one logical invocation recorded by the audit trail.
///
/// Retries of the same logical call share the identifier; it is generated when
/// the audit record is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(Uuid);

impl InvocationId {
    /// Generates a new random invocation identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an [`InvocationId`] from an existing UUID (e.g. deserialised from a record).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_ids_are_rejected() {
        assert!(JobId::new("").is_none());
        assert!(AgentName::new(String::new()).is_none());
        assert_eq!(
            CallerId::new("supervisor").map(|c| c.to_string()),
            Some("supervisor".to_string())
        );
    }

    #[test]
    fn stage_names_convert_to_identifiers() {
        assert_eq!(AgentName::from(Stage::CodeGeneration).as_str(), "code-generator");
        assert_eq!(ActionName::from(Stage::Deployment).as_str(), "deploy");
        let job = JobId::new("job-x-20250101-000000").unwrap();
        assert_eq!(CallerId::from(&job).as_str(), job.as_str());
    }

    #[test]
    fn job_ids_serialise_as_plain_strings() {
        let id = JobId::new("job-friend-20251013-143022").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"job-friend-20251013-143022\"");
    }
}

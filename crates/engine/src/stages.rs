//! Which prior outputs feed each stage, and how the validation verdict is read.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use pipeline::Stage;

/// Field of the deployment output that identifies the deployed agent.
pub const HANDLE_FIELD: &str = "agent_arn";

/// Stages whose outputs are handed to `stage`, in execution order.
pub fn inputs_of(stage: Stage) -> &'static [Stage] {
    match stage {
        Stage::Analysis => &[],
        Stage::CodeGeneration => &[Stage::Analysis],
        Stage::Architecture => &[Stage::Analysis, Stage::CodeGeneration],
        Stage::Validation => &[Stage::CodeGeneration, Stage::Architecture],
        Stage::Deployment => &[
            Stage::Analysis,
            Stage::CodeGeneration,
            Stage::Architecture,
            Stage::Validation,
        ],
    }
}

/// Builds the input document of `stage`.
///
/// The analysis stage receives the seed request under `"request"`. Every
/// other stage receives the outputs it depends on, keyed by their phase
/// (`"requirements"`, `"code"`, ...).
pub fn compose_input(stage: Stage, seed_request: &str, outputs: &BTreeMap<Stage, Value>) -> Value {
    let mut input = Map::new();
    if stage == Stage::Analysis {
        input.insert("request".to_string(), Value::String(seed_request.to_string()));
    }
    for source in inputs_of(stage) {
        let value = outputs.get(source).cloned().unwrap_or(Value::Null);
        input.insert(source.phase().to_string(), value);
    }
    Value::Object(input)
}

/// Decision read from the validation stage's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationVerdict {
    pub is_valid: bool,
    pub issues: Vec<String>,
}

/// Reads `is_valid` and `issues` from the validation output.
///
/// Anything other than a literal `true` fails the gate, including a missing
/// output or field. Non-string issues are rendered as JSON.
pub fn validation_verdict(output: Option<&Value>) -> ValidationVerdict {
    let is_valid = output
        .and_then(|o| o.get("is_valid"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let issues = output
        .and_then(|o| o.get("issues"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    ValidationVerdict { is_valid, issues }
}

/// Deployment handle, if the output carries one.
pub fn deployment_handle(output: Option<&Value>) -> Option<Value> {
    output
        .and_then(|o| o.get(HANDLE_FIELD))
        .filter(|v| !v.is_null())
        .cloned()
}

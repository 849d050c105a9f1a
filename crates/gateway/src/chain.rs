//! Sequential tool chains with `{{prev}}` substitution.
//!
//! Each step runs after the previous one finished. String argument values of the exact form
//! `{{prev}}` or `{{prev.<path>}}` are replaced with (part of) the previous step's result before
//! the step runs. Path segments are object keys or array indices; a path that does not resolve
//! yields `null`. Anything else is passed through verbatim.

use crate::connections::{CallOutcome, ToolCaller};
use crate::error::GatewayError;
use crate::oauth::AuthorizationChallenge;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

const PREV: &str = "{{prev}}";
const PREV_PATH_PREFIX: &str = "{{prev.";
const PLACEHOLDER_SUFFIX: &str = "}}";

/// One step of a chain.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChainStep {
    #[serde(alias = "server_id")]
    pub backend_id: String,
    #[serde(alias = "tool")]
    pub operation: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    /// One result per step, in step order.
    Completed(Vec<Value>),
    /// A step needs authorization. `results` holds the steps that completed before it.
    AuthorizationRequired {
        results: Vec<Value>,
        challenge: AuthorizationChallenge,
    },
}

impl ChainOutcome {
    #[must_use]
    pub fn into_json(self) -> Value {
        match self {
            Self::Completed(results) => Value::Array(results),
            Self::AuthorizationRequired { results, challenge } => json!({
                "status": "authorization_required",
                "authorization_url": challenge.authorization_url,
                "backend_id": challenge.backend_id,
                "results": results,
            }),
        }
    }
}

/// A step failed; the chain stopped there.
#[derive(Error, Debug)]
#[error("chain step {step} failed: {source}")]
pub struct ChainError {
    /// Zero-based index of the failing step.
    pub step: usize,
    /// Results of the steps before it.
    pub completed: Vec<Value>,
    #[source]
    pub source: GatewayError,
}

/// Run `steps` in order against `caller`.
///
/// # Errors
///
/// Returns [`ChainError`] on the first failing step; later steps are not run.
pub async fn run_chain(
    caller: &dyn ToolCaller,
    steps: &[ChainStep],
) -> Result<ChainOutcome, ChainError> {
    let mut results: Vec<Value> = Vec::with_capacity(steps.len());

    for (i, step) in steps.iter().enumerate() {
        let arguments = match results.last() {
            Some(prev) => substitute_map(&step.arguments, prev),
            None => step.arguments.clone(),
        };

        tracing::debug!(
            step = i,
            backend_id = %step.backend_id,
            operation = %step.operation,
            "running chain step"
        );

        match caller
            .call(&step.backend_id, &step.operation, arguments)
            .await
        {
            Ok(CallOutcome::Completed(v)) => results.push(v),
            Ok(CallOutcome::AuthorizationRequired(challenge)) => {
                tracing::info!(step = i, backend_id = %step.backend_id, "chain paused for authorization");
                return Ok(ChainOutcome::AuthorizationRequired { results, challenge });
            }
            Err(source) => {
                tracing::warn!(step = i, backend_id = %step.backend_id, error = %source, "chain step failed");
                return Err(ChainError {
                    step: i,
                    completed: results,
                    source,
                });
            }
        }
    }

    Ok(ChainOutcome::Completed(results))
}

fn substitute_map(arguments: &Map<String, Value>, prev: &Value) -> Map<String, Value> {
    arguments
        .iter()
        .map(|(k, v)| (k.clone(), substitute(v, prev)))
        .collect()
}

/// Replace placeholders anywhere in `value` with data from `prev`.
#[must_use]
pub fn substitute(value: &Value, prev: &Value) -> Value {
    match value {
        Value::String(s) => match placeholder_path(s) {
            Some(None) => prev.clone(),
            Some(Some(path)) => lookup(prev, path).cloned().unwrap_or(Value::Null),
            None => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, prev)).collect()),
        Value::Object(map) => Value::Object(substitute_map(map, prev)),
        other => other.clone(),
    }
}

/// `None`: not a placeholder. `Some(None)`: whole previous result. `Some(Some(path))`: a path.
fn placeholder_path(s: &str) -> Option<Option<&str>> {
    if s == PREV {
        return Some(None);
    }
    s.strip_prefix(PREV_PATH_PREFIX)
        .and_then(|rest| rest.strip_suffix(PLACEHOLDER_SUFFIX))
        .map(Some)
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |cur, segment| match cur {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

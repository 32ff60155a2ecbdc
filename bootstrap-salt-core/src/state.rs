//! Interpretation of Salt state results.
//!
//! A state run returns, per minion, either a map of state IDs to state results, or a list of
//! strings when Salt could not even compile the states. Anything else is a contract break.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::DeployError;

/// Check the result of a state run on a single minion.
///
/// Every state's `result` must be truthy. `false` and `null` are failures, `null` being what Salt
/// reports for states it did not run, as are zero and empty strings, lists or maps. A list result
/// fails if any entry mentions a failure or an error.
pub fn check_state_result(minion: &str, result: &Value) -> Result<(), DeployError> {
    match result {
        Value::Object(states) => {
            for (state_id, state) in states {
                match state.get("result") {
                    Some(val) if is_truthy(val) => continue,
                    Some(_) => {
                        let comment = state.get("comment").and_then(Value::as_str).unwrap_or_default();
                        tracing::error!(minion, state = %state_id, comment, "state failed");
                        return Err(DeployError::StateExecution {
                            minion: minion.to_string(),
                            detail: format!("state {} failed: {}", state_id, comment),
                        });
                    }
                    None => {
                        return Err(DeployError::Parser {
                            minion: minion.to_string(),
                            detail: format!("state {} has no result field", state_id),
                        })
                    }
                }
            }
            tracing::info!(minion, states = states.len(), "all states successful");
            Ok(())
        }
        Value::Array(entries) => {
            for entry in entries {
                let line = entry.as_str().ok_or_else(|| DeployError::Parser {
                    minion: minion.to_string(),
                    detail: format!("expected a list of strings, found entry {}", entry),
                })?;
                let lowered = line.to_lowercase();
                if lowered.contains("failed") || lowered.contains("error") {
                    tracing::error!(minion, entry = line, "state failed");
                    return Err(DeployError::StateExecution {
                        minion: minion.to_string(),
                        detail: line.to_string(),
                    });
                }
            }
            Ok(())
        }
        other => Err(DeployError::Parser {
            minion: minion.to_string(),
            detail: format!("expected a map or a list, got {}", kind_of(other)),
        }),
    }
}

/// The per-minion outcome of a single job.
#[derive(Debug, Default)]
pub struct JobReport {
    /// Each minion which returned, along with the outcome of its state run.
    pub outcomes: BTreeMap<String, Result<(), DeployError>>,
}

impl JobReport {
    /// Build a report from a job result, a map of minion ID to that minion's state result.
    pub fn from_job_result(result: &Value) -> Result<Self, DeployError> {
        let minions = result.as_object().ok_or_else(|| DeployError::Parser {
            minion: "*".into(),
            detail: format!("expected a map of minion results, got {}", kind_of(result)),
        })?;
        let outcomes = minions
            .iter()
            .map(|(minion, result)| (minion.clone(), check_state_result(minion, result)))
            .collect();
        Ok(Self { outcomes })
    }

    /// The minions which succeeded.
    pub fn succeeded(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().filter(|(_, res)| res.is_ok()).map(|(minion, _)| minion.as_str())
    }

    /// The first failure in minion order, if any.
    pub fn first_failure(&self) -> Option<&DeployError> {
        self.outcomes.values().find_map(|res| res.as_ref().err())
    }

    /// Collapse this report into success only if every minion succeeded.
    pub fn into_result(self) -> Result<Vec<String>, DeployError> {
        let mut succeeded = Vec::with_capacity(self.outcomes.len());
        for (minion, res) in self.outcomes {
            res?;
            succeeded.push(minion);
        }
        Ok(succeeded)
    }
}

/// Whether the given value counts as true when checking state results.
fn is_truthy(val: &Value) -> bool {
    match val {
        Value::Null => false,
        Value::Bool(val) => *val,
        Value::Number(num) => num.as_f64().map(|num| num != 0.0).unwrap_or(true),
        Value::String(val) => !val.is_empty(),
        Value::Array(val) => !val.is_empty(),
        Value::Object(val) => !val.is_empty(),
    }
}

fn kind_of(val: &Value) -> &'static str {
    match val {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a map",
    }
}

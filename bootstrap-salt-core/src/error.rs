//! Deployment error abstractions.

use thiserror::Error;

/// Deployment error variants.
///
/// These are the error kinds which callers branch upon. Everything else (provider failures,
/// I/O failures and the like) travels as an opaque `anyhow::Error` with context attached.
#[derive(Clone, Debug, Error)]
pub enum DeployError {
    /// A piece of required CLI context (account, environment, application) was not provided.
    #[error("no {0} has been selected, it must be set before running this task")]
    MissingContext(&'static str),
    /// A stack name matched more than one stack.
    #[error("stack name {name} is ambiguous, it matched {count} stacks")]
    AmbiguousStack { name: String, count: usize },
    /// The stack does not have a master instance.
    #[error("no master instance could be found for stack {0}")]
    NoMasterInstance(String),
    /// The stack has more than one instance tagged as master.
    #[error("stack {stack} has {count} instances tagged as master")]
    MultipleMasters { stack: String, count: usize },
    /// A bounded poll exhausted all of its attempts.
    #[error("timed out waiting for {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },
    /// A Salt state reported failure on a minion.
    #[error("state did not execute successfully on minion {minion}: {detail}")]
    StateExecution { minion: String, detail: String },
    /// A Salt result had an unexpected shape.
    #[error("could not parse state data returned by minion {minion}: {detail}")]
    Parser { minion: String, detail: String },
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// A host has no admins configured in its pillar.
    #[error("no admins found in pillar on host {0}")]
    AdminsMissing(String),
}

/// Find the `DeployError` within the given error chain, if any.
pub fn find_deploy_error(err: &anyhow::Error) -> Option<&DeployError> {
    err.chain().find_map(|cause| cause.downcast_ref::<DeployError>())
}

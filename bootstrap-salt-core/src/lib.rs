//! Core domain logic for converging CloudFormation stacks into Salt-managed fleets.
//!
//! Nothing in this crate performs I/O beyond sleeping between poll attempts. Everything which
//! talks to AWS, SSH or the Salt master lives in the `bootstrap-salt` crate and is built on top
//! of the types defined here.

pub mod batch;
#[cfg(test)]
mod batch_test;
pub mod error;
pub mod models;
pub mod poll;
pub mod state;
pub mod tags;
#[cfg(test)]
mod tags_test;

pub use error::DeployError;

/// The EC2 filter used to select only running instances.
pub const FILTER_INSTANCE_STATE_NAME: &str = "instance-state-name";
/// The value of `FILTER_INSTANCE_STATE_NAME` for running instances.
pub const INSTANCE_STATE_RUNNING: &str = "running";

pub mod host;
pub mod install;
pub mod keys;
pub mod minions;
pub mod salt_tree;
pub mod stack;
pub mod state;

use bootstrap_salt_core::batch::parse_fraction;
use bootstrap_salt_core::poll::{parse_interval, PollSchedule};
use structopt::StructOpt;

/// Batching and waiting options shared by every rollout task.
#[derive(StructOpt)]
pub struct RolloutOpts {
    /// The fraction of the stack to change at a time, e.g. `0.5`; all at once when not given.
    #[structopt(long, parse(try_from_str = parse_fraction))]
    fraction: Option<f64>,
    /// The seconds to wait on each batch before giving up.
    #[structopt(long, default_value = "3600")]
    timeout: u64,
    /// The seconds between checks on a batch.
    #[structopt(long, default_value = "10", parse(try_from_str = parse_interval))]
    interval: u64,
}

impl RolloutOpts {
    pub fn fraction(&self) -> Option<f64> {
        self.fraction
    }

    pub fn schedule(&self) -> PollSchedule {
        PollSchedule::from_secs(self.timeout, self.interval)
    }
}

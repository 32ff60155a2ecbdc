//! State runs through the master.

use anyhow::Result;
use bootstrap_salt_core::batch::batch;
use structopt::StructOpt;

use crate::actions::StateAction;
use crate::cmd::RolloutOpts;
use crate::rollout::run_rollout;
use crate::salt::SaltFunction;
use crate::BootstrapSalt;

/// Run a highstate across the stack in batches.
#[derive(StructOpt)]
#[structopt(name = "highstate")]
pub struct Highstate {
    #[structopt(flatten)]
    rollout: RolloutOpts,
}

impl Highstate {
    pub async fn run(&self, base: &BootstrapSalt) -> Result<()> {
        run_state(base, SaltFunction::Highstate, &self.rollout).await
    }
}

/// Run a named state across the stack in batches.
#[derive(StructOpt)]
#[structopt(name = "state")]
pub struct State {
    /// The state to apply, as given to `state.sls`.
    name: String,
    #[structopt(flatten)]
    rollout: RolloutOpts,
}

impl State {
    pub async fn run(&self, base: &BootstrapSalt) -> Result<()> {
        run_state(base, SaltFunction::Sls(self.name.clone()), &self.rollout).await
    }
}

async fn run_state(base: &BootstrapSalt, function: SaltFunction, opts: &RolloutOpts) -> Result<()> {
    let app = base.app().await?;
    let master = app.master().await?;
    let instances = app.running_instances().await?;
    let action = StateAction::new(app.control_plane(&master)?, function);
    let report = run_rollout(batch(instances, opts.fraction())?, &action, opts.schedule()).await?;
    tracing::info!(stack = %app.stack()?, batches = report.batches.len(), minions = report.succeeded().count(), "state run complete");
    Ok(())
}

//! Fleet wide checks and upgrades.

use anyhow::Result;
use bootstrap_salt_core::batch::batch;
use bootstrap_salt_core::poll::{parse_interval, PollSchedule};
use structopt::StructOpt;

use crate::actions::SaltCallAction;
use crate::cmd::RolloutOpts;
use crate::readiness;
use crate::rollout::run_rollout;
use crate::salt::SaltFunction;
use crate::BootstrapSalt;

/// Wait for the launch bootstrap to finish on every instance.
#[derive(StructOpt)]
#[structopt(name = "wait-for-minions")]
pub struct WaitForMinions {
    /// The seconds to wait for the bootstrap to finish.
    #[structopt(long, default_value = "600")]
    timeout: u64,
    /// The seconds between bootstrap checks.
    #[structopt(long, default_value = "20", parse(try_from_str = parse_interval))]
    interval: u64,
}

impl WaitForMinions {
    pub async fn run(&self, base: &BootstrapSalt) -> Result<()> {
        let app = base.app().await?;
        let stack = app.stack()?;
        readiness::wait_for_bootstrap(
            app.cloud.as_ref(),
            app.remote.as_ref(),
            &stack,
            &app.settings.bootstrap_marker,
            app.settings.wait_schedule(),
            PollSchedule::from_secs(self.timeout, self.interval),
        )
        .await?;
        tracing::info!(%stack, "bootstrap finished on all instances");
        Ok(())
    }
}

/// Check that every instance has admins in its pillar, exiting with an error when any has none.
#[derive(StructOpt)]
#[structopt(name = "check-admins-exist")]
pub struct CheckAdminsExist {}

impl CheckAdminsExist {
    pub async fn run(&self, base: &BootstrapSalt) -> Result<()> {
        let app = base.app().await?;
        let instances = app.running_instances().await?;
        readiness::check_admins_exist(app.remote.as_ref(), &instances).await
    }
}

/// Upgrade packages across the stack in batches, optionally rebooting.
#[derive(StructOpt)]
#[structopt(name = "upgrade-packages")]
pub struct UpgradePackages {
    /// The packages to upgrade, as a Salt list, e.g. `["nginx", {"openssl": "1.1.1"}]`.
    packages: String,
    /// Reboot each host after upgrading it and wait for it to come back.
    #[structopt(long)]
    restart: bool,
    #[structopt(flatten)]
    rollout: RolloutOpts,
}

impl UpgradePackages {
    pub async fn run(&self, base: &BootstrapSalt) -> Result<()> {
        let app = base.app().await?;
        let instances = app.running_instances().await?;
        let action = SaltCallAction::new(app.remote.clone(), SaltFunction::upgrade_packages(&self.packages), self.restart);
        let report = run_rollout(batch(instances, self.rollout.fraction())?, &action, self.rollout.schedule()).await?;
        tracing::info!(packages = %self.packages, minions = report.succeeded().count(), "packages upgraded");
        Ok(())
    }
}

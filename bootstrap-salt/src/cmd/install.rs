//! Master and minion installation.

use anyhow::Result;
use bootstrap_salt_core::batch::batch;
use bootstrap_salt_core::poll::{parse_interval, PollSchedule};
use bootstrap_salt_core::DeployError;
use rand::rngs::StdRng;
use rand::SeedableRng;
use structopt::StructOpt;

use crate::actions::BootstrapAction;
use crate::app::App;
use crate::aws::ec2;
use crate::cmd::RolloutOpts;
use crate::rollout::run_rollout;
use crate::{convergence, election, BootstrapSalt};

/// The bootstrap mode of masters.
const MODE_MASTER: &str = "master";
/// The bootstrap mode of minions.
const MODE_MINION: &str = "minion";

/// The name of the security group opening the master's Salt ports to minions.
fn master_security_group(app: &App) -> Result<String> {
    Ok(format!("{}-salt-master", app.stack()?))
}

/// Elect a master and bootstrap it.
#[derive(StructOpt)]
#[structopt(name = "install-master")]
pub struct InstallMaster {
    /// The seconds to wait for the bootstrap to finish.
    #[structopt(long, default_value = "3600")]
    timeout: u64,
    /// The seconds between bootstrap checks.
    #[structopt(long, default_value = "10", parse(try_from_str = parse_interval))]
    interval: u64,
}

impl InstallMaster {
    pub async fn run(&self, base: &BootstrapSalt) -> Result<()> {
        let app = base.app().await?;
        let stack = app.stack()?;
        let election = election::elect_master(app.cloud.as_ref(), &stack, &mut StdRng::from_entropy()).await?;
        let master = election.master;

        let group_name = master_security_group(&app)?;
        let vpc_id = ec2::instance_vpc(&app.aws.ec2, &master.id).await?;
        let group_id = ec2::ensure_security_group(&app.aws.ec2, &group_name, vpc_id.as_deref()).await?;
        ec2::attach_security_group(&app.aws.ec2, &master.id, &group_id).await?;

        match self.master_zone(&app)? {
            Some(zone) => {
                let record_name = app.ctx.master_dns_name(&zone)?;
                election::publish_master_record(&app.dns(), Some(&zone), &record_name, &master).await;
            }
            None => tracing::info!(%stack, "no master zone configured, skipping master DNS record"),
        }

        let action = BootstrapAction::new(app.remote.clone(), &app.settings.bootstrap_script_path, MODE_MASTER, &[]);
        run_rollout(vec![vec![master.clone()]], &action, PollSchedule::from_secs(self.timeout, self.interval)).await?;
        tracing::info!(%stack, master = %master, newly_elected = election.newly_elected, "master installed");
        Ok(())
    }

    /// The DNS zone of the master record, when a project config with one is given.
    fn master_zone(&self, app: &App) -> Result<Option<String>> {
        if app.ctx.config_path().is_err() {
            return Ok(None);
        }
        Ok(app.ctx.load_project()?.master_zone)
    }
}

/// Bootstrap every minion not yet configured against the current master.
///
/// Minions are authorized in the master's security group, then bootstrapped in batches. Each
/// batch is tagged as configured once its bootstrap has finished, so re-running after a failure
/// only picks up the minions which are left.
#[derive(StructOpt)]
#[structopt(name = "install-minions")]
pub struct InstallMinions {
    #[structopt(flatten)]
    rollout: RolloutOpts,
}

impl InstallMinions {
    pub async fn run(&self, base: &BootstrapSalt) -> Result<()> {
        let app = base.app().await?;
        let stack = app.stack()?;
        let master = app.master().await?;
        let master_ip = master
            .private_ip
            .ok_or_else(|| DeployError::InvalidInput(format!("master {} has no private IP", master.id)))?;

        let minions = convergence::unconfigured_minions(app.cloud.as_ref(), &stack, master_ip).await?;
        if minions.is_empty() {
            tracing::info!(%stack, "every minion is already configured");
            return Ok(());
        }

        let group_name = master_security_group(&app)?;
        let group_id = ec2::get_security_group(&app.aws.ec2, &group_name)
            .await?
            .ok_or_else(|| DeployError::InvalidInput(format!("security group {} does not exist, install the master first", group_name)))?;
        for minion in minions.iter() {
            let ip = minion
                .private_ip
                .ok_or_else(|| DeployError::InvalidInput(format!("minion {} has no private IP", minion.id)))?;
            ec2::authorize_minion(&app.aws.ec2, &group_id, ip).await?;
        }

        let action = BootstrapAction::new(app.remote.clone(), &app.settings.bootstrap_script_path, MODE_MINION, &[master_ip.to_string()]);
        let batches = batch(minions, self.rollout.fraction())?;
        convergence::converge_minions(app.cloud.as_ref(), batches, &action, self.rollout.schedule(), master_ip).await?;
        tracing::info!(%stack, master = %master, "minions installed");
        Ok(())
    }
}

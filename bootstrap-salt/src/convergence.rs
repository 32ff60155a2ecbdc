//! Minion convergence detection.

use std::net::IpAddr;

use anyhow::{Context, Result};
use bootstrap_salt_core::models::{Instance, StackIdentifier};
use bootstrap_salt_core::poll::PollSchedule;
use bootstrap_salt_core::tags::Tags;

use crate::discovery;
use crate::provider::CloudProvider;
use crate::rollout::{run_rollout, RolloutAction, RolloutReport};

/// List the running instances of the stack which still need configuring against the master.
///
/// This is re-read from the provider on every call. Re-electing the master changes its private IP,
/// which instantly turns every previously configured minion into an unconfigured one.
#[tracing::instrument(level = "debug", skip(provider))]
pub async fn unconfigured_minions(provider: &dyn CloudProvider, stack: &StackIdentifier, master_private_ip: IpAddr) -> Result<Vec<Instance>> {
    let instances = discovery::get_stack_instances(provider, stack, true).await?;
    let total = instances.len();
    let unconfigured: Vec<_> = instances.into_iter().filter(|inst| is_unconfigured(inst, master_private_ip)).collect();
    tracing::info!(%stack, %master_private_ip, total, unconfigured = unconfigured.len(), "computed unconfigured minions");
    Ok(unconfigured)
}

/// An instance is unconfigured unless it is the master or its `SaltMasterPrvIP` tag names the
/// given master. A tag naming any other IP is stale.
pub fn is_unconfigured(instance: &Instance, master_private_ip: IpAddr) -> bool {
    !instance.is_master() && !instance.is_configured_against(master_private_ip)
}

/// Roll `action` out across the given batches of minions, marking each batch as configured
/// against the master as soon as it succeeds.
///
/// A failed batch stops the rollout and stays untagged, while the batches before it keep their
/// tags. Re-running then only picks up what is left.
#[tracing::instrument(level = "debug", skip(provider, batches, action))]
pub async fn converge_minions(
    provider: &dyn CloudProvider, batches: Vec<Vec<Instance>>, action: &dyn RolloutAction, schedule: PollSchedule, master_private_ip: IpAddr,
) -> Result<RolloutReport> {
    let count = batches.len();
    let mut report = RolloutReport::default();
    for (index, minions) in batches.into_iter().enumerate() {
        tracing::info!(batch = index + 1, batches = count, "installing minions");
        let mut outcome = run_rollout(vec![minions], action, schedule).await?;
        let configured: Vec<String> = outcome.succeeded().map(String::from).collect();
        if !configured.is_empty() {
            provider
                .set_tags(&configured, &Tags::minion_of(master_private_ip))
                .await
                .with_context(|| format!("error tagging minions {:?} as configured", configured))?;
        }
        for mut batch in outcome.batches.drain(..) {
            batch.batch = index + 1;
            report.batches.push(batch);
        }
    }
    Ok(report)
}

//! Host readiness checks.
//!
//! Hosts come up in two steps: SSH answers once the instance has booted, and the launch bootstrap
//! writes its marker file once it has finished. Hosts may reboot during the second step, which
//! drops their SSH connection. That is recovered by waiting for SSH again, never by aborting.

use std::net::IpAddr;

use anyhow::{Context, Result};
use bootstrap_salt_core::models::{Instance, StackIdentifier};
use bootstrap_salt_core::poll::{wait_for, PollSchedule};
use bootstrap_salt_core::DeployError;
use serde_json::Value;

use crate::actions::address_of;
use crate::discovery;
use crate::provider::CloudProvider;
use crate::remote::{is_connection_lost, Remote};
use crate::salt::{self, SaltFunction};

/// Wait for SSH to answer on every running instance of the stack.
///
/// The stack is re-listed on every attempt, so instances which are replaced while waiting are
/// picked up. Returns the instances as of the successful attempt.
#[tracing::instrument(level = "debug", skip(provider, remote))]
pub async fn wait_for_ssh(provider: &dyn CloudProvider, remote: &dyn Remote, stack: &StackIdentifier, schedule: PollSchedule) -> Result<Vec<Instance>> {
    tracing::info!(%stack, "waiting for SSH on all instances");
    wait_for(&format!("SSH on all instances of stack {}", stack), schedule, || all_reachable(provider, remote, stack)).await
}

async fn all_reachable(provider: &dyn CloudProvider, remote: &dyn Remote, stack: &StackIdentifier) -> Result<Option<Vec<Instance>>> {
    let instances = discovery::get_stack_instances(provider, stack, true).await?;
    if instances.is_empty() {
        tracing::debug!(%stack, "no running instances yet");
        return Ok(None);
    }
    for inst in instances.iter() {
        let host = address_of(inst)?;
        if !remote.is_reachable(host).await {
            tracing::debug!(instance = %inst.id, %host, "SSH is not up yet");
            return Ok(None);
        }
    }
    Ok(Some(instances))
}

/// Wait for the bootstrap marker to exist on every running instance of the stack.
///
/// SSH is waited for first on `ssh_schedule`, then markers are checked on `schedule`. A host which
/// drops its connection while being checked counts as not done, and SSH is waited for again before
/// the next check.
#[tracing::instrument(level = "debug", skip(provider, remote))]
pub async fn wait_for_bootstrap(
    provider: &dyn CloudProvider, remote: &dyn Remote, stack: &StackIdentifier, marker: &str, ssh_schedule: PollSchedule, schedule: PollSchedule,
) -> Result<()> {
    let instances = wait_for_ssh(provider, remote, stack, ssh_schedule).await?;
    let hosts = instances.iter().map(address_of).collect::<Result<Vec<_>>>()?;
    tracing::info!(%stack, marker, hosts = hosts.len(), "waiting for bootstrap to finish on all instances");
    wait_for(&format!("bootstrap to finish on stack {}", stack), schedule, || {
        markers_present(provider, remote, stack, &hosts, marker, ssh_schedule)
    })
    .await
}

async fn markers_present(
    provider: &dyn CloudProvider, remote: &dyn Remote, stack: &StackIdentifier, hosts: &[IpAddr], marker: &str, ssh_schedule: PollSchedule,
) -> Result<Option<()>> {
    let mut done = true;
    for &host in hosts {
        match remote.file_exists(host, marker).await {
            Ok(true) => tracing::info!(%host, marker, "bootstrap marker found"),
            Ok(false) => {
                tracing::info!(%host, marker, "bootstrap marker not found yet");
                done = false;
            }
            Err(err) if is_connection_lost(&err) => {
                tracing::warn!(%host, "could not connect to host, waiting for SSH to recover");
                wait_for_ssh(provider, remote, stack, ssh_schedule).await?;
                done = false;
            }
            Err(err) => return Err(err).with_context(|| format!("error checking bootstrap marker on {}", host)),
        }
    }
    Ok(if done { Some(()) } else { None })
}

/// Check that every given instance has admins in its pillar.
///
/// Any data under the `admins` pillar counts as admins being set. The first host without any fails
/// with `DeployError::AdminsMissing`.
#[tracing::instrument(level = "debug", skip(remote, instances))]
pub async fn check_admins_exist(remote: &dyn Remote, instances: &[Instance]) -> Result<()> {
    for inst in instances {
        let host = address_of(inst)?;
        let admins = salt::salt_call(remote, host, &SaltFunction::pillar_get("admins")).await?;
        let names: Vec<&str> = match &admins {
            Value::Object(admins) => admins.keys().map(String::as_str).collect(),
            _ => vec![],
        };
        if names.is_empty() {
            tracing::error!(
                instance = %inst.id,
                %host,
                "no admins found in pillar, generate them with generate-ssh-key-pillar; default user removal is skipped until admins are set"
            );
            return Err(DeployError::AdminsMissing(host.to_string()).into());
        }
        tracing::info!(instance = %inst.id, %host, admins = %names.join(", "), "found admins");
    }
    Ok(())
}

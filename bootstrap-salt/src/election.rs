//! Salt master election.
//!
//! Each stack has at most one master, marked by the `SaltMaster=True` tag. The tag lives on the
//! instance itself, so the cloud provider is the only source of truth: nothing is cached and every
//! call re-reads the stack.
//!
//! Election is not atomic. Tagging an instance and reading the stack back are separate provider
//! calls, and no lock is taken in between. The system assumes that a single deploy pipeline drives
//! a given stack at any time. Two pipelines electing concurrently may both tag an instance; when
//! that happens the read-back which follows tagging sees two masters and fails with
//! `DeployError::MultipleMasters` rather than carrying on with an ambiguous stack. The race is
//! detected, not prevented.

use std::time::Duration;

use anyhow::{Context, Result};
use bootstrap_salt_core::models::{Instance, StackIdentifier};
use bootstrap_salt_core::poll::{wait_for, PollSchedule};
use bootstrap_salt_core::tags::Tags;
use bootstrap_salt_core::DeployError;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::discovery;
use crate::provider::{CloudProvider, DnsService};

/// The TTL of the master's DNS record, in seconds.
pub const MASTER_RECORD_TTL: i64 = 60;
/// The type of the master's DNS record.
pub const MASTER_RECORD_TYPE: &str = "A";

/// How long a fresh master tag may take to show up in instance listings.
pub fn readback_schedule() -> PollSchedule {
    PollSchedule::new(Duration::from_secs(15), Duration::from_millis(500))
}

/// The election state of a stack.
#[derive(Clone, Debug, PartialEq)]
pub enum MasterState {
    /// No running instance is tagged as master.
    Unelected,
    /// Exactly one running instance is tagged as master.
    Elected(Instance),
}

/// The outcome of an election.
#[derive(Clone, Debug, PartialEq)]
pub struct Election {
    /// The master, with its tags as they are after the election.
    pub master: Instance,
    /// Whether this election chose the master, as opposed to finding an existing one.
    pub newly_elected: bool,
}

/// Read the election state of the given stack.
///
/// Fails with `DeployError::MultipleMasters` when more than one running instance is tagged.
#[tracing::instrument(level = "debug", skip(provider))]
pub async fn master_state(provider: &dyn CloudProvider, stack: &StackIdentifier) -> Result<MasterState> {
    let instances = discovery::get_stack_instances(provider, stack, true).await?;
    state_of(stack, instances)
}

/// Get the master of the given stack.
///
/// Fails with `DeployError::NoMasterInstance` when the stack has not elected one.
pub async fn get_master(provider: &dyn CloudProvider, stack: &StackIdentifier) -> Result<Instance> {
    match master_state(provider, stack).await? {
        MasterState::Elected(master) => Ok(master),
        MasterState::Unelected => {
            tracing::error!(%stack, "stack has no master");
            Err(DeployError::NoMasterInstance(stack.to_string()).into())
        }
    }
}

/// Elect the master of the given stack, reusing the current master when there is one.
///
/// When there is none, a running instance is chosen with the given RNG, then tagged with
/// `SaltMaster=True` and `SaltMasterPrvIP=<its private ip>`. Re-running this against an elected
/// stack returns the same master without touching the RNG or any tags.
#[tracing::instrument(level = "debug", skip(provider, rng))]
pub async fn elect_master<R>(provider: &dyn CloudProvider, stack: &StackIdentifier, rng: &mut R) -> Result<Election>
where
    R: Rng + ?Sized,
{
    let instances = discovery::get_stack_instances(provider, stack, true).await?;
    let candidates = match state_of(stack, instances.clone())? {
        MasterState::Elected(master) => {
            tracing::info!(%stack, master = %master, "stack already has a master");
            return Ok(Election {
                master,
                newly_elected: false,
            });
        }
        MasterState::Unelected => instances,
    };

    let chosen = candidates
        .choose(rng)
        .cloned()
        .ok_or_else(|| DeployError::InvalidInput(format!("stack {} has no running instances to elect a master from", stack)))?;
    let private_ip = chosen
        .private_ip
        .ok_or_else(|| DeployError::InvalidInput(format!("instance {} has no private IP and cannot be master", chosen.id)))?;
    tracing::info!(%stack, master = %chosen, %private_ip, "electing master");
    provider
        .set_tags(&[chosen.id.clone()], &Tags::master(private_ip))
        .await
        .with_context(|| format!("error tagging {} as master of stack {}", chosen.id, stack))?;

    // Read back, which is where a concurrent election shows up. Listings lag behind tagging, so
    // an unelected stack is only a stale view.
    let what = format!("master tag on {} to be visible", chosen.id);
    let master = wait_for(&what, readback_schedule(), move || async move {
        match master_state(provider, stack).await {
            Ok(MasterState::Elected(master)) => Ok(Some(master)),
            Ok(MasterState::Unelected) => Ok(None),
            Err(err) => Err(err),
        }
    })
    .await
    .with_context(|| format!("error reading back master of stack {}", stack))?;
    if master.id != chosen.id {
        tracing::error!(%stack, chosen = %chosen, found = %master, "a different master was elected concurrently");
        return Err(DeployError::MultipleMasters {
            stack: stack.to_string(),
            count: 2,
        }
        .into());
    }
    Ok(Election {
        master,
        newly_elected: true,
    })
}

/// Point the master's DNS record at the given master.
///
/// This is a convenience only. It is skipped when no zone is configured, and a failed update is
/// logged and swallowed. Returns the value written, if any.
#[tracing::instrument(level = "debug", skip(dns, master), fields(master = %master))]
pub async fn publish_master_record(dns: &dyn DnsService, zone: Option<&str>, record_name: &str, master: &Instance) -> Option<String> {
    let zone = match zone {
        Some(zone) => zone,
        None => {
            tracing::info!(record_name, "no master zone configured, skipping master DNS record");
            return None;
        }
    };
    let value = match master.public_ip.or(master.private_ip) {
        Some(ip) => ip.to_string(),
        None => {
            tracing::warn!(record_name, "master has no IP address, skipping master DNS record");
            return None;
        }
    };
    match dns.upsert_record(zone, record_name, MASTER_RECORD_TYPE, &value).await {
        Ok(()) => {
            tracing::info!(zone, record_name, %value, "updated master DNS record");
            Some(value)
        }
        Err(err) => {
            tracing::warn!(error = ?err, zone, record_name, "error updating master DNS record, continuing without it");
            None
        }
    }
}

fn state_of(stack: &StackIdentifier, instances: Vec<Instance>) -> Result<MasterState> {
    let mut masters: Vec<Instance> = instances.into_iter().filter(Instance::is_master).collect();
    match masters.len() {
        0 => Ok(MasterState::Unelected),
        1 => Ok(MasterState::Elected(masters.remove(0))),
        count => {
            let ids: Vec<&str> = masters.iter().map(|inst| inst.id.as_str()).collect();
            tracing::error!(%stack, count, masters = ?ids, "stack has more than one master");
            Err(DeployError::MultipleMasters {
                stack: stack.to_string(),
                count,
            }
            .into())
        }
    }
}

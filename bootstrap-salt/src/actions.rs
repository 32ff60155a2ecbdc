//! The actions rolled out by the CLI tasks.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bootstrap_salt_core::error::find_deploy_error;
use bootstrap_salt_core::models::Instance;
use bootstrap_salt_core::DeployError;
use serde_json::{json, Value};

use crate::remote::{is_connection_lost, shell_quote, Remote};
use crate::rollout::{DispatchedJob, RolloutAction};
use crate::salt::{self, compound_target, ControlPlane, SaltFunction};

/// The remote file recording a host's boot, which changes on every reboot.
const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

/// Get the SSH address of the given instance.
pub fn address_of(instance: &Instance) -> Result<IpAddr> {
    instance
        .ssh_address()
        .ok_or_else(|| DeployError::InvalidInput(format!("instance {} has no IP address", instance.id)).into())
}

/// Run a Salt function through the master against each batch.
pub struct StateAction {
    control: Arc<dyn ControlPlane>,
    function: SaltFunction,
}

impl StateAction {
    pub fn new(control: Arc<dyn ControlPlane>, function: SaltFunction) -> Self {
        Self { control, function }
    }
}

#[async_trait]
impl RolloutAction for StateAction {
    fn name(&self) -> String {
        self.function.to_string()
    }

    async fn dispatch(&self, batch: &[Instance]) -> Result<DispatchedJob> {
        let jid = self.control.dispatch_async(&compound_target(batch), &self.function).await?;
        Ok(DispatchedJob {
            id: jid,
            targets: batch.iter().map(|inst| inst.id.clone()).collect(),
            ..Default::default()
        })
    }

    async fn poll(&self, job: &DispatchedJob) -> Result<Option<Value>> {
        let result = self.control.lookup_job_result(&job.id).await?;
        match result.as_object() {
            // Anything other than a map is handed on as-is to fail parsing.
            None => Ok(Some(result)),
            Some(returned) if returned.len() >= job.targets.len() => Ok(Some(result)),
            Some(returned) => {
                tracing::debug!(jid = %job.id, returned = returned.len(), expected = job.targets.len(), "job still running");
                Ok(None)
            }
        }
    }
}

/// Run the bootstrap script on each host of a batch in the background, then wait for its markers.
///
/// The script's success or failure is recorded in marker files next to its log, so that the wait
/// survives SSH drops while the host reconfigures itself.
pub struct BootstrapAction {
    remote: Arc<dyn Remote>,
    command: String,
    done_marker: String,
    failed_marker: String,
    log_path: String,
}

impl BootstrapAction {
    /// Run `<script_dir>/bootstrap.sh <mode> <args..>` as root.
    pub fn new(remote: Arc<dyn Remote>, script_dir: &str, mode: &str, args: &[String]) -> Self {
        let mut command = vec![shell_quote(&format!("{}/bootstrap.sh", script_dir.trim_end_matches('/'))), shell_quote(mode)];
        command.extend(args.iter().map(|arg| shell_quote(arg)));
        Self {
            remote,
            command: command.join(" "),
            done_marker: format!("/tmp/salt_bootstrap_{}.done", mode),
            failed_marker: format!("/tmp/salt_bootstrap_{}.failed", mode),
            log_path: format!("/tmp/salt_bootstrap_{}.log", mode),
        }
    }

    fn background_command(&self) -> String {
        format!(
            "rm -f {done} {failed}; nohup sh -c {script} > {log} 2>&1 &",
            done = self.done_marker,
            failed = self.failed_marker,
            log = self.log_path,
            script = shell_quote(&format!("{} && touch {} || touch {}", self.command, self.done_marker, self.failed_marker)),
        )
    }
}

#[async_trait]
impl RolloutAction for BootstrapAction {
    fn name(&self) -> String {
        format!("bootstrap ({})", self.command)
    }

    async fn dispatch(&self, batch: &[Instance]) -> Result<DispatchedJob> {
        let command = self.background_command();
        let mut hosts = BTreeMap::new();
        for inst in batch {
            let host = address_of(inst)?;
            hosts.insert(inst.id.clone(), host);
            let output = self.remote.run(host, &command, true).await.with_context(|| format!("error starting bootstrap on {}", inst.id))?;
            if !output.success() {
                tracing::error!(instance = %inst.id, %host, stderr = %output.stderr_lossy().trim(), "error starting bootstrap");
                return Err(DeployError::StateExecution {
                    minion: inst.id.clone(),
                    detail: format!("bootstrap could not be started: {}", output.stderr_lossy().trim()),
                }
                .into());
            }
            tracing::info!(instance = %inst.id, %host, "started bootstrap");
        }
        Ok(DispatchedJob {
            id: "bootstrap".into(),
            targets: batch.iter().map(|inst| inst.id.clone()).collect(),
            hosts,
            ..Default::default()
        })
    }

    async fn poll(&self, job: &DispatchedJob) -> Result<Option<Value>> {
        let mut results = serde_json::Map::new();
        for (instance_id, &host) in job.hosts.iter() {
            match self.check_markers(host).await {
                Ok(Some(true)) => {
                    results.insert(instance_id.clone(), json!(["bootstrap complete"]));
                }
                Ok(Some(false)) => {
                    results.insert(instance_id.clone(), json!([format!("bootstrap failed, see {}", self.log_path)]));
                }
                Ok(None) => return Ok(None),
                Err(err) if is_connection_lost(&err) => {
                    tracing::debug!(instance = %instance_id, %host, "lost connection while bootstrapping, will retry");
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Some(Value::Object(results)))
    }
}

impl BootstrapAction {
    /// `Some(true)` when done, `Some(false)` when failed, `None` while running.
    async fn check_markers(&self, host: IpAddr) -> Result<Option<bool>> {
        if self.remote.file_exists(host, &self.failed_marker).await? {
            return Ok(Some(false));
        }
        if self.remote.file_exists(host, &self.done_marker).await? {
            return Ok(Some(true));
        }
        Ok(None)
    }
}

/// Run a Salt function masterless on each host of a batch, optionally rebooting afterwards.
///
/// Hosts are rebooted only after the function succeeded on them. A rebooted host counts as back
/// once SSH answers and its boot ID differs from the one read before the reboot.
pub struct SaltCallAction {
    remote: Arc<dyn Remote>,
    function: SaltFunction,
    restart: bool,
    rebooting: Mutex<BTreeMap<String, Reboot>>,
}

#[derive(Clone, Debug)]
struct Reboot {
    host: IpAddr,
    boot_id: String,
}

impl SaltCallAction {
    pub fn new(remote: Arc<dyn Remote>, function: SaltFunction, restart: bool) -> Self {
        Self {
            remote,
            function,
            restart,
            rebooting: Mutex::new(BTreeMap::new()),
        }
    }

    fn rebooting(&self) -> Result<MutexGuard<'_, BTreeMap<String, Reboot>>> {
        self.rebooting.lock().map_err(|_| anyhow::anyhow!("reboot registry lock poisoned"))
    }

    async fn boot_id(&self, host: IpAddr) -> Result<String> {
        let output = self.remote.run(host, &format!("cat {}", BOOT_ID_PATH), false).await?;
        Ok(output.stdout_lossy().trim().to_string())
    }

    async fn reboot(&self, inst: &Instance, host: IpAddr) -> Result<()> {
        let boot_id = self.boot_id(host).await.with_context(|| format!("error reading boot id of {}", inst.id))?;
        self.rebooting()?.insert(inst.id.clone(), Reboot { host, boot_id });
        tracing::info!(instance = %inst.id, %host, "rebooting");
        match salt::salt_call(self.remote.as_ref(), host, &SaltFunction::reboot()).await {
            Ok(_) => Ok(()),
            // The host may well drop the connection before answering.
            Err(err) if is_connection_lost(&err) => Ok(()),
            Err(err) => Err(err.context(format!("error rebooting {}", inst.id))),
        }
    }

    async fn is_back(&self, reboot: &Reboot) -> Result<bool> {
        if !self.remote.is_reachable(reboot.host).await {
            return Ok(false);
        }
        match self.boot_id(reboot.host).await {
            Ok(current) => Ok(!current.is_empty() && current != reboot.boot_id),
            Err(err) if is_connection_lost(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl RolloutAction for SaltCallAction {
    fn name(&self) -> String {
        if self.restart {
            format!("{} with restart", self.function)
        } else {
            self.function.to_string()
        }
    }

    async fn dispatch(&self, batch: &[Instance]) -> Result<DispatchedJob> {
        let mut collected = serde_json::Map::new();
        let mut hosts = BTreeMap::new();
        for inst in batch {
            let host = address_of(inst)?;
            hosts.insert(inst.id.clone(), host);
            match salt::salt_call(self.remote.as_ref(), host, &self.function).await {
                Ok(_) => {
                    collected.insert(inst.id.clone(), json!([format!("{} succeeded", self.function.name())]));
                    if self.restart {
                        self.reboot(inst, host).await?;
                    }
                }
                Err(err) => match find_deploy_error(&err) {
                    Some(DeployError::StateExecution { detail, .. }) => {
                        collected.insert(inst.id.clone(), json!([format!("failed: {}", detail)]));
                    }
                    _ => return Err(err.context(format!("error running {} on {}", self.function, inst.id))),
                },
            }
        }
        Ok(DispatchedJob {
            id: self.function.name().into(),
            targets: batch.iter().map(|inst| inst.id.clone()).collect(),
            hosts,
            collected,
        })
    }

    async fn poll(&self, job: &DispatchedJob) -> Result<Option<Value>> {
        let pending: Vec<(String, Reboot)> = {
            let rebooting = self.rebooting()?;
            job.targets
                .iter()
                .filter_map(|id| rebooting.get(id).map(|reboot| (id.clone(), reboot.clone())))
                .collect()
        };
        for (instance_id, reboot) in pending.iter() {
            if !self.is_back(reboot).await? {
                tracing::debug!(instance = %instance_id, host = %reboot.host, "waiting for host to come back from reboot");
                return Ok(None);
            }
            self.rebooting()?.remove(instance_id);
        }
        Ok(Some(Value::Object(job.collected.clone())))
    }
}

//! The Salt control plane.
//!
//! Jobs are dispatched through the master's `salt` CLI over SSH and never awaited in-line.
//! Their results are looked up later through the master's job cache with `salt-run`.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bootstrap_salt_core::models::Instance;
use bootstrap_salt_core::DeployError;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::remote::{shell_quote, Remote};

/// The grain under which each minion publishes its EC2 instance ID.
pub const GRAIN_INSTANCE_ID: &str = "aws_instance_id";

lazy_static! {
    static ref JOB_ID_RE: Regex = Regex::new(r"Executed command with job ID:\s*(\d+)").expect("failed to compile JOB_ID_RE regex");
}

/// A Salt function along with its arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaltFunction {
    /// `state.highstate`.
    Highstate,
    /// `state.sls <name>`.
    Sls(String),
    /// Any other execution module function.
    Module { name: String, args: Vec<String> },
}

impl SaltFunction {
    /// `pkg.install` upgrading only the given packages, which are given in Salt list syntax.
    pub fn upgrade_packages(packages: &str) -> Self {
        Self::Module {
            name: "pkg.install".into(),
            args: vec!["refresh=True".into(), "only_upgrade=True".into(), format!("pkgs={}", packages)],
        }
    }

    /// `pillar.get <key>`.
    pub fn pillar_get(key: &str) -> Self {
        Self::Module {
            name: "pillar.get".into(),
            args: vec![key.into()],
        }
    }

    /// `saltutil.clear_cache`.
    pub fn clear_cache() -> Self {
        Self::Module {
            name: "saltutil.clear_cache".into(),
            args: vec![],
        }
    }

    /// `saltutil.sync_all`, refreshing the modules it synced.
    pub fn sync_all() -> Self {
        Self::Module {
            name: "saltutil.sync_all".into(),
            args: vec!["refresh=True".into()],
        }
    }

    /// `state.highstate` for `highstate`, and `state.sls <name>` for any other name.
    pub fn state(name: &str) -> Self {
        match name {
            "highstate" => Self::Highstate,
            name => Self::Sls(name.into()),
        }
    }

    /// `system.reboot`.
    pub fn reboot() -> Self {
        Self::Module {
            name: "system.reboot".into(),
            args: vec![],
        }
    }

    /// The function name.
    pub fn name(&self) -> &str {
        match self {
            Self::Highstate => "state.highstate",
            Self::Sls(_) => "state.sls",
            Self::Module { name, .. } => name.as_str(),
        }
    }

    /// The function name followed by its arguments, each quoted for the shell.
    pub fn to_shell_args(&self) -> String {
        let mut args = vec![self.name().to_string()];
        match self {
            Self::Highstate => (),
            Self::Sls(name) => args.push(shell_quote(name)),
            Self::Module { args: extra, .. } => args.extend(extra.iter().map(|arg| shell_quote(arg))),
        }
        args.join(" ")
    }
}

impl fmt::Display for SaltFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Highstate => f.write_str(self.name()),
            Self::Sls(name) => write!(f, "{} {}", self.name(), name),
            Self::Module { name, args } if args.is_empty() => f.write_str(name),
            Self::Module { name, args } => write!(f, "{} {}", name, args.join(" ")),
        }
    }
}

/// Build a compound target matching exactly the given instances by their instance-ID grain.
pub fn compound_target(instances: &[Instance]) -> String {
    instances
        .iter()
        .map(|inst| format!("G@{}:{}", GRAIN_INSTANCE_ID, inst.id))
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Parse the job ID out of the output of an `--async` salt invocation.
pub fn parse_job_id(master: &str, output: &str) -> Result<String, DeployError> {
    JOB_ID_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|jid| jid.as_str().to_string())
        .ok_or_else(|| DeployError::Parser {
            minion: master.to_string(),
            detail: format!("no job ID found in salt output: {}", output.trim()),
        })
}

/// Asynchronous job dispatch and lookup against a Salt master.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Start the given function on all minions matching the compound target, returning the job ID.
    async fn dispatch_async(&self, target: &str, function: &SaltFunction) -> Result<String>;

    /// Look up the results of the given job.
    ///
    /// The result is a map of minion ID to that minion's return. Minions which have not yet
    /// returned are absent from the map.
    async fn lookup_job_result(&self, jid: &str) -> Result<Value>;
}

/// A `ControlPlane` driving the master's CLI over SSH.
pub struct SshMaster {
    remote: Arc<dyn Remote>,
    master: IpAddr,
}

impl SshMaster {
    pub fn new(remote: Arc<dyn Remote>, master: IpAddr) -> Self {
        Self { remote, master }
    }
}

#[async_trait]
impl ControlPlane for SshMaster {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn dispatch_async(&self, target: &str, function: &SaltFunction) -> Result<String> {
        let command = format!("salt -C {} {} --async", shell_quote(target), function.to_shell_args());
        let output = self
            .remote
            .run(self.master, &command, true)
            .await
            .with_context(|| format!("error dispatching {} through master {}", function, self.master))?;
        if !output.success() {
            tracing::error!(master = %self.master, %function, stderr = %output.stderr_lossy().trim(), "error dispatching salt job");
            bail!("salt master {} failed to dispatch {}: {}", self.master, function, output.stderr_lossy().trim());
        }
        let jid = parse_job_id(&self.master.to_string(), &output.stdout_lossy())?;
        tracing::info!(master = %self.master, %function, %jid, "dispatched salt job");
        Ok(jid)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn lookup_job_result(&self, jid: &str) -> Result<Value> {
        let command = format!("salt-run jobs.lookup_jid {} --out=json", shell_quote(jid));
        let output = self
            .remote
            .run(self.master, &command, true)
            .await
            .with_context(|| format!("error looking up job {} on master {}", jid, self.master))?;
        if !output.success() {
            bail!("salt master {} failed to look up job {}: {}", self.master, jid, output.stderr_lossy().trim());
        }
        parse_json_output(&self.master.to_string(), &output.stdout_lossy())
    }
}

/// Run a function masterless on the given host with `salt-call`, returning its `local` return.
///
/// A non-zero exit status is an error naming the host.
#[tracing::instrument(level = "debug", skip(remote))]
pub async fn salt_call(remote: &dyn Remote, host: IpAddr, function: &SaltFunction) -> Result<Value> {
    let command = format!("salt-call --out=json --retcode-passthrough {}", function.to_shell_args());
    let output = remote
        .run(host, &command, true)
        .await
        .with_context(|| format!("error running {} on {}", function, host))?;
    if !output.success() {
        tracing::error!(%host, %function, status = ?output.status, "salt-call failed");
        return Err(DeployError::StateExecution {
            minion: host.to_string(),
            detail: format!("{} exited with status {:?}: {}", function, output.status, output.stderr_lossy().trim()),
        }
        .into());
    }
    let mut parsed = parse_json_output(&host.to_string(), &output.stdout_lossy())?;
    match parsed.get_mut("local") {
        Some(local) => Ok(local.take()),
        None => Err(DeployError::Parser {
            minion: host.to_string(),
            detail: "salt-call output has no `local` key".into(),
        }
        .into()),
    }
}

/// Parse JSON printed by a salt CLI. Empty output is an empty map.
fn parse_json_output(source: &str, output: &str) -> Result<Value> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(output).map_err(|err| {
        anyhow::Error::from(DeployError::Parser {
            minion: source.to_string(),
            detail: format!("invalid JSON output: {}", err),
        })
    })
}

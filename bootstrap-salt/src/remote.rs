//! Remote command execution over SSH.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::Command;

use crate::config::Settings;

/// The port SSH daemons listen on.
pub const SSH_PORT: u16 = 22;
/// The exit status `ssh` uses for its own failures, as opposed to those of the remote command.
const SSH_ERROR_STATUS: i32 = 255;

/// The output of a command run on a remote host.
#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    /// The exit status of the command, if it exited normally.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// A successful output with the given stdout.
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: vec![],
        }
    }

    /// A failed output with the given status and stderr.
    pub fn failed(status: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            status: Some(status),
            stdout: vec![],
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// The connection to a host could not be established or was dropped mid-command.
///
/// This is expected while hosts reboot. Callers waiting on a host treat it as "not yet".
#[derive(Debug, Error)]
#[error("lost connection to host {host}")]
pub struct ConnectionLost {
    pub host: IpAddr,
}

/// Check if the given error was caused by a lost connection.
pub fn is_connection_lost(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<ConnectionLost>())
}

/// Runs commands on remote hosts.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Run the given shell command on the host, optionally as root.
    ///
    /// A non-zero exit of the command itself is reported through `CommandOutput::status`. Failing
    /// to reach the host is an error carrying `ConnectionLost`.
    async fn run(&self, host: IpAddr, command: &str, sudo: bool) -> Result<CommandOutput>;

    /// Check if the host's SSH daemon is answering.
    async fn is_reachable(&self, host: IpAddr) -> bool;

    /// Check if the given path exists on the host.
    async fn file_exists(&self, host: IpAddr, path: &str) -> Result<bool> {
        let output = self.run(host, &format!("test -e {}", shell_quote(path)), false).await?;
        Ok(output.success())
    }
}

/// A `Remote` shelling out to the system's `ssh` client.
pub struct SshRemote {
    user: String,
    identity: Option<PathBuf>,
    connect_timeout: Duration,
}

impl SshRemote {
    pub fn new(settings: &Settings) -> Self {
        Self {
            user: settings.ssh_user.clone(),
            identity: settings.ssh_key.clone(),
            connect_timeout: Duration::from_secs(settings.ssh_connect_timeout),
        }
    }

    fn command(&self, host: IpAddr, remote_command: String) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=no", "-o", "UserKnownHostsFile=/dev/null", "-o", "LogLevel=ERROR"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        if let Some(identity) = &self.identity {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", self.user, host))
            .arg(remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Remote for SshRemote {
    #[tracing::instrument(level = "debug", skip(self, command))]
    async fn run(&self, host: IpAddr, command: &str, sudo: bool) -> Result<CommandOutput> {
        let remote_command = if sudo {
            format!("sudo -n sh -c {}", shell_quote(command))
        } else {
            command.to_string()
        };
        tracing::debug!(%host, command = %remote_command, "running remote command");
        let output = self
            .command(host, remote_command)
            .output()
            .await
            .with_context(|| format!("error spawning ssh to {}", host))?;
        let output = CommandOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        };
        if output.status == Some(SSH_ERROR_STATUS) || output.status.is_none() {
            tracing::debug!(%host, stderr = %output.stderr_lossy().trim(), "ssh connection failed");
            return Err(ConnectionLost { host }.into());
        }
        if !output.success() {
            tracing::debug!(%host, status = ?output.status, stderr = %output.stderr_lossy().trim(), "remote command failed");
        }
        Ok(output)
    }

    async fn is_reachable(&self, host: IpAddr) -> bool {
        is_ssh_up(SocketAddr::new(host, SSH_PORT), self.connect_timeout).await
    }
}

/// The address commands run through `LocalHost` are reported against.
pub const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

/// A `Remote` running commands on this machine, for tasks run on the hosts themselves.
///
/// The host given to `run` is only used for reporting.
pub struct LocalHost;

#[async_trait]
impl Remote for LocalHost {
    #[tracing::instrument(level = "debug", skip(self, command))]
    async fn run(&self, host: IpAddr, command: &str, sudo: bool) -> Result<CommandOutput> {
        let mut cmd = if sudo {
            let mut cmd = Command::new("sudo");
            cmd.args(["-n", "sh", "-c", command]);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command]);
            cmd
        };
        tracing::debug!(%host, command, "running local command");
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("error spawning {}", command))?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn is_reachable(&self, _host: IpAddr) -> bool {
        true
    }
}

/// Check if an SSH daemon is answering at the given address.
///
/// The daemon must accept the connection and send its `SSH-` identification banner within
/// `timeout`. No authentication is attempted.
pub async fn is_ssh_up(addr: SocketAddr, timeout: Duration) -> bool {
    let handshake = async {
        let mut stream = TcpStream::connect(addr).await?;
        let mut banner = [0u8; 4];
        stream.read_exact(&mut banner).await?;
        Ok::<_, std::io::Error>(&banner == b"SSH-")
    };
    match tokio::time::timeout(timeout, handshake).await {
        Ok(Ok(up)) => up,
        Ok(Err(err)) => {
            tracing::debug!(%addr, error = %err, "ssh is not up");
            false
        }
        Err(_) => {
            tracing::debug!(%addr, "timed out probing ssh");
            false
        }
    }
}

/// Quote the given value for a POSIX shell.
pub fn shell_quote(val: &str) -> String {
    format!("'{}'", val.replace('\'', r#"'\''"#))
}

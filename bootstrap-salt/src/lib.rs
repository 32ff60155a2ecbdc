//! Provision CloudFormation stacks and converge them into a Salt managed fleet.
//!
//! Every task works against a single stack, selected through the account, environment,
//! application and tag given on the command line. The only state is kept in the cloud as
//! instance tags, so every task re-reads what it needs and may simply be re-run after a failure.

pub mod actions;
pub mod app;
pub mod archive;
pub mod aws;
mod cmd;
pub mod config;
pub mod convergence;
pub mod discovery;
pub mod election;
pub mod github;
pub mod pillar;
pub mod provider;
pub mod readiness;
pub mod remote;
pub mod rollout;
pub mod salt;
pub mod update;

#[cfg(test)]
mod cli_test;
#[cfg(test)]
mod config_test;
#[cfg(test)]
mod fixtures;
#[cfg(test)]
mod readiness_test;
#[cfg(test)]
mod update_test;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use structopt::StructOpt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::app::App;
use crate::config::{Context, Settings};

/// Provision CloudFormation stacks and converge them into a Salt managed fleet.
#[derive(StructOpt)]
#[structopt(name = "bootstrap-salt")]
pub struct BootstrapSalt {
    #[structopt(subcommand)]
    action: BootstrapSaltSubcommands,
    /// Enable debug logging.
    #[structopt(short)]
    verbose: bool,
    /// The AWS profile of the account to use.
    #[structopt(long, env = "AWS_PROFILE")]
    aws: Option<String>,
    /// The AWS region to use, defaults to `BOOTSTRAP_SALT_AWS_REGION`.
    #[structopt(long)]
    region: Option<String>,
    /// The environment section of the project config to use.
    #[structopt(long, env = "BOOTSTRAP_SALT_ENVIRONMENT")]
    environment: Option<String>,
    /// The application the stack belongs to.
    #[structopt(long, env = "BOOTSTRAP_SALT_APPLICATION")]
    application: Option<String>,
    /// The tag telling stacks of the same application and environment apart, e.g. `active`.
    #[structopt(long)]
    tag: Option<String>,
    /// The stack to operate on, defaults to `<application>-<environment>`.
    #[structopt(long)]
    stack: Option<String>,
    /// The project config file.
    #[structopt(long, env = "BOOTSTRAP_SALT_CONFIG", parse(from_os_str))]
    config: Option<PathBuf>,
}

impl BootstrapSalt {
    pub async fn run(self) -> Result<()> {
        // Initialize logging based on CLI config, RUST_LOG wins when set.
        let default_filter = if self.verbose { "debug" } else { "info" };
        let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt::layer().with_target(true))
            .try_init()
            .context("error initializing logging/tracing system")?;

        match &self.action {
            BootstrapSaltSubcommands::CfnCreate(inner) => inner.run(&self).await,
            BootstrapSaltSubcommands::CfnDelete(inner) => inner.run(&self).await,
            BootstrapSaltSubcommands::DeleteTar(inner) => inner.run(&self).await,
            BootstrapSaltSubcommands::InstallMaster(inner) => inner.run(&self).await,
            BootstrapSaltSubcommands::InstallMinions(inner) => inner.run(&self).await,
            BootstrapSaltSubcommands::Highstate(inner) => inner.run(&self).await,
            BootstrapSaltSubcommands::State(inner) => inner.run(&self).await,
            BootstrapSaltSubcommands::WaitForMinions(inner) => inner.run(&self).await,
            BootstrapSaltSubcommands::UploadSalt(inner) => inner.run(&self).await,
            BootstrapSaltSubcommands::EncryptFile(inner) => inner.run(&self).await,
            BootstrapSaltSubcommands::GenerateSshKeyPillar(inner) => inner.run(&self).await,
            BootstrapSaltSubcommands::CheckAdminsExist(inner) => inner.run(&self).await,
            BootstrapSaltSubcommands::UpgradePackages(inner) => inner.run(&self).await,
            BootstrapSaltSubcommands::SaltUpdate(inner) => inner.run(&self).await,
        }
    }

    /// The operator's selections of this invocation.
    pub fn context(&self) -> Context {
        Context::new(
            self.aws.clone(),
            self.region.clone(),
            self.environment.clone(),
            self.application.clone(),
            self.tag.clone(),
            self.stack.clone(),
            self.config.clone(),
        )
    }

    /// Build the application object, connecting to the selected AWS account.
    pub async fn app(&self) -> Result<App> {
        let settings = Settings::new()?;
        App::new(self.context(), settings).await
    }
}

#[derive(StructOpt)]
enum BootstrapSaltSubcommands {
    /// Create the stack from a rendered template, along with its KMS data key.
    CfnCreate(cmd::stack::CfnCreate),
    /// Delete the stack along with its uploaded salt tree.
    CfnDelete(cmd::stack::CfnDelete),
    /// Remove the encrypted salt tree from the stack's bucket.
    DeleteTar(cmd::stack::DeleteTar),
    /// Elect a master and bootstrap it.
    InstallMaster(cmd::install::InstallMaster),
    /// Bootstrap every minion not yet configured against the current master.
    InstallMinions(cmd::install::InstallMinions),
    /// Run a highstate across the stack in batches.
    Highstate(cmd::state::Highstate),
    /// Run a named state across the stack in batches.
    State(cmd::state::State),
    /// Wait for the launch bootstrap to finish on every instance.
    WaitForMinions(cmd::minions::WaitForMinions),
    /// Package, encrypt and upload the salt tree.
    UploadSalt(cmd::salt_tree::UploadSalt),
    /// Encrypt a file with a KMS encrypted data key.
    EncryptFile(cmd::salt_tree::EncryptFile),
    /// Generate the admins pillar from the GitHub users of the project config.
    #[structopt(alias = "ssh-keys")]
    GenerateSshKeyPillar(cmd::keys::GenerateSshKeyPillar),
    /// Check that every instance has admins in its pillar.
    CheckAdminsExist(cmd::minions::CheckAdminsExist),
    /// Upgrade packages across the stack in batches, optionally rebooting.
    UpgradePackages(cmd::minions::UpgradePackages),
    /// Refresh this host's salt tree from the stack's bucket and run a state locally.
    SaltUpdate(cmd::host::SaltUpdate),
}

//! Tasks run on the stack's hosts themselves.

use anyhow::Result;
use structopt::StructOpt;

use crate::remote::LocalHost;
use crate::update::{self, HostPaths, HostRunOptions, S3SaltTree};
use crate::BootstrapSalt;

/// Refresh this host's salt tree from the stack's bucket and run a state locally.
///
/// Meant to be run as root on a minion or the master, e.g. from the bootstrap script or cron.
#[derive(StructOpt)]
#[structopt(name = "salt-update")]
pub struct SaltUpdate {
    /// The state to run, `highstate` for a highstate.
    #[structopt(short, long)]
    state: Option<String>,
    /// Do not refresh the salt tree before running the state.
    #[structopt(long)]
    disable_update: bool,
    /// Only refresh the salt tree.
    #[structopt(long)]
    update_only: bool,
    /// Carry on past a failed refresh or state run.
    #[structopt(long)]
    ignore_errors: bool,
}

impl SaltUpdate {
    pub async fn run(&self, base: &BootstrapSalt) -> Result<()> {
        let opts = HostRunOptions {
            state: self.state.clone(),
            disable_update: self.disable_update,
            update_only: self.update_only,
            ignore_errors: self.ignore_errors,
        };
        // Fail on conflicting flags before connecting anywhere.
        opts.function()?;

        let app = base.app().await?;
        let source = S3SaltTree {
            s3: app.aws.s3.clone(),
            kms: app.aws.kms.clone(),
            bucket: app.ctx.salt_bucket()?,
            key_path: app.settings.remote_key_path.clone().into(),
        };
        update::run_on_host(&opts, &source, &LocalHost, &HostPaths::default()).await
    }
}

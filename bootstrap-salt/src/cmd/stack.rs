//! Stack lifecycle tasks.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bootstrap_salt_core::poll::{parse_interval, PollSchedule};
use structopt::StructOpt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::app::App;
use crate::aws::{cloudformation, kms, s3};
use crate::config::SALT_TAR_KEY;
use crate::BootstrapSalt;

/// The stack parameter carrying the ID of the stack's KMS key.
const PARAM_KMS_KEY_ID: &str = "KmsKeyId";
/// The stack parameter carrying the stack's encrypted data key.
const PARAM_KMS_DATA_KEY: &str = "KmsDataKey";

/// Create the stack from a rendered template, along with its KMS data key.
#[derive(StructOpt)]
#[structopt(name = "cfn-create")]
pub struct CfnCreate {
    /// The rendered CloudFormation template.
    #[structopt(long, parse(from_os_str))]
    template: PathBuf,
    /// The seconds to wait for the stack to be created.
    #[structopt(long, default_value = "3600")]
    timeout: u64,
    /// The seconds between stack status checks.
    #[structopt(long, default_value = "10", parse(try_from_str = parse_interval))]
    interval: u64,
}

impl CfnCreate {
    pub async fn run(&self, base: &BootstrapSalt) -> Result<()> {
        let app = base.app().await?;
        let stack = app.stack()?;
        let template = tokio::fs::read_to_string(&self.template)
            .await
            .with_context(|| format!("error reading template {}", self.template.display()))?;

        // Every stack gets its own data key, which its hosts decrypt at launch.
        let alias = app.ctx.kms_alias()?;
        let key_id = kms::ensure_key(&app.aws.kms, &alias).await?;
        let data_key = kms::generate_data_key(&app.aws.kms, &key_id).await?;

        tracing::info!(%stack, %alias, "creating stack");
        let parameters = vec![(PARAM_KMS_KEY_ID.to_string(), key_id), (PARAM_KMS_DATA_KEY.to_string(), data_key)];
        let schedule = PollSchedule::from_secs(self.timeout, self.interval);
        let stack_id = cloudformation::create_stack(&app.aws.cloudformation, stack.as_str(), template, parameters, schedule).await?;
        tracing::info!(%stack, %stack_id, "stack is ready");
        Ok(())
    }
}

/// Delete the stack along with its uploaded salt tree.
#[derive(StructOpt)]
#[structopt(name = "cfn-delete")]
pub struct CfnDelete {
    /// Delete without asking for confirmation.
    #[structopt(long)]
    force: bool,
    /// The seconds to wait for the stack to be deleted.
    #[structopt(long, default_value = "3600")]
    timeout: u64,
    /// The seconds between stack status checks.
    #[structopt(long, default_value = "10", parse(try_from_str = parse_interval))]
    interval: u64,
}

impl CfnDelete {
    pub async fn run(&self, base: &BootstrapSalt) -> Result<()> {
        let app = base.app().await?;
        let stack = app.stack()?;
        if !self.force && !confirm(&format!("Are you sure you want to delete stack {}? [y/N] ", stack)).await? {
            bail!("deletion of stack {} was not confirmed", stack);
        }

        // The bucket cannot be deleted along with the stack while it holds the tree.
        if let Err(err) = delete_tar(&app).await {
            tracing::warn!(error = ?err, %stack, "error removing salt tree, continuing with stack deletion");
        }
        let schedule = PollSchedule::from_secs(self.timeout, self.interval);
        cloudformation::delete_stack(&app.aws.cloudformation, stack.as_str(), schedule).await
    }
}

/// Remove the encrypted salt tree from the stack's bucket.
///
/// This must happen before the stack is deleted, else deleting its bucket fails. Only the tree
/// uploaded by `upload-salt` is removed.
#[derive(StructOpt)]
#[structopt(name = "delete-tar")]
pub struct DeleteTar {}

impl DeleteTar {
    pub async fn run(&self, base: &BootstrapSalt) -> Result<()> {
        let app = base.app().await?;
        delete_tar(&app).await
    }
}

async fn delete_tar(app: &App) -> Result<()> {
    let bucket = app.ctx.salt_bucket()?;
    s3::delete_object(&app.aws.s3, &bucket, SALT_TAR_KEY).await
}

/// Ask the operator a yes/no question on stdin.
async fn confirm(prompt: &str) -> Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(prompt.as_bytes()).await.context("error writing to stdout")?;
    stdout.flush().await.context("error flushing stdout")?;
    let mut answer = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut answer)
        .await
        .context("error reading confirmation from stdin")?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

//! Refreshing the salt tree on a host and running states locally.
//!
//! This is the host side of `upload-salt`. The encrypted tree is fetched from the stack's bucket,
//! decrypted with the data key the host was launched with, and unpacked over the previous tree,
//! after which the minion's caches and modules are refreshed.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bootstrap_salt_core::state::check_state_result;
use bootstrap_salt_core::DeployError;

use crate::archive;
use crate::aws::{kms, s3};
use crate::config::SALT_TAR_KEY;
use crate::remote::{Remote, LOCALHOST};
use crate::salt::{salt_call, SaltFunction};

/// The trees replaced wholesale on every refresh, relative to the extraction root.
pub const REPLACED_TREES: [&str; 2] = ["srv/salt", "srv/pillar"];
const MODE_PRIVATE: u32 = 0o700;

/// Where the salt tree lives on a host.
#[derive(Clone, Debug, PartialEq)]
pub struct HostPaths {
    /// The downloaded encrypted tar.
    pub encrypted: PathBuf,
    /// The decrypted tar, kept so that a later refresh may fall back to it.
    pub tar: PathBuf,
    /// The directory the tar is extracted into.
    pub root: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            encrypted: PathBuf::from("/srv.tar.gpg"),
            tar: PathBuf::from("/srv.tar"),
            root: PathBuf::from("/"),
        }
    }
}

/// A source of the decrypted salt tree.
#[async_trait]
pub trait SaltTreeSource: Send + Sync {
    /// Fetch the tree and write it as a plain tar to `paths.tar`.
    ///
    /// Returns `false` when no tree has been uploaded yet.
    async fn fetch_tar(&self, paths: &HostPaths) -> Result<bool>;
}

/// The salt tree uploaded to a stack's bucket, encrypted with the stack's data key.
pub struct S3SaltTree {
    pub s3: aws_sdk_s3::Client,
    pub kms: aws_sdk_kms::Client,
    pub bucket: String,
    /// The local file holding the KMS encrypted data key.
    pub key_path: PathBuf,
}

#[async_trait]
impl SaltTreeSource for S3SaltTree {
    #[tracing::instrument(level = "debug", skip(self), fields(bucket = %self.bucket))]
    async fn fetch_tar(&self, paths: &HostPaths) -> Result<bool> {
        if !s3::get_file(&self.s3, &self.bucket, SALT_TAR_KEY, &paths.encrypted).await? {
            return Ok(false);
        }
        set_private(&paths.encrypted)?;
        let ciphertext = tokio::fs::read(&self.key_path)
            .await
            .with_context(|| format!("error reading data key {}", self.key_path.display()))?;
        let plaintext = kms::decrypt(&self.kms, ciphertext).await?;
        archive::decrypt_file(&paths.encrypted, &paths.tar, &base64::encode(plaintext)).await?;
        set_private(&paths.tar)?;
        Ok(true)
    }
}

fn set_private(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(MODE_PRIVATE)).with_context(|| format!("error setting mode of {}", path.display()))
}

/// Replace the host's salt tree with the one from `source`, then refresh the minion.
///
/// When nothing has been uploaded yet the previously fetched tar is used. When there is none
/// either, as on a first bootstrap, nothing is changed and `false` is returned.
#[tracing::instrument(level = "debug", skip(source, remote))]
pub async fn refresh_salt_tree(source: &dyn SaltTreeSource, remote: &dyn Remote, paths: &HostPaths) -> Result<bool> {
    let fetched = source.fetch_tar(paths).await.context("error fetching salt tree")?;
    if !fetched {
        if !paths.tar.is_file() {
            tracing::warn!(tar = %paths.tar.display(), "no salt tree uploaded yet, probably an initial bootstrap");
            return Ok(false);
        }
        tracing::info!(tar = %paths.tar.display(), "no salt tree uploaded, reusing the previous tar");
    }
    archive::replace_salt_tree(&paths.tar, &paths.root, &REPLACED_TREES)?;
    sync_minion(remote).await?;
    Ok(true)
}

/// Clear the local minion's caches and sync its custom modules.
pub async fn sync_minion(remote: &dyn Remote) -> Result<()> {
    let cleared = salt_call(remote, LOCALHOST, &SaltFunction::clear_cache()).await?;
    tracing::info!(result = %cleared, "cleared minion cache");
    let synced = salt_call(remote, LOCALHOST, &SaltFunction::sync_all()).await?;
    tracing::info!(result = %synced, "synced minion modules");
    Ok(())
}

/// Run the given state function on the local minion and check every state succeeded.
#[tracing::instrument(level = "debug", skip(remote))]
pub async fn run_local_state(remote: &dyn Remote, function: &SaltFunction) -> Result<()> {
    let result = salt_call(remote, LOCALHOST, function).await?;
    check_state_result("local", &result)?;
    tracing::info!(%function, "state run successful");
    Ok(())
}

/// What to do on a host.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HostRunOptions {
    /// The state to run, `highstate` for a highstate.
    pub state: Option<String>,
    /// Skip refreshing the salt tree.
    pub disable_update: bool,
    /// Only refresh the salt tree, without running a state.
    pub update_only: bool,
    /// Carry on past a failed refresh or state run.
    pub ignore_errors: bool,
}

impl HostRunOptions {
    /// The state function to run, if any.
    ///
    /// Exactly one of a state and `update_only` must be given.
    pub fn function(&self) -> Result<Option<SaltFunction>, DeployError> {
        match (&self.state, self.update_only) {
            (Some(_), true) => Err(DeployError::InvalidInput("a state and update-only are mutually exclusive".into())),
            (None, false) => Err(DeployError::InvalidInput("a state is required unless only updating".into())),
            (Some(state), false) => Ok(Some(SaltFunction::state(state))),
            (None, true) => Ok(None),
        }
    }
}

/// Refresh the salt tree and run a state on this host, as directed by `opts`.
pub async fn run_on_host(opts: &HostRunOptions, source: &dyn SaltTreeSource, remote: &dyn Remote, paths: &HostPaths) -> Result<()> {
    let function = opts.function()?;
    if !opts.disable_update {
        if let Err(err) = refresh_salt_tree(source, remote, paths).await {
            if !opts.ignore_errors {
                tracing::error!(error = ?err, "error updating salt tree");
                return Err(err);
            }
            tracing::error!(error = ?err, "error updating salt tree, continuing as errors are ignored");
        }
    }
    if let Some(function) = function {
        if let Err(err) = run_local_state(remote, &function).await {
            if !opts.ignore_errors {
                tracing::error!(error = ?err, %function, "error running state");
                return Err(err);
            }
            tracing::error!(error = ?err, %function, "error running state, continuing as errors are ignored");
        }
    }
    Ok(())
}

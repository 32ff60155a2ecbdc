//! Packaging and shipping of the salt tree.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use structopt::StructOpt;

use crate::actions::address_of;
use crate::app::App;
use crate::archive;
use crate::aws::{kms, s3};
use crate::config::SALT_TAR_KEY;
use crate::remote::shell_quote;
use crate::BootstrapSalt;

/// The name of the tar built from the staged tree.
const SALT_TAR_NAME: &str = "srv.tar";

/// Package, encrypt and upload the salt tree.
///
/// The tree is encrypted with the stack's own data key, which is fetched from one of its hosts,
/// so that only that stack can read it.
#[derive(StructOpt)]
#[structopt(name = "upload-salt")]
pub struct UploadSalt {}

impl UploadSalt {
    pub async fn run(&self, base: &BootstrapSalt) -> Result<()> {
        let app = base.app().await?;
        let project = app.ctx.load_project()?;
        let work_dir = app.ctx.project_dir()?;

        let staging = tempfile::tempdir().context("error creating staging dir")?;
        let plan = archive::staging_plan(&work_dir, &project, app.settings.contrib_dir.as_deref());
        archive::stage_salt_tree(&plan, &project, staging.path())?;
        let out = tempfile::tempdir().context("error creating output dir")?;
        let tar_path = out.path().join(SALT_TAR_NAME);
        archive::build_tar(staging.path(), &tar_path)?;
        drop(staging);

        let data_key = fetch_data_key(&app).await?;
        let encrypted = encrypt_with_data_key(&app, &tar_path, data_key).await?;

        let bucket = app.ctx.salt_bucket()?;
        s3::put_file(&app.aws.s3, &bucket, SALT_TAR_KEY, &encrypted).await?;
        tracing::info!(%bucket, key = SALT_TAR_KEY, "uploaded salt tree");
        Ok(())
    }
}

/// Encrypt a file with a KMS encrypted data key, writing `<path>.gpg`.
#[derive(StructOpt)]
#[structopt(name = "encrypt-file")]
pub struct EncryptFile {
    /// The file to encrypt.
    #[structopt(parse(from_os_str))]
    path: PathBuf,
    /// The file holding the KMS encrypted data key.
    #[structopt(long, default_value = "./salt.key.enc", parse(from_os_str))]
    key_file: PathBuf,
}

impl EncryptFile {
    pub async fn run(&self, base: &BootstrapSalt) -> Result<()> {
        let app = base.app().await?;
        let data_key = tokio::fs::read(&self.key_file)
            .await
            .with_context(|| format!("error reading key file {}", self.key_file.display()))?;
        let encrypted = encrypt_with_data_key(&app, &self.path, data_key).await?;
        tracing::info!(path = %encrypted.display(), "encrypted file");
        Ok(())
    }
}

/// Read the stack's encrypted data key from the first of its instances.
async fn fetch_data_key(app: &App) -> Result<Vec<u8>> {
    let instances = app.running_instances().await?;
    let inst = instances.first().context("no instance to fetch the data key from")?;
    let host = address_of(inst)?;
    let path = &app.settings.remote_key_path;
    let output = app
        .remote
        .run(host, &format!("cat {}", shell_quote(path)), true)
        .await
        .with_context(|| format!("error fetching data key from {}", inst.id))?;
    if !output.success() || output.stdout.is_empty() {
        tracing::error!(instance = %inst.id, %host, path = %path, stderr = %output.stderr_lossy().trim(), "error reading data key");
        bail!("could not read data key {} on {}", path, inst.id);
    }
    Ok(output.stdout)
}

/// Decrypt the given data key through KMS and use it to encrypt the file at `path`.
async fn encrypt_with_data_key(app: &App, path: &Path, data_key: Vec<u8>) -> Result<PathBuf> {
    let plaintext = kms::decrypt(&app.aws.kms, data_key).await?;
    archive::encrypt_file(path, &base64::encode(plaintext)).await
}

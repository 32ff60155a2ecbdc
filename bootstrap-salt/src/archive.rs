//! Packaging of the salt tree shipped to the hosts, and its unpacking on them.

use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::ProjectConfig;

/// The name of the pillar file holding the project config.
pub const PROJECT_PILLAR_FILE: &str = "cloudformation.sls";
/// The remote root of vendored salt formulas.
const FORMULAS_DIR: &str = "/srv/salt-formulas";
/// The grain publishing the instance ID which state runs target minions by.
const INSTANCE_GRAIN_NAME: &str = "aws_instance_id.py";
const INSTANCE_GRAIN: &str = include_str!("../grains/aws_instance_id.py");
const MODE_SHARED: u32 = 0o755;
const MODE_PRIVATE: u32 = 0o700;

/// A local directory to be shipped, and where it lands on the hosts.
#[derive(Clone, Debug, PartialEq)]
pub struct StagedDir {
    pub source: PathBuf,
    /// The absolute remote path.
    pub dest: String,
    /// A missing required source fails staging, a missing optional one is skipped.
    pub required: bool,
}

/// A file shipped with this tool, and where it lands on the hosts.
#[derive(Clone, Debug, PartialEq)]
pub struct BundledFile {
    /// The absolute remote path.
    pub dest: String,
    pub contents: &'static str,
}

/// Everything making up the salt tree of a project.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StagingPlan {
    pub dirs: Vec<StagedDir>,
    /// Written after the directories, so a project file of the same name is replaced.
    pub files: Vec<BundledFile>,
}

/// Build the staging plan of the salt tree of a project.
///
/// The instance ID grain is always part of the tree, since minions are targeted through it.
pub fn staging_plan(work_dir: &Path, project: &ProjectConfig, contrib_dir: Option<&Path>) -> StagingPlan {
    let salt = &project.salt;
    let grains_dir = format!("{}/_grains", salt.remote_state_dir.trim_end_matches('/'));
    let mut dirs = vec![
        StagedDir {
            source: work_dir.join(&salt.local_salt_dir),
            dest: salt.remote_state_dir.clone(),
            required: true,
        },
        StagedDir {
            source: work_dir.join(project.env_pillar_dir()),
            dest: salt.remote_pillar_dir.clone(),
            required: true,
        },
        StagedDir {
            source: work_dir.join(&salt.local_vendor_dir).join("_root"),
            dest: FORMULAS_DIR.into(),
            required: false,
        },
    ];
    if let Some(contrib) = contrib_dir {
        dirs.push(StagedDir {
            source: contrib.join("srv/salt/_grains"),
            dest: grains_dir.clone(),
            required: false,
        });
        dirs.push(StagedDir {
            source: contrib.join("etc"),
            dest: "/etc".into(),
            required: false,
        });
        dirs.push(StagedDir {
            source: contrib.join("usr"),
            dest: "/usr".into(),
            required: false,
        });
    }
    StagingPlan {
        dirs,
        files: vec![BundledFile {
            dest: format!("{}/{}", grains_dir, INSTANCE_GRAIN_NAME),
            contents: INSTANCE_GRAIN,
        }],
    }
}

/// The path under `staging` standing in for the given absolute remote path.
pub fn staged_path(staging: &Path, remote: &str) -> PathBuf {
    staging.join(remote.trim_start_matches('/'))
}

/// Copy the planned directories and files into `staging`, then write the project pillar and set
/// permissions.
#[tracing::instrument(level = "debug", skip(plan, project))]
pub fn stage_salt_tree(plan: &StagingPlan, project: &ProjectConfig, staging: &Path) -> Result<()> {
    for dir in plan.dirs.iter() {
        if !dir.source.is_dir() {
            if dir.required {
                bail!("salt tree directory {} does not exist", dir.source.display());
            }
            tracing::debug!(source = %dir.source.display(), "skipping missing optional directory");
            continue;
        }
        copy_tree(&dir.source, &staged_path(staging, &dir.dest))?;
    }
    for file in plan.files.iter() {
        let path = staged_path(staging, &file.dest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("error creating {}", parent.display()))?;
        }
        fs::write(&path, file.contents).with_context(|| format!("error writing {}", path.display()))?;
    }

    let pillar_root = staged_path(staging, &project.salt.remote_pillar_dir);
    fs::create_dir_all(&pillar_root).with_context(|| format!("error creating {}", pillar_root.display()))?;
    let contents = serde_yaml::to_string(&project.raw).context("error serializing project config pillar")?;
    let pillar_path = pillar_root.join(PROJECT_PILLAR_FILE);
    fs::write(&pillar_path, contents).with_context(|| format!("error writing {}", pillar_path.display()))?;

    set_mode_recursive(staging, MODE_SHARED)?;
    set_mode_recursive(&staged_path(staging, &project.salt.remote_state_dir), MODE_PRIVATE)?;
    set_mode_recursive(&pillar_root, MODE_PRIVATE)?;
    Ok(())
}

/// Copy the tree at `src` into `dst`, merging into whatever `dst` already holds.
///
/// Symlinks are followed, so their targets are copied.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("error creating {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("error reading {}", src.display()))? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to).with_context(|| format!("error copying {} to {}", from.display(), to.display()))?;
        }
    }
    Ok(())
}

fn set_mode_recursive(path: &Path, mode: u32) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).with_context(|| format!("error setting mode of {}", path.display()))?;
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            set_mode_recursive(&entry?.path(), mode)?;
        }
    }
    Ok(())
}

/// Build a tar of the contents of `root` at `out`.
pub fn build_tar(root: &Path, out: &Path) -> Result<()> {
    let file = File::create(out).with_context(|| format!("error creating {}", out.display()))?;
    let mut builder = tar::Builder::new(file);
    builder.append_dir_all(".", root).with_context(|| format!("error archiving {}", root.display()))?;
    builder.into_inner().context("error finishing tar")?;
    Ok(())
}

/// The path of the encrypted copy of `path`.
pub fn encrypted_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".gpg");
    PathBuf::from(name)
}

/// Symmetrically encrypt the file at `path` with AES256 through `gpg`, writing `<path>.gpg`.
#[tracing::instrument(level = "debug", skip(passphrase))]
pub async fn encrypt_file(path: &Path, passphrase: &str) -> Result<PathBuf> {
    let out = encrypted_path(path);
    run_gpg(&["--symmetric", "--cipher-algo", "AES256"], path, &out, passphrase)
        .await
        .with_context(|| format!("error encrypting {}", path.display()))?;
    Ok(out)
}

/// Decrypt the file at `path` written by `encrypt_file` into `out`.
#[tracing::instrument(level = "debug", skip(passphrase))]
pub async fn decrypt_file(path: &Path, out: &Path, passphrase: &str) -> Result<()> {
    run_gpg(&["--decrypt"], path, out, passphrase)
        .await
        .with_context(|| format!("error decrypting {}", path.display()))
}

async fn run_gpg(args: &[&str], input: &Path, out: &Path, passphrase: &str) -> Result<()> {
    let mut child = Command::new("gpg")
        .args(["--batch", "--yes", "--quiet", "--pinentry-mode", "loopback", "--passphrase-fd", "0"])
        .args(args)
        .arg("--output")
        .arg(out)
        .arg(input)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("error spawning gpg")?;
    let mut stdin = child.stdin.take().context("gpg stdin was not captured")?;
    stdin.write_all(passphrase.as_bytes()).await.context("error passing passphrase to gpg")?;
    stdin.write_all(b"\n").await.context("error passing passphrase to gpg")?;
    drop(stdin);

    let output = child.wait_with_output().await.context("error waiting on gpg")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::error!(path = %input.display(), stderr = %stderr.trim(), "gpg failed");
        bail!("gpg exited with {}: {}", output.status, stderr.trim());
    }
    Ok(())
}

/// Unpack the tar at `tar_path` into `dest`, keeping the modes of its entries.
///
/// Ownership is not restored, so entries belong to the user running the extraction.
pub fn extract_tar(tar_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(tar_path).with_context(|| format!("error opening {}", tar_path.display()))?;
    let mut archive = tar::Archive::new(file);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive
        .unpack(dest)
        .with_context(|| format!("error extracting {} into {}", tar_path.display(), dest.display()))
}

/// Replace the given trees under `root` with the contents of the tar at `tar_path`.
///
/// Each of `replaced`, relative to `root`, is removed first so that files dropped from the tree do
/// not linger. Everything else under `root` is merged.
#[tracing::instrument(level = "debug")]
pub fn replace_salt_tree(tar_path: &Path, root: &Path, replaced: &[&str]) -> Result<()> {
    for dir in replaced {
        let path = root.join(dir);
        match fs::remove_dir_all(&path) {
            Ok(()) => tracing::info!(path = %path.display(), "removed previous salt tree"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => return Err(err).with_context(|| format!("error removing {}", path.display())),
        }
    }
    extract_tar(tar_path, root)?;
    tracing::info!(tar = %tar_path.display(), root = %root.display(), "extracted salt tree");
    Ok(())
}

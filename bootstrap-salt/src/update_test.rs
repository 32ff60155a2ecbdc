use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use async_trait::async_trait;
use bootstrap_salt_core::error::find_deploy_error;
use bootstrap_salt_core::DeployError;
use tempfile::TempDir;

use crate::archive::build_tar;
use crate::fixtures::FakeRemote;
use crate::remote::CommandOutput;
use crate::salt::SaltFunction;
use crate::update::{refresh_salt_tree, run_local_state, run_on_host, HostPaths, HostRunOptions, SaltTreeSource};

/// A source handing out a prepared tar, or nothing, or an error.
struct TarSource {
    tar: Option<PathBuf>,
    fail: bool,
}

#[async_trait]
impl SaltTreeSource for TarSource {
    async fn fetch_tar(&self, paths: &HostPaths) -> Result<bool> {
        if self.fail {
            bail!("access denied to bucket");
        }
        match &self.tar {
            Some(tar) => {
                fs::copy(tar, &paths.tar)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn write(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

/// A host root holding a previous tree, and a tar of the new one.
fn host() -> Result<(TempDir, HostPaths, PathBuf)> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("root");
    write(&root.join("srv/salt/old.sls"), "old: {}\n")?;
    write(&root.join("srv/pillar/old.sls"), "old: {}\n")?;
    write(&root.join("etc/salt/minion"), "master: 10.0.0.1\n")?;

    let tree = dir.path().join("tree");
    write(&tree.join("srv/salt/top.sls"), "base: {}\n")?;
    write(&tree.join("srv/pillar/top.sls"), "base: {}\n")?;
    let tar = dir.path().join("upload.tar");
    build_tar(&tree, &tar)?;

    let paths = HostPaths {
        encrypted: dir.path().join("srv.tar.gpg"),
        tar: dir.path().join("srv.tar"),
        root,
    };
    Ok((dir, paths, tar))
}

fn salt_calls(remote: &FakeRemote) -> Vec<String> {
    remote.commands().into_iter().map(|(_, command, _)| command).collect()
}

fn answer_salt_calls(remote: &FakeRemote, state_result: serde_json::Value) {
    remote.set_handler(move |_, command, _| {
        if command.contains("state.") {
            Ok(CommandOutput::ok(serde_json::json!({ "local": state_result.clone() }).to_string()))
        } else {
            Ok(CommandOutput::ok(r#"{"local": true}"#))
        }
    });
}

#[tokio::test]
async fn refresh_salt_tree_replaces_tree_and_syncs_minion() -> Result<()> {
    let (_dir, paths, tar) = host()?;
    let remote = FakeRemote::new();
    answer_salt_calls(&remote, serde_json::json!({}));

    let refreshed = refresh_salt_tree(&TarSource { tar: Some(tar), fail: false }, remote.as_ref(), &paths).await?;

    assert!(refreshed, "expected the tree to be refreshed");
    assert!(paths.root.join("srv/salt/top.sls").is_file(), "expected the new states to be extracted");
    assert!(paths.root.join("srv/pillar/top.sls").is_file(), "expected the new pillar to be extracted");
    assert!(!paths.root.join("srv/salt/old.sls").exists(), "expected stale states to be removed");
    assert!(!paths.root.join("srv/pillar/old.sls").exists(), "expected stale pillars to be removed");
    assert!(paths.root.join("etc/salt/minion").is_file(), "expected files outside the salt tree to be kept");

    let calls = salt_calls(&remote);
    assert!(calls.len() == 2, "expected two salt calls, got {:?}", calls);
    assert!(calls[0].ends_with("saltutil.clear_cache"), "expected the cache to be cleared first, got {}", calls[0]);
    assert!(calls[1].ends_with("saltutil.sync_all 'refresh=True'"), "expected modules to be synced, got {}", calls[1]);
    assert!(remote.commands().iter().all(|(_, _, sudo)| *sudo), "expected salt calls to run as root");
    Ok(())
}

#[tokio::test]
async fn refresh_salt_tree_is_a_noop_before_first_upload() -> Result<()> {
    let (_dir, paths, _tar) = host()?;
    let remote = FakeRemote::new();

    let refreshed = refresh_salt_tree(&TarSource { tar: None, fail: false }, remote.as_ref(), &paths).await?;

    assert!(!refreshed, "expected nothing to be refreshed");
    assert!(paths.root.join("srv/salt/old.sls").is_file(), "expected the previous tree to be left alone");
    assert!(remote.commands().is_empty(), "expected no salt calls, got {:?}", remote.commands());
    Ok(())
}

#[tokio::test]
async fn refresh_salt_tree_falls_back_to_previous_tar() -> Result<()> {
    let (_dir, paths, tar) = host()?;
    fs::copy(&tar, &paths.tar)?;
    let remote = FakeRemote::new();
    answer_salt_calls(&remote, serde_json::json!({}));

    let refreshed = refresh_salt_tree(&TarSource { tar: None, fail: false }, remote.as_ref(), &paths).await?;

    assert!(refreshed, "expected the previous tar to be reused");
    assert!(paths.root.join("srv/salt/top.sls").is_file(), "expected the previous tar to be extracted");
    Ok(())
}

#[test]
fn host_run_options_require_exactly_one_of_state_and_update_only() -> Result<()> {
    let highstate = HostRunOptions {
        state: Some("highstate".into()),
        ..Default::default()
    };
    assert!(highstate.function()? == Some(SaltFunction::Highstate), "expected highstate to map to state.highstate");

    let named = HostRunOptions {
        state: Some("nginx".into()),
        ..Default::default()
    };
    assert!(named.function()? == Some(SaltFunction::Sls("nginx".into())), "expected a named state to map to state.sls");

    let update_only = HostRunOptions {
        update_only: true,
        ..Default::default()
    };
    assert!(update_only.function()?.is_none(), "expected no state when only updating");

    for opts in [
        HostRunOptions::default(),
        HostRunOptions {
            state: Some("highstate".into()),
            update_only: true,
            ..Default::default()
        },
    ] {
        let res = opts.function();
        assert!(matches!(res, Err(DeployError::InvalidInput(_))), "expected {:?} to be rejected, got {:?}", opts, res);
    }
    Ok(())
}

#[tokio::test]
async fn run_on_host_stops_on_failed_update() -> Result<()> {
    let (_dir, paths, _tar) = host()?;
    let remote = FakeRemote::new();
    answer_salt_calls(&remote, serde_json::json!({"s": {"result": true}}));
    let opts = HostRunOptions {
        state: Some("highstate".into()),
        ..Default::default()
    };

    let err = run_on_host(&opts, &TarSource { tar: None, fail: true }, remote.as_ref(), &paths)
        .await
        .expect_err("expected the failed update to fail the run");
    assert!(format!("{:?}", err).contains("access denied"), "unexpected error {:?}", err);
    assert!(remote.commands().is_empty(), "expected no state run after a failed update, got {:?}", remote.commands());
    Ok(())
}

#[tokio::test]
async fn run_on_host_ignores_errors_when_asked() -> Result<()> {
    let (_dir, paths, _tar) = host()?;
    let remote = FakeRemote::new();
    answer_salt_calls(&remote, serde_json::json!({"s": {"result": false, "comment": "nope"}}));
    let opts = HostRunOptions {
        state: Some("nginx".into()),
        ignore_errors: true,
        ..Default::default()
    };

    run_on_host(&opts, &TarSource { tar: None, fail: true }, remote.as_ref(), &paths).await?;

    let calls = salt_calls(&remote);
    assert!(calls.len() == 1 && calls[0].ends_with("state.sls 'nginx'"), "expected the state to run despite the failed update, got {:?}", calls);
    Ok(())
}

#[tokio::test]
async fn run_on_host_skips_update_when_disabled() -> Result<()> {
    let (_dir, paths, tar) = host()?;
    let remote = FakeRemote::new();
    answer_salt_calls(&remote, serde_json::json!({"s": {"result": true}}));
    let opts = HostRunOptions {
        state: Some("highstate".into()),
        disable_update: true,
        ..Default::default()
    };

    run_on_host(&opts, &TarSource { tar: Some(tar), fail: false }, remote.as_ref(), &paths).await?;

    assert!(paths.root.join("srv/salt/old.sls").is_file(), "expected the tree to be left alone");
    let calls = salt_calls(&remote);
    assert!(calls.len() == 1 && calls[0].ends_with("state.highstate"), "expected only the highstate, got {:?}", calls);
    Ok(())
}

#[tokio::test]
async fn run_local_state_fails_on_failed_state() -> Result<()> {
    let remote = FakeRemote::new();
    answer_salt_calls(&remote, serde_json::json!({"pkg_|-nginx_|-nginx_|-installed": {"result": false, "comment": "no such package"}}));

    let err = run_local_state(remote.as_ref(), &SaltFunction::Highstate)
        .await
        .expect_err("expected a failed state to fail the run");
    assert!(
        matches!(find_deploy_error(&err), Some(DeployError::StateExecution { minion, .. }) if minion == "local"),
        "unexpected error {:?}",
        err
    );
    Ok(())
}

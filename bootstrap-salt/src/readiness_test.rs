use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bootstrap_salt_core::error::find_deploy_error;
use bootstrap_salt_core::models::StackIdentifier;
use bootstrap_salt_core::poll::PollSchedule;
use bootstrap_salt_core::tags::Tags;
use bootstrap_salt_core::DeployError;

use crate::fixtures::{instance, ip, FakeCloud, FakeRemote};
use crate::readiness::{check_admins_exist, wait_for_bootstrap, wait_for_ssh};
use crate::remote::{CommandOutput, ConnectionLost};

const STACK: &str = "myapp-dev";
const MARKER: &str = "/tmp/bootstrap_done";

fn schedule() -> PollSchedule {
    PollSchedule::new(Duration::from_millis(10), Duration::from_millis(1))
}

fn cloud() -> FakeCloud {
    FakeCloud::with_stack(
        STACK,
        vec![
            instance("i-1", "10.0.0.1", Some("52.0.0.1"), Tags::new()),
            instance("i-2", "10.0.0.2", Some("52.0.0.2"), Tags::new()),
        ],
    )
}

#[tokio::test]
async fn wait_for_ssh_only_considers_running_instances() -> Result<()> {
    let cloud = cloud();
    let remote = FakeRemote::new();
    let stack = StackIdentifier::from(STACK);
    remote.set_reachable(ip("52.0.0.2"), false);

    let res = wait_for_ssh(&cloud, remote.as_ref(), &stack, schedule()).await;
    let err = res.expect_err("expected an unreachable host to time out");
    assert!(matches!(find_deploy_error(&err), Some(DeployError::Timeout { .. })), "expected a timeout, got {:?}", err);

    cloud.set_state("i-2", "stopped");
    let instances = wait_for_ssh(&cloud, remote.as_ref(), &stack, schedule()).await?;
    let ids: Vec<&str> = instances.iter().map(|inst| inst.id.as_str()).collect();
    assert!(ids == vec!["i-1"], "expected only the running instance, got {:?}", ids);
    Ok(())
}

#[tokio::test]
async fn wait_for_bootstrap_recovers_from_connection_loss() -> Result<()> {
    let cloud = cloud();
    cloud.set_state("i-2", "stopped");
    let remote = FakeRemote::new();
    let checks = Arc::new(AtomicUsize::new(0));
    let counter = checks.clone();
    remote.set_handler(move |host, command, _| {
        if !command.contains(MARKER) {
            return Ok(CommandOutput::ok(""));
        }
        match counter.fetch_add(1, Ordering::SeqCst) {
            // The host reboots during the first check.
            0 => Err(ConnectionLost { host }.into()),
            1 => Ok(CommandOutput::failed(1, "")),
            _ => Ok(CommandOutput::ok("")),
        }
    });

    wait_for_bootstrap(&cloud, remote.as_ref(), &StackIdentifier::from(STACK), MARKER, schedule(), schedule()).await?;

    assert!(checks.load(Ordering::SeqCst) == 3, "expected three marker checks, got {}", checks.load(Ordering::SeqCst));
    Ok(())
}

#[tokio::test]
async fn wait_for_bootstrap_times_out_without_markers() -> Result<()> {
    let cloud = cloud();
    let remote = FakeRemote::new();
    remote.set_handler(|_, command, _| {
        if command.contains(MARKER) {
            return Ok(CommandOutput::failed(1, ""));
        }
        Ok(CommandOutput::ok(""))
    });

    let err = wait_for_bootstrap(&cloud, remote.as_ref(), &StackIdentifier::from(STACK), MARKER, schedule(), schedule())
        .await
        .expect_err("expected missing markers to time out");

    assert!(
        matches!(find_deploy_error(&err), Some(DeployError::Timeout { what, attempts: 10 }) if what.contains("bootstrap")),
        "expected a bootstrap timeout after 10 attempts, got {:?}",
        err
    );
    Ok(())
}

#[tokio::test]
async fn check_admins_exist_fails_on_host_without_admins() -> Result<()> {
    let remote = FakeRemote::new();
    remote.set_handler(|host, _, _| {
        if host == ip("52.0.0.1") {
            return Ok(CommandOutput::ok(r#"{"local": {"alice": {"public_keys": []}}}"#));
        }
        Ok(CommandOutput::ok(r#"{"local": {}}"#))
    });
    let instances = vec![
        instance("i-1", "10.0.0.1", Some("52.0.0.1"), Tags::new()),
        instance("i-2", "10.0.0.2", Some("52.0.0.2"), Tags::new()),
    ];

    check_admins_exist(remote.as_ref(), &instances[..1]).await?;
    let err = check_admins_exist(remote.as_ref(), &instances).await.expect_err("expected missing admins to fail");

    assert!(
        matches!(find_deploy_error(&err), Some(DeployError::AdminsMissing(host)) if host == "52.0.0.2"),
        "expected the host without admins to be named, got {:?}",
        err
    );
    let commands = remote.commands();
    assert!(commands.iter().all(|(_, cmd, sudo)| *sudo && cmd.contains("pillar.get 'admins'")), "unexpected commands {:?}", commands);
    Ok(())
}

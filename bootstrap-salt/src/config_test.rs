use std::path::PathBuf;

use anyhow::Result;
use bootstrap_salt_core::DeployError;

use crate::config::{Context, ProjectConfig, Settings, DEFAULT_TAG, ENV_PREFIX};
use crate::github::{TeamSpec, UserSpec};

const PROJECT_YAML: &str = r#"
dev:
  master_zone: dsd.io
  salt:
    local_salt_dir: states
  github_users:
    ministryofjustice:
      teams:
        - webops
      individuals:
        - alice
        - bob:
            unix_username: bobby
  ec2:
    tags:
      Role: web
prod:
  salt:
    remote_state_dir: /opt/salt
"#;

#[test]
fn settings_deserialize_with_defaults() -> Result<()> {
    let settings: Settings = envy::prefixed(ENV_PREFIX).from_iter(vec![("BOOTSTRAP_SALT_SSH_USER".to_string(), "admin".to_string())])?;

    assert!(settings.ssh_user == "admin", "unexpected value parsed for SSH_USER, got {}, expected {}", settings.ssh_user, "admin");
    assert!(settings.aws_region == "eu-west-1", "unexpected default for AWS_REGION, got {}", settings.aws_region);
    assert!(settings.bootstrap_marker == "/tmp/bootstrap_done", "unexpected default marker {}", settings.bootstrap_marker);
    assert!(settings.github_api == "https://api.github.com", "unexpected default github api {}", settings.github_api);
    assert!(settings.ssh_key.is_none(), "expected no ssh key by default");
    let schedule = settings.wait_schedule();
    assert!(schedule.max_attempts() == 60, "expected 60 attempts from the default wait schedule, got {}", schedule.max_attempts());
    Ok(())
}

#[test]
fn settings_deserialize_from_full_env() -> Result<()> {
    let settings: Settings = envy::prefixed(ENV_PREFIX).from_iter(vec![
        ("BOOTSTRAP_SALT_AWS_REGION".to_string(), "us-east-1".to_string()),
        ("BOOTSTRAP_SALT_SSH_KEY".to_string(), "/home/deploy/.ssh/id_rsa".to_string()),
        ("BOOTSTRAP_SALT_WAIT_TIMEOUT".to_string(), "30".to_string()),
        ("BOOTSTRAP_SALT_WAIT_INTERVAL".to_string(), "5".to_string()),
        ("BOOTSTRAP_SALT_GITHUB_MAX_PAGES".to_string(), "3".to_string()),
    ])?;

    assert!(settings.aws_region == "us-east-1", "unexpected value parsed for AWS_REGION, got {}", settings.aws_region);
    assert!(
        settings.ssh_key == Some(PathBuf::from("/home/deploy/.ssh/id_rsa")),
        "unexpected value parsed for SSH_KEY, got {:?}",
        settings.ssh_key
    );
    assert!(settings.wait_schedule().max_attempts() == 6, "expected 6 attempts, got {}", settings.wait_schedule().max_attempts());
    assert!(settings.github_max_pages == 3, "unexpected value parsed for GITHUB_MAX_PAGES, got {}", settings.github_max_pages);
    Ok(())
}

#[test]
fn context_derives_stack_and_record_names() -> Result<()> {
    let ctx = Context::new(
        Some("dev".into()),
        None,
        Some("Dev".into()),
        Some("MyApp".into()),
        None,
        None,
        Some("myapp.yaml".into()),
    );

    assert!(ctx.stack()?.as_str() == "myapp-dev", "unexpected stack name {}", ctx.stack()?);
    assert!(ctx.tag() == DEFAULT_TAG, "expected default tag, got {}", ctx.tag());
    assert!(ctx.kms_alias()? == "alias/myapp-dev", "unexpected kms alias {}", ctx.kms_alias()?);
    assert!(ctx.salt_bucket()? == "myapp-dev-salt", "unexpected bucket {}", ctx.salt_bucket()?);
    let record = ctx.master_dns_name("dsd.io.")?;
    assert!(record == "master.active.dev.myapp.dsd.io", "unexpected master record {}", record);
    Ok(())
}

#[test]
fn context_prefers_explicit_stack_name() -> Result<()> {
    let ctx = Context::new(None, None, None, None, Some("Blue".into()), Some("legacy-stack".into()), None);
    assert!(ctx.stack()?.as_str() == "legacy-stack", "unexpected stack name {}", ctx.stack()?);
    assert!(ctx.tag() == "blue", "expected lowercased tag, got {}", ctx.tag());
    Ok(())
}

#[test]
fn context_project_dir_is_config_parent() -> Result<()> {
    let nested = Context::new(None, None, None, None, None, None, Some(PathBuf::from("/work/app/project.yaml")));
    assert!(nested.project_dir()? == PathBuf::from("/work/app"), "unexpected project dir {:?}", nested.project_dir()?);
    let bare = Context::new(None, None, None, None, None, None, Some(PathBuf::from("project.yaml")));
    assert!(bare.project_dir()? == PathBuf::from("."), "expected a bare file name to resolve to cwd, got {:?}", bare.project_dir()?);
    Ok(())
}

#[test]
fn context_reports_missing_selections() -> Result<()> {
    let ctx = Context::new(None, None, Some("dev".into()), Some("  ".into()), None, None, None);

    assert!(matches!(ctx.aws_profile(), Err(DeployError::MissingContext(_))), "expected missing account");
    assert!(matches!(ctx.application(), Err(DeployError::MissingContext(_))), "expected blank application to count as missing");
    assert!(matches!(ctx.stack(), Err(DeployError::MissingContext(_))), "expected stack to require an application");
    assert!(matches!(ctx.config_path(), Err(DeployError::MissingContext(_))), "expected missing config path");
    Ok(())
}

#[test]
fn project_config_loads_environment_section() -> Result<()> {
    let project = ProjectConfig::parse(PROJECT_YAML, "dev")?;

    assert!(project.master_zone.as_deref() == Some("dsd.io"), "unexpected master zone {:?}", project.master_zone);
    assert!(project.salt.local_salt_dir == PathBuf::from("states"), "unexpected salt dir {:?}", project.salt.local_salt_dir);
    assert!(project.salt.local_pillar_dir == PathBuf::from("pillar"), "expected default pillar dir, got {:?}", project.salt.local_pillar_dir);
    assert!(project.env_pillar_dir() == PathBuf::from("pillar/dev"), "unexpected env pillar dir {:?}", project.env_pillar_dir());

    let org = project.github_users.get("ministryofjustice").expect("expected org to be parsed");
    assert!(matches!(org.teams.as_slice(), [TeamSpec::Name(team)] if team == "webops"), "unexpected teams {:?}", org.teams);
    assert!(org.individuals.len() == 2, "expected 2 individuals, got {}", org.individuals.len());
    assert!(matches!(&org.individuals[0], UserSpec::Name(name) if name == "alice"), "unexpected first individual {:?}", org.individuals[0]);
    match &org.individuals[1] {
        UserSpec::WithData(data) => {
            let bob = data.get("bob").expect("expected bob's data");
            assert!(bob.unix_username.as_deref() == Some("bobby"), "unexpected unix username {:?}", bob.unix_username);
        }
        other => panic!("expected bob to carry user data, got {:?}", other),
    }

    assert!(project.raw.get("ec2").is_some(), "expected raw section to keep unknown keys");
    Ok(())
}

#[test]
fn project_config_defaults_and_missing_environment() -> Result<()> {
    let project = ProjectConfig::parse(PROJECT_YAML, "prod")?;
    assert!(project.master_zone.is_none(), "expected no master zone for prod");
    assert!(project.salt.remote_state_dir == "/opt/salt", "unexpected remote state dir {}", project.salt.remote_state_dir);
    assert!(project.github_users.is_empty(), "expected no github users for prod");

    let err = ProjectConfig::parse(PROJECT_YAML, "staging").expect_err("expected unknown environment to fail");
    assert!(
        matches!(bootstrap_salt_core::error::find_deploy_error(&err), Some(DeployError::InvalidInput(_))),
        "expected invalid input error, got {:?}",
        err
    );
    Ok(())
}

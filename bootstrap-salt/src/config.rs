//! Runtime configuration.
//!
//! Configuration is split in three. `Settings` holds tunables taken from the process
//! environment. `Context` holds the operator's selections from the command line (account,
//! environment, application and the like) and is built once per invocation. `ProjectConfig`
//! is the per-project YAML file with one section per environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use bootstrap_salt_core::models::StackIdentifier;
use bootstrap_salt_core::poll::PollSchedule;
use bootstrap_salt_core::DeployError;
use serde::Deserialize;

use crate::github::GithubUsers;

/// The prefix of all env vars read into `Settings`.
pub const ENV_PREFIX: &str = "BOOTSTRAP_SALT_";
/// The env var holding the GitHub API token.
pub const ENV_GH_TOKEN: &str = "GH_TOKEN";
/// The env var holding the role to assume for the `cross-account` profile.
pub const ENV_AWS_ROLE_ARN_ID: &str = "AWS_ROLE_ARN_ID";
/// The AWS profile which triggers a cross-account role assumption.
pub const CROSS_ACCOUNT_PROFILE: &str = "cross-account";

/// Runtime tunables, parsed from `BOOTSTRAP_SALT_*` env vars.
#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    /// The AWS region used when none is given on the command line.
    #[serde(default = "Settings::default_aws_region")]
    pub aws_region: String,
    /// The user to log in as over SSH.
    #[serde(default = "Settings::default_ssh_user")]
    pub ssh_user: String,
    /// An optional identity file to use for SSH.
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
    /// The seconds SSH waits for a connection before giving up.
    #[serde(default = "Settings::default_ssh_connect_timeout")]
    pub ssh_connect_timeout: u64,
    /// The remote directory holding `bootstrap.sh`.
    #[serde(default = "Settings::default_bootstrap_script_path")]
    pub bootstrap_script_path: String,
    /// The remote marker file written once cloud-init bootstrap has finished.
    #[serde(default = "Settings::default_bootstrap_marker")]
    pub bootstrap_marker: String,
    /// The remote path of the KMS encrypted data key written at launch.
    #[serde(default = "Settings::default_remote_key_path")]
    pub remote_key_path: String,
    /// The base URL of the GitHub API.
    #[serde(default = "Settings::default_github_api")]
    pub github_api: String,
    /// The upper bound on pages fetched from a single paginated GitHub listing.
    #[serde(default = "Settings::default_github_max_pages")]
    pub github_max_pages: usize,
    /// An optional directory holding extra `srv/salt/_grains`, `etc` and `usr` trees to ship.
    #[serde(default)]
    pub contrib_dir: Option<PathBuf>,
    /// The overall seconds to wait on a single readiness condition.
    #[serde(default = "Settings::default_wait_timeout")]
    pub wait_timeout: u64,
    /// The seconds between readiness checks.
    #[serde(default = "Settings::default_wait_interval")]
    pub wait_interval: u64,
}

impl Settings {
    /// Create a new settings instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::prefixed(ENV_PREFIX).from_env().context("error building settings from env")
    }

    /// The schedule used for SSH and marker waits.
    pub fn wait_schedule(&self) -> PollSchedule {
        PollSchedule::from_secs(self.wait_timeout, self.wait_interval)
    }

    fn default_aws_region() -> String {
        "eu-west-1".into()
    }
    fn default_ssh_user() -> String {
        "ubuntu".into()
    }
    fn default_ssh_connect_timeout() -> u64 {
        10
    }
    fn default_bootstrap_script_path() -> String {
        "/usr/local/bin".into()
    }
    fn default_bootstrap_marker() -> String {
        "/tmp/bootstrap_done".into()
    }
    fn default_remote_key_path() -> String {
        "/etc/salt.key.enc".into()
    }
    fn default_github_api() -> String {
        "https://api.github.com".into()
    }
    fn default_github_max_pages() -> usize {
        100
    }
    fn default_wait_timeout() -> u64 {
        600
    }
    fn default_wait_interval() -> u64 {
        10
    }
}

/// The operator's selections for a single invocation.
///
/// Built once from the CLI and passed by reference to every task. Selections are optional at
/// parse time since not every task needs every one of them; accessors fail with
/// `DeployError::MissingContext` when a task asks for one which was not given.
#[derive(Clone, Debug, Default)]
pub struct Context {
    aws_profile: Option<String>,
    aws_region: Option<String>,
    environment: Option<String>,
    application: Option<String>,
    tag: String,
    stack_name: Option<String>,
    config_path: Option<PathBuf>,
}

/// The stack tag used when none is given.
pub const DEFAULT_TAG: &str = "active";

impl Context {
    /// Create a new instance.
    pub fn new(
        aws_profile: Option<String>, aws_region: Option<String>, environment: Option<String>, application: Option<String>, tag: Option<String>,
        stack_name: Option<String>, config_path: Option<PathBuf>,
    ) -> Self {
        let non_empty = |val: Option<String>| val.map(|val| val.trim().to_string()).filter(|val| !val.is_empty());
        Self {
            aws_profile: non_empty(aws_profile),
            aws_region: non_empty(aws_region),
            environment: non_empty(environment).map(|val| val.to_lowercase()),
            application: non_empty(application).map(|val| val.to_lowercase()),
            tag: non_empty(tag).map(|val| val.to_lowercase()).unwrap_or_else(|| DEFAULT_TAG.into()),
            stack_name: non_empty(stack_name),
            config_path,
        }
    }

    /// The AWS profile to authenticate with.
    pub fn aws_profile(&self) -> Result<&str, DeployError> {
        self.aws_profile.as_deref().ok_or(DeployError::MissingContext("AWS account"))
    }

    /// The AWS region, falling back to the region from settings.
    pub fn aws_region<'a>(&'a self, settings: &'a Settings) -> &'a str {
        self.aws_region.as_deref().unwrap_or(&settings.aws_region)
    }

    /// The target environment, lowercased.
    pub fn environment(&self) -> Result<&str, DeployError> {
        self.environment.as_deref().ok_or(DeployError::MissingContext("environment"))
    }

    /// The application name, lowercased.
    pub fn application(&self) -> Result<&str, DeployError> {
        self.application.as_deref().ok_or(DeployError::MissingContext("application"))
    }

    /// The stack tag, `active` by default.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The path of the project config file.
    pub fn config_path(&self) -> Result<&Path, DeployError> {
        self.config_path.as_deref().ok_or(DeployError::MissingContext("project config file"))
    }

    /// The directory holding the project config, which is the root of the project's salt tree.
    pub fn project_dir(&self) -> Result<PathBuf, DeployError> {
        let path = self.config_path()?;
        Ok(match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        })
    }

    /// The stack to operate on: the explicit `--stack` value, else `<application>-<environment>`.
    pub fn stack(&self) -> Result<StackIdentifier, DeployError> {
        if let Some(name) = &self.stack_name {
            return Ok(StackIdentifier::new(name.as_str()));
        }
        Ok(StackIdentifier::new(format!("{}-{}", self.application()?, self.environment()?)))
    }

    /// The KMS alias holding this application's key, `<application>-<environment>`.
    pub fn kms_alias(&self) -> Result<String, DeployError> {
        Ok(format!("alias/{}-{}", self.application()?, self.environment()?))
    }

    /// The name of the master's DNS record within the given zone.
    pub fn master_dns_name(&self, zone: &str) -> Result<String, DeployError> {
        Ok(format!(
            "master.{}.{}.{}.{}",
            self.tag,
            self.environment()?,
            self.application()?,
            zone.trim_end_matches('.')
        ))
    }

    /// The bucket holding the encrypted salt tree, `<stack>-salt`.
    pub fn salt_bucket(&self) -> Result<String, DeployError> {
        Ok(format!("{}-salt", self.stack()?))
    }

    /// Load the project config section for the selected environment.
    pub fn load_project(&self) -> Result<ProjectConfig> {
        ProjectConfig::load(self.config_path()?, self.environment()?)
    }
}

/// The remote salt tree file which is uploaded to S3.
pub const SALT_TAR_KEY: &str = "srv.tar.gpg";

/// Salt directory settings of a project.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SaltConfig {
    #[serde(default = "SaltConfig::default_local_salt_dir")]
    pub local_salt_dir: PathBuf,
    #[serde(default = "SaltConfig::default_local_pillar_dir")]
    pub local_pillar_dir: PathBuf,
    #[serde(default = "SaltConfig::default_local_vendor_dir")]
    pub local_vendor_dir: PathBuf,
    #[serde(default = "SaltConfig::default_remote_state_dir")]
    pub remote_state_dir: String,
    #[serde(default = "SaltConfig::default_remote_pillar_dir")]
    pub remote_pillar_dir: String,
}

impl Default for SaltConfig {
    fn default() -> Self {
        Self {
            local_salt_dir: Self::default_local_salt_dir(),
            local_pillar_dir: Self::default_local_pillar_dir(),
            local_vendor_dir: Self::default_local_vendor_dir(),
            remote_state_dir: Self::default_remote_state_dir(),
            remote_pillar_dir: Self::default_remote_pillar_dir(),
        }
    }
}

impl SaltConfig {
    fn default_local_salt_dir() -> PathBuf {
        "salt".into()
    }
    fn default_local_pillar_dir() -> PathBuf {
        "pillar".into()
    }
    fn default_local_vendor_dir() -> PathBuf {
        "vendor".into()
    }
    fn default_remote_state_dir() -> String {
        "/srv/salt".into()
    }
    fn default_remote_pillar_dir() -> String {
        "/srv/pillar".into()
    }
}

/// The config of a single environment of a project.
#[derive(Clone, Debug, Deserialize)]
struct EnvironmentSection {
    #[serde(default)]
    salt: SaltConfig,
    #[serde(default)]
    github_users: GithubUsers,
    #[serde(default)]
    master_zone: Option<String>,
}

/// The project config of the selected environment.
#[derive(Clone, Debug)]
pub struct ProjectConfig {
    /// The environment this config was loaded for.
    pub environment: String,
    pub salt: SaltConfig,
    pub github_users: GithubUsers,
    /// The Route53 zone holding the master's DNS record, if any.
    pub master_zone: Option<String>,
    /// The full environment section, shipped to hosts as the `cloudformation` pillar.
    pub raw: serde_yaml::Value,
}

impl ProjectConfig {
    /// Load the given environment's section from the YAML file at `path`.
    pub fn load(path: &Path, environment: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).with_context(|| format!("error reading project config {}", path.display()))?;
        Self::parse(&contents, environment).with_context(|| format!("error parsing project config {}", path.display()))
    }

    /// Parse the given environment's section from the given YAML document.
    pub fn parse(contents: &str, environment: &str) -> Result<Self> {
        let mut sections: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(contents).context("project config must be a map of environments")?;
        let raw = sections
            .remove(environment)
            .ok_or_else(|| DeployError::InvalidInput(format!("environment {} is not defined in the project config", environment)))?;
        let section: EnvironmentSection = serde_yaml::from_value(raw.clone()).with_context(|| format!("malformed config for environment {}", environment))?;
        Ok(Self {
            environment: environment.to_string(),
            salt: section.salt,
            github_users: section.github_users,
            master_zone: section.master_zone.filter(|zone| !zone.trim().is_empty()),
            raw,
        })
    }

    /// The local pillar directory of this environment, `<local_pillar_dir>/<environment>`.
    pub fn env_pillar_dir(&self) -> PathBuf {
        self.salt.local_pillar_dir.join(&self.environment)
    }
}

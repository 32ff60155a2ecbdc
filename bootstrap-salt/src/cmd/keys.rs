//! The admins pillar.

use std::collections::BTreeSet;

use anyhow::Result;
use structopt::StructOpt;

use crate::config::Settings;
use crate::github::GithubClient;
use crate::pillar::{self, KEYS_PILLAR_FILE};
use crate::BootstrapSalt;

/// Generate the admins pillar from the GitHub users of the project config.
///
/// Every user's public keys are fetched from GitHub and written to `keys.sls` in the pillar dir
/// of the selected environment. Nothing is written when the set of admins is unchanged.
#[derive(StructOpt)]
#[structopt(name = "generate-ssh-key-pillar")]
pub struct GenerateSshKeyPillar {
    /// Ignore the existing pillar file.
    #[structopt(long)]
    force: bool,
    /// Drop removed users instead of keeping them as absent.
    #[structopt(long)]
    no_strict: bool,
}

impl GenerateSshKeyPillar {
    pub async fn run(&self, base: &BootstrapSalt) -> Result<()> {
        let ctx = base.context();
        let settings = Settings::new()?;
        let project = ctx.load_project()?;
        let path = ctx.project_dir()?.join(project.env_pillar_dir()).join(KEYS_PILLAR_FILE);

        let github = GithubClient::from_env(&settings)?;
        let fetched = github.get_keys(&project.github_users).await?;
        let current = if self.force { BTreeSet::new() } else { pillar::current_admins(&path)? };

        match pillar::merge_admins(&current, fetched, !self.no_strict) {
            Some(admins) => {
                let count = admins.len();
                pillar::write_keys_pillar(&path, admins)?;
                tracing::info!(path = %path.display(), admins = count, "wrote admins pillar");
            }
            None => tracing::info!(path = %path.display(), "admins are unchanged"),
        }
        Ok(())
    }
}

//! GitHub as a directory of operator SSH keys.
//!
//! The project config names GitHub orgs, teams and individuals; these are resolved into the
//! `admins` pillar holding each user's public keys.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Context, Result};
use bootstrap_salt_core::DeployError;
use md5::{Digest, Md5};
use reqwest::header::{HeaderMap, LINK};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{Settings, ENV_GH_TOKEN};

/// The page size requested from every paginated listing.
const PER_PAGE: &str = "100";
/// The password paired with a token under basic auth.
const TOKEN_PASSWORD: &str = "x-oauth-basic";
/// The key encodings for which a fingerprint can be computed.
const FINGERPRINT_ENCODINGS: [&str; 3] = ["ssh-rsa", "ssh-dss", "ssh-ecdsa"];

lazy_static::lazy_static! {
    static ref NEXT_LINK_RE: regex::Regex = regex::Regex::new(r#"<([^>]+)>\s*;\s*rel="next""#).expect("failed to compile next link regex");
    static ref SLUG_RE: regex::Regex = regex::Regex::new(r"[^a-z0-9]+").expect("failed to compile slug regex");
}

/// The `github_users` section of a project config: org names mapped to their users.
pub type GithubUsers = BTreeMap<String, OrgUsers>;

/// The users of a single org which should be made admins.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct OrgUsers {
    /// Teams whose members should all be admins.
    #[serde(default)]
    pub teams: Vec<TeamSpec>,
    /// Users which should be admins regardless of team membership.
    #[serde(default)]
    pub individuals: Vec<UserSpec>,
}

/// A team of an org, given either by name or as a map of names to the team's special users.
///
/// Special users are resolved with their own settings and take precedence over the same user
/// found as a plain team member.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TeamSpec {
    Name(String),
    WithUsers(BTreeMap<String, Vec<UserSpec>>),
}

/// A user, given either by login or as a map of logins to settings for that user.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum UserSpec {
    Name(String),
    WithData(BTreeMap<String, UserData>),
}

impl UserSpec {
    /// Each login of this spec along with its settings.
    fn entries(&self) -> Vec<(String, UserData)> {
        match self {
            Self::Name(name) => vec![(name.clone(), UserData::default())],
            Self::WithData(data) => data.iter().map(|(name, data)| (name.clone(), data.clone())).collect(),
        }
    }
}

/// Per-user settings.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct UserData {
    /// Only keys with these MD5 fingerprints are used, when given.
    #[serde(default)]
    pub fingerprints: Option<Vec<String>>,
    /// The unix username to create in place of the GitHub login.
    #[serde(default)]
    pub unix_username: Option<String>,
}

/// A public SSH key as written to the `admins` pillar.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub enc: String,
    pub key: String,
}

/// An entry of the `admins` pillar.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdminEntry {
    Present { public_keys: Vec<PublicKey> },
    Absent { absent: bool },
}

/// The `admins` pillar: unix usernames mapped to their entry.
pub type Admins = BTreeMap<String, AdminEntry>;

/// A team as returned by the GitHub API.
#[derive(Clone, Debug, Deserialize)]
pub struct Team {
    pub id: u64,
    pub slug: String,
}

/// A user as returned by the GitHub API.
#[derive(Clone, Debug, Deserialize)]
pub struct Member {
    pub login: String,
}

/// A public key as returned by the GitHub API.
#[derive(Clone, Debug, Deserialize)]
pub struct GithubKey {
    pub key: String,
}

/// A client of the GitHub REST API.
pub struct GithubClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    max_pages: usize,
}

impl GithubClient {
    /// Create a new instance.
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>, max_pages: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.into(),
            max_pages,
        }
    }

    /// Create a new instance using the token from `GH_TOKEN`.
    pub fn from_env(settings: &Settings) -> Result<Self> {
        let token = std::env::var(ENV_GH_TOKEN).with_context(|| format!("{} has not been defined", ENV_GH_TOKEN))?;
        Ok(Self::new(settings.github_api.as_str(), token, settings.github_max_pages))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }

    /// Fetch every page of the listing at `path`, following `rel="next"` links.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_paginated<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(self.url(path));
        let mut pages = 0;
        while let Some(url) = next.take() {
            if pages >= self.max_pages {
                bail!("listing {} has more than {} pages", path, self.max_pages);
            }
            let mut req = self.http.get(&url).basic_auth(&self.token, Some(TOKEN_PASSWORD));
            // Next links carry the original query.
            if pages == 0 {
                req = req.query(&[("per_page", PER_PAGE)]);
            }
            let res = req.send().await.with_context(|| format!("error requesting {}", url))?;
            let status = res.status();
            if status != StatusCode::OK {
                let body = res.text().await.unwrap_or_default();
                tracing::error!(%url, %status, "GitHub API request failed");
                bail!("GitHub API request failed with code: {}\n{}", status.as_u16(), body);
            }
            next = next_link(res.headers());
            let page: Vec<T> = res.json().await.with_context(|| format!("error decoding response from {}", url))?;
            items.extend(page);
            pages += 1;
        }
        Ok(items)
    }

    /// Get the teams of the given org.
    pub async fn get_teams(&self, org: &str) -> Result<Vec<Team>> {
        self.get_paginated(&format!("orgs/{}/teams", slugify(org))).await
    }

    /// Get the team of the given org by slug, if it exists.
    pub async fn get_org_team(&self, org: &str, team: &str) -> Result<Option<Team>> {
        let slug = slugify(team);
        let teams = self.get_teams(org).await?;
        Ok(teams.into_iter().find(|candidate| candidate.slug == slug))
    }

    /// Get the members of the given team; an unknown team has no members.
    pub async fn get_team_members(&self, org: &str, team: &str) -> Result<Vec<Member>> {
        match self.get_org_team(org, team).await? {
            Some(found) => self.get_paginated(&format!("teams/{}/members", found.id)).await,
            None => {
                tracing::warn!(%org, %team, "team is not part of org");
                Ok(vec![])
            }
        }
    }

    /// Get the members of the given org.
    pub async fn get_org_members(&self, org: &str) -> Result<Vec<Member>> {
        self.get_paginated(&format!("orgs/{}/members", slugify(org))).await
    }

    /// Check whether the given user is a member of the given org.
    pub async fn check_org_membership(&self, org: &str, user: &str) -> Result<bool> {
        let url = self.url(&format!("orgs/{}/members/{}", slugify(org), slugify(user)));
        let res = self
            .http
            .get(&url)
            .basic_auth(&self.token, Some(TOKEN_PASSWORD))
            .send()
            .await
            .with_context(|| format!("error requesting {}", url))?;
        Ok(res.status() == StatusCode::NO_CONTENT)
    }

    /// Get the public keys of the given user, keeping only the given fingerprints when any are given.
    pub async fn get_user_keys(&self, user: &str, fingerprints: Option<&[String]>) -> Result<Vec<GithubKey>> {
        let keys: Vec<GithubKey> = self.get_paginated(&format!("users/{}/keys", slugify(user))).await?;
        let fingerprints = match fingerprints {
            Some(fingerprints) if !fingerprints.is_empty() => fingerprints,
            _ => return Ok(keys),
        };
        let mut kept = Vec::with_capacity(keys.len());
        for key in keys {
            match key_fingerprint(&key.key) {
                Ok(fingerprint) if fingerprints.contains(&fingerprint) => kept.push(key),
                Ok(_) => (),
                Err(err) => tracing::warn!(%user, error = %err, "skipping key which cannot be fingerprinted"),
            }
        }
        Ok(kept)
    }

    /// Build the admin entry of the given user, or `None` when the user has no usable keys.
    async fn user_entry(&self, login: &str, data: &UserData) -> Result<Option<(String, AdminEntry)>> {
        let keys = self.get_user_keys(login, data.fingerprints.as_deref()).await?;
        let public_keys: Vec<PublicKey> = keys.iter().filter_map(|key| split_key(&key.key)).collect();
        if public_keys.is_empty() {
            tracing::warn!(user = %login, "user has no usable public keys, skipping");
            return Ok(None);
        }
        let name = data.unix_username.clone().unwrap_or_else(|| login.to_string());
        Ok(Some((name, AdminEntry::Present { public_keys })))
    }

    /// Resolve the given `github_users` config into the `admins` pillar.
    #[tracing::instrument(level = "debug", skip(self, users))]
    pub async fn get_keys(&self, users: &GithubUsers) -> Result<Admins> {
        let mut out = Admins::new();
        for (org, org_users) in users.iter() {
            for team in org_users.teams.iter() {
                let teams: Vec<(String, Vec<UserSpec>)> = match team {
                    TeamSpec::Name(name) => vec![(name.clone(), vec![])],
                    TeamSpec::WithUsers(teams) => teams.iter().map(|(name, specials)| (name.clone(), specials.clone())).collect(),
                };
                for (team, specials) in teams {
                    let mut special_logins = BTreeSet::new();
                    for (login, data) in specials.iter().flat_map(UserSpec::entries) {
                        if let Some((name, entry)) = self.user_entry(&login, &data).await? {
                            out.insert(name, entry);
                        }
                        special_logins.insert(login);
                    }
                    for member in self.get_team_members(org, &team).await? {
                        if special_logins.contains(&member.login) || out.contains_key(&member.login) {
                            continue;
                        }
                        if let Some((name, entry)) = self.user_entry(&member.login, &UserData::default()).await? {
                            out.insert(name, entry);
                        }
                    }
                }
            }
            for (login, data) in org_users.individuals.iter().flat_map(UserSpec::entries) {
                if let Some((name, entry)) = self.user_entry(&login, &data).await? {
                    out.insert(name, entry);
                }
            }
        }
        Ok(out)
    }
}

/// Extract the `rel="next"` URL from the given response headers.
fn next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|val| val.to_str().ok())
        .find_map(|val| NEXT_LINK_RE.captures(val).and_then(|caps| caps.get(1)).map(|url| url.as_str().to_string()))
}

/// Split an `<enc> <key> [comment]` line into its encoding and key.
fn split_key(line: &str) -> Option<PublicKey> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(enc), Some(key)) => Some(PublicKey {
            enc: enc.into(),
            key: key.into(),
        }),
        _ => None,
    }
}

/// Compute the colon separated MD5 fingerprint of an `<enc> <key> [comment]` line.
pub fn key_fingerprint(line: &str) -> Result<String, DeployError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(DeployError::InvalidInput(format!("invalid key: {}", line)));
    }
    if !FINGERPRINT_ENCODINGS.contains(&parts[0]) {
        return Err(DeployError::InvalidInput(format!("invalid enc type: {}", parts[0])));
    }
    let body = base64::decode(parts[1]).map_err(|err| DeployError::InvalidInput(format!("invalid key body: {}", err)))?;
    let digest = Md5::digest(&body);
    Ok(digest.iter().map(|byte| format!("{:02x}", byte)).collect::<Vec<_>>().join(":"))
}

/// Normalize the given name into slug form, warning when that changes it.
pub fn slugify(name: &str) -> String {
    let lowered = name.to_lowercase();
    let slug = SLUG_RE.replace_all(&lowered, "-").trim_matches('-').to_string();
    if slug != name {
        tracing::warn!(%name, %slug, "translated name into slug");
    }
    slug
}

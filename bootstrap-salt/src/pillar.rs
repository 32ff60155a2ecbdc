//! The `admins` pillar file.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::github::{AdminEntry, Admins};

/// The name of the pillar file holding the admins, within an environment's pillar dir.
pub const KEYS_PILLAR_FILE: &str = "keys.sls";

/// The share of current admins above which a removal is warned about.
const REMOVAL_WARNING_RATIO: f64 = 0.5;

#[derive(Debug, Default, Deserialize, Serialize)]
struct KeysPillar {
    #[serde(default)]
    admins: Admins,
}

/// Read the names of the admins currently in the pillar file at `path`.
///
/// A missing file has no admins.
pub fn current_admins(path: &Path) -> Result<BTreeSet<String>> {
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let contents = std::fs::read_to_string(path).with_context(|| format!("error reading {}", path.display()))?;
    if contents.trim().is_empty() {
        return Ok(BTreeSet::new());
    }
    let pillar: KeysPillar = serde_yaml::from_str(&contents).with_context(|| format!("error parsing {}", path.display()))?;
    Ok(pillar.admins.into_keys().collect())
}

/// Merge freshly fetched admins with the current ones.
///
/// Returns `None` when the set of admins is unchanged. In strict mode every current admin which
/// was not fetched again is kept as absent, so that their account gets removed from the hosts.
pub fn merge_admins(current: &BTreeSet<String>, mut fetched: Admins, strict: bool) -> Option<Admins> {
    if fetched.keys().eq(current.iter()) {
        return None;
    }
    if strict && !current.is_empty() {
        let removed: Vec<&String> = current.iter().filter(|name| !fetched.contains_key(*name)).collect();
        if removed.len() as f64 / current.len() as f64 > REMOVAL_WARNING_RATIO {
            tracing::warn!(removed = removed.len(), current = current.len(), "removing more than 50% of the current admins");
        }
        for name in removed {
            tracing::info!(admin = %name, "setting admin to absent");
            fetched.insert(name.clone(), AdminEntry::Absent { absent: true });
        }
    }
    Some(fetched)
}

/// Write the given admins as the pillar file at `path`.
pub fn write_keys_pillar(path: &Path, admins: Admins) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("error creating {}", parent.display()))?;
    }
    let contents = serde_yaml::to_string(&KeysPillar { admins }).context("error serializing admins pillar")?;
    std::fs::write(path, contents).with_context(|| format!("error writing {}", path.display()))
}

//! Typed instance tags.
//!
//! Tags are the only persistent state of the system, and they live on the instances themselves.
//! The keys which drive master election and convergence are modelled as enum variants; any other
//! key is carried through untouched as `TagKey::Other`.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// The value stored under `SaltMaster` on the master instance.
pub const MASTER_TAG_VALUE: &str = "True";

/// A tag key recognized by the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TagKey {
    /// `SaltMaster`: marks the single master instance of a stack.
    SaltMaster,
    /// `SaltMasterPrvIP`: the private IP of the master an instance was configured against.
    SaltMasterPrvIp,
    /// `aws:cloudformation:stack-id`: set by CloudFormation on every stack member.
    StackId,
    /// `aws:cloudformation:stack-name`: set by CloudFormation on every stack member.
    StackName,
    /// `Name`: the EC2 console name of the instance.
    Name,
    /// Any other tag key.
    Other(String),
}

impl TagKey {
    /// The raw key as stored by the cloud provider.
    pub fn as_str(&self) -> &str {
        match self {
            Self::SaltMaster => "SaltMaster",
            Self::SaltMasterPrvIp => "SaltMasterPrvIP",
            Self::StackId => "aws:cloudformation:stack-id",
            Self::StackName => "aws:cloudformation:stack-name",
            Self::Name => "Name",
            Self::Other(key) => key.as_str(),
        }
    }

    /// The EC2 filter name matching on the value of this tag.
    pub fn filter_name(&self) -> String {
        format!("tag:{}", self.as_str())
    }
}

impl From<&str> for TagKey {
    fn from(key: &str) -> Self {
        match key {
            "SaltMaster" => Self::SaltMaster,
            "SaltMasterPrvIP" => Self::SaltMasterPrvIp,
            "aws:cloudformation:stack-id" => Self::StackId,
            "aws:cloudformation:stack-name" => Self::StackName,
            "Name" => Self::Name,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for TagKey {
    fn from(key: String) -> Self {
        match Self::from(key.as_str()) {
            Self::Other(_) => Self::Other(key),
            known => known,
        }
    }
}

impl From<TagKey> for String {
    fn from(key: TagKey) -> Self {
        match key {
            TagKey::Other(key) => key,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of tags attached to an instance.
///
/// Keys are unique within an instance; ordering carries no meaning.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(BTreeMap<TagKey, String>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &TagKey) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: TagKey, value: impl Into<String>) -> Option<String> {
        self.0.insert(key, value.into())
    }

    /// Builder form of `insert`.
    pub fn with(mut self, key: TagKey, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Merge the given tags into this set, overwriting existing values.
    pub fn extend(&mut self, other: Tags) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TagKey, &str)> {
        self.0.iter().map(|(key, val)| (key, val.as_str()))
    }

    /// Check if these tags mark the master of a stack.
    pub fn is_master(&self) -> bool {
        self.get(&TagKey::SaltMaster).map(|val| val.eq_ignore_ascii_case(MASTER_TAG_VALUE)).unwrap_or(false)
    }

    /// The master IP recorded on this instance by a completed minion bootstrap.
    ///
    /// A value which does not parse as an IP is treated as absent.
    pub fn configured_master(&self) -> Option<IpAddr> {
        self.get(&TagKey::SaltMasterPrvIp).and_then(|val| val.trim().parse().ok())
    }

    /// The tags which mark an instance as the master reachable at the given private IP.
    pub fn master(private_ip: IpAddr) -> Self {
        Self::new()
            .with(TagKey::SaltMaster, MASTER_TAG_VALUE)
            .with(TagKey::SaltMasterPrvIp, private_ip.to_string())
    }

    /// The tags which mark an instance as a minion converged against the given master.
    pub fn minion_of(master_private_ip: IpAddr) -> Self {
        Self::new().with(TagKey::SaltMasterPrvIp, master_private_ip.to_string())
    }
}

impl<K: Into<TagKey>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(key, val)| (key.into(), val.into())).collect())
    }
}

impl IntoIterator for Tags {
    type Item = (TagKey, String);
    type IntoIter = std::collections::btree_map::IntoIter<TagKey, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

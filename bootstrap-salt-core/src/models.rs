//! Stack and instance models.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::tags::{TagKey, Tags};

/// A provider-side filter set, mapping a filter name to its required value.
///
/// Stack membership is expressed as one of these filters, so callers always pass their own copy.
pub type Filters = BTreeMap<String, String>;

/// The name or ID of a stack, as given by an operator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackIdentifier(String);

impl StackIdentifier {
    pub fn new(val: impl Into<String>) -> Self {
        Self(val.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StackIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StackIdentifier {
    fn from(val: &str) -> Self {
        Self::new(val)
    }
}

/// The canonical, immutable ID of a provisioned stack.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackId(String);

impl StackId {
    pub fn new(val: impl Into<String>) -> Self {
        Self(val.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The filter set selecting all members of this stack.
    ///
    /// The given filters are copied, never modified in place.
    pub fn member_filters(&self, filters: &Filters) -> Filters {
        let mut merged = filters.clone();
        merged.insert(TagKey::StackId.filter_name(), self.0.clone());
        merged
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single compute node of a stack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// The provider's unique ID for this instance.
    pub id: String,
    /// The public IP of the instance, present once it is network attached.
    pub public_ip: Option<IpAddr>,
    /// The private IP of the instance.
    pub private_ip: Option<IpAddr>,
    /// The tags currently attached to the instance.
    pub tags: Tags,
}

impl Instance {
    /// Check if this instance is tagged as the master of its stack.
    pub fn is_master(&self) -> bool {
        self.tags.is_master()
    }

    /// Check if this instance has been configured against the master at the given private IP.
    pub fn is_configured_against(&self, master_private_ip: IpAddr) -> bool {
        self.tags.configured_master() == Some(master_private_ip)
    }

    /// The address used to reach this instance over SSH.
    ///
    /// The public IP is preferred, falling back to the private IP for hosts without one.
    pub fn ssh_address(&self) -> Option<IpAddr> {
        self.public_ip.or(self.private_ip)
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

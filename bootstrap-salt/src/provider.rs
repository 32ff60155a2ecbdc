//! Cloud provider abstractions.
//!
//! The orchestration logic only ever talks to the cloud through these traits. The AWS backed
//! implementations live in `crate::aws`, in-memory ones used for testing live in
//! `crate::fixtures`.

use anyhow::Result;
use async_trait::async_trait;
use bootstrap_salt_core::models::{Filters, Instance, StackId, StackIdentifier};
use bootstrap_salt_core::tags::Tags;

/// The compute and tag operations used to discover and mark stack members.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Resolve a stack name or ID to its canonical stack ID.
    ///
    /// Returns `None` when no such stack exists and fails with `DeployError::AmbiguousStack`
    /// when the name matches more than one stack.
    async fn resolve_stack(&self, stack: &StackIdentifier) -> Result<Option<StackId>>;

    /// List all instances matching every one of the given filters.
    async fn describe_instances(&self, filters: &Filters) -> Result<Vec<Instance>>;

    /// Set the given tags on every one of the given instances.
    ///
    /// Provider errors are surfaced as-is, there is no retry at this layer.
    async fn set_tags(&self, instance_ids: &[String], tags: &Tags) -> Result<()>;

    /// Get the tags currently set on the given instance.
    async fn get_tags(&self, instance_id: &str) -> Result<Tags>;
}

/// A DNS record update service.
#[async_trait]
pub trait DnsService: Send + Sync {
    /// Create or replace the record `name` of the given type in `zone`.
    async fn upsert_record(&self, zone: &str, name: &str, record_type: &str, value: &str) -> Result<()>;
}

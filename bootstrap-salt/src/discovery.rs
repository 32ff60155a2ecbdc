//! Instance discovery.

use anyhow::Result;
use bootstrap_salt_core::models::{Filters, Instance, StackIdentifier};
use bootstrap_salt_core::{FILTER_INSTANCE_STATE_NAME, INSTANCE_STATE_RUNNING};

use crate::provider::CloudProvider;

/// List the instances of the given stack which also match the given filters.
///
/// An unknown stack yields an empty list. The given filters are never modified, the stack-id
/// filter is merged into a copy.
#[tracing::instrument(level = "debug", skip(provider, filters))]
pub async fn list_instances(provider: &dyn CloudProvider, stack: &StackIdentifier, filters: &Filters) -> Result<Vec<Instance>> {
    let stack_id = match provider.resolve_stack(stack).await? {
        Some(stack_id) => stack_id,
        None => {
            tracing::warn!(%stack, "stack does not exist, no instances to list");
            return Ok(vec![]);
        }
    };
    let instances = provider.describe_instances(&stack_id.member_filters(filters)).await?;
    tracing::debug!(%stack, count = instances.len(), "listed stack instances");
    Ok(instances)
}

/// List the instances of the given stack, optionally only those which are running.
pub async fn get_stack_instances(provider: &dyn CloudProvider, stack: &StackIdentifier, running_only: bool) -> Result<Vec<Instance>> {
    list_instances(provider, stack, &base_filters(running_only)).await
}

fn base_filters(running_only: bool) -> Filters {
    let mut filters = Filters::new();
    if running_only {
        filters.insert(FILTER_INSTANCE_STATE_NAME.into(), INSTANCE_STATE_RUNNING.into());
    }
    filters
}

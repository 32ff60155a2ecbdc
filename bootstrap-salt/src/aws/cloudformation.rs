//! CloudFormation stacks.

use anyhow::{Context, Result};
use aws_sdk_cloudformation::error::ProvideErrorMetadata;
use aws_sdk_cloudformation::types::{Capability, Parameter, StackStatus};
use aws_sdk_cloudformation::Client;
use bootstrap_salt_core::models::{StackId, StackIdentifier};
use bootstrap_salt_core::poll::{wait_for, PollSchedule};
use bootstrap_salt_core::DeployError;

/// The error code CloudFormation uses for, among others, unknown stacks.
const VALIDATION_ERROR: &str = "ValidationError";

/// Resolve a stack name or ID to its stack ID.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn resolve_stack(client: &Client, stack: &StackIdentifier) -> Result<Option<StackId>> {
    let res = match client.describe_stacks().stack_name(stack.as_str()).send().await {
        Ok(res) => res,
        Err(err) if err.code() == Some(VALIDATION_ERROR) && err.message().map(|msg| msg.contains("does not exist")).unwrap_or(false) => {
            return Ok(None);
        }
        Err(err) => return Err(err).with_context(|| format!("error describing stack {}", stack)),
    };
    let ids: Vec<&str> = res.stacks().iter().filter_map(|found| found.stack_id()).collect();
    match ids.as_slice() {
        [] => Ok(None),
        [id] => Ok(Some(StackId::new(*id))),
        _ => Err(DeployError::AmbiguousStack {
            name: stack.to_string(),
            count: ids.len(),
        }
        .into()),
    }
}

/// Get the status of the given stack, `None` once it no longer exists.
async fn stack_status(client: &Client, stack: &str) -> Result<Option<StackStatus>> {
    match client.describe_stacks().stack_name(stack).send().await {
        Ok(res) => Ok(res.stacks().first().and_then(|found| found.stack_status().cloned())),
        Err(err) if err.code() == Some(VALIDATION_ERROR) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("error describing stack {}", stack)),
    }
}

/// Create a stack from the given template, then wait for it to be created.
#[tracing::instrument(level = "debug", skip(client, template, parameters))]
pub async fn create_stack(client: &Client, stack: &str, template: String, parameters: Vec<(String, String)>, schedule: PollSchedule) -> Result<StackId> {
    let parameters = parameters
        .into_iter()
        .map(|(key, value)| Parameter::builder().parameter_key(key).parameter_value(value).build())
        .collect();
    let res = client
        .create_stack()
        .stack_name(stack)
        .template_body(template)
        .set_parameters(Some(parameters))
        .capabilities(Capability::CapabilityIam)
        .send()
        .await
        .with_context(|| format!("error creating stack {}", stack))?;
    let stack_id = res.stack_id().map(StackId::new).with_context(|| format!("no ID returned for stack {}", stack))?;
    tracing::info!(%stack, %stack_id, "stack creation started");

    wait_for(&format!("stack {} to be created", stack), schedule, || is_created(client, stack, stack_id.as_str())).await?;
    tracing::info!(%stack, "stack created");
    Ok(stack_id)
}

/// Delete the given stack, then wait for it to be gone.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn delete_stack(client: &Client, stack: &str, schedule: PollSchedule) -> Result<()> {
    client
        .delete_stack()
        .stack_name(stack)
        .send()
        .await
        .with_context(|| format!("error deleting stack {}", stack))?;
    tracing::info!(%stack, "stack deletion started");

    wait_for(&format!("stack {} to be deleted", stack), schedule, || is_deleted(client, stack)).await?;
    tracing::info!(%stack, "stack deleted");
    Ok(())
}

async fn is_created(client: &Client, stack: &str, stack_id: &str) -> Result<Option<()>> {
    match stack_status(client, stack_id).await? {
        Some(StackStatus::CreateComplete) => Ok(Some(())),
        Some(StackStatus::CreateInProgress) => Ok(None),
        Some(status) => {
            tracing::error!(%stack, status = status.as_str(), "stack creation failed");
            Err(DeployError::InvalidInput(format!("stack {} failed to create, status {}", stack, status.as_str())).into())
        }
        None => Err(DeployError::InvalidInput(format!("stack {} disappeared while being created", stack)).into()),
    }
}

async fn is_deleted(client: &Client, stack: &str) -> Result<Option<()>> {
    match stack_status(client, stack).await? {
        None | Some(StackStatus::DeleteComplete) => Ok(Some(())),
        Some(StackStatus::DeleteFailed) => Err(DeployError::InvalidInput(format!("stack {} failed to delete", stack)).into()),
        Some(_) => Ok(None),
    }
}

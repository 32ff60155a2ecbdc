//! EC2 instances, tags and security groups.

use anyhow::{Context, Result};
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::{Filter, IpPermission, IpRange, Tag};
use aws_sdk_ec2::Client;
use bootstrap_salt_core::models::{Filters, Instance};
use bootstrap_salt_core::tags::Tags;

/// The ports of the Salt publisher and request server.
const SALT_PORTS: (i32, i32) = (4505, 4506);
const SECURITY_GROUP_DESCRIPTION: &str = "bootstrap generated SG";
/// The error code returned when authorizing a rule which already exists.
const DUPLICATE_PERMISSION: &str = "InvalidPermission.Duplicate";

fn to_filters(filters: &Filters) -> Vec<Filter> {
    filters
        .iter()
        .map(|(name, value)| Filter::builder().name(name).values(value).build())
        .collect()
}

fn to_instance(inst: &aws_sdk_ec2::types::Instance) -> Option<Instance> {
    let id = inst.instance_id()?;
    Some(Instance {
        id: id.to_string(),
        public_ip: inst.public_ip_address().and_then(|ip| ip.parse().ok()),
        private_ip: inst.private_ip_address().and_then(|ip| ip.parse().ok()),
        tags: inst
            .tags()
            .iter()
            .filter_map(|tag| Some((tag.key()?.to_string(), tag.value().unwrap_or_default().to_string())))
            .collect(),
    })
}

/// List every instance matching all of the given filters, across all reservations and pages.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn describe_instances(client: &Client, filters: &Filters) -> Result<Vec<Instance>> {
    let filters = to_filters(filters);
    let mut instances = Vec::new();
    let mut next_token = None;
    loop {
        let res = client
            .describe_instances()
            .set_filters(Some(filters.clone()))
            .set_next_token(next_token.take())
            .send()
            .await
            .context("error describing instances")?;
        instances.extend(res.reservations().iter().flat_map(|res| res.instances().iter()).filter_map(to_instance));
        match res.next_token() {
            Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
            _ => break,
        }
    }
    Ok(instances)
}

/// Set the given tags on every given instance.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn create_tags(client: &Client, instance_ids: &[String], tags: &Tags) -> Result<()> {
    let tags: Vec<Tag> = tags.iter().map(|(key, value)| Tag::builder().key(key.as_str()).value(value).build()).collect();
    client
        .create_tags()
        .set_resources(Some(instance_ids.to_vec()))
        .set_tags(Some(tags))
        .send()
        .await
        .with_context(|| format!("error tagging instances {:?}", instance_ids))?;
    Ok(())
}

/// Get the tags of the given instance.
pub async fn describe_tags(client: &Client, instance_id: &str) -> Result<Tags> {
    let filter = Filter::builder().name("resource-id").values(instance_id).build();
    let mut tags = Tags::new();
    let mut next_token = None;
    loop {
        let res = client
            .describe_tags()
            .filters(filter.clone())
            .set_next_token(next_token.take())
            .send()
            .await
            .with_context(|| format!("error describing tags of {}", instance_id))?;
        for tag in res.tags() {
            if let Some(key) = tag.key() {
                tags.insert(key.into(), tag.value().unwrap_or_default());
            }
        }
        match res.next_token() {
            Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
            _ => break,
        }
    }
    Ok(tags)
}

/// Get the ID of the security group with the given name, if it exists.
pub async fn get_security_group(client: &Client, name: &str) -> Result<Option<String>> {
    let res = client
        .describe_security_groups()
        .filters(Filter::builder().name("group-name").values(name).build())
        .send()
        .await
        .with_context(|| format!("error describing security group {}", name))?;
    Ok(res.security_groups().iter().find_map(|group| group.group_id().map(String::from)))
}

/// Get the ID of the security group with the given name, creating it when needed.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn ensure_security_group(client: &Client, name: &str, vpc_id: Option<&str>) -> Result<String> {
    if let Some(group_id) = get_security_group(client, name).await? {
        tracing::debug!(%name, %group_id, "security group already exists");
        return Ok(group_id);
    }
    let res = client
        .create_security_group()
        .group_name(name)
        .description(SECURITY_GROUP_DESCRIPTION)
        .set_vpc_id(vpc_id.map(String::from))
        .send()
        .await
        .with_context(|| format!("error creating security group {}", name))?;
    let group_id = res.group_id().map(String::from).with_context(|| format!("no ID returned for security group {}", name))?;
    tracing::info!(%name, %group_id, "created security group");
    Ok(group_id)
}

/// Open the Salt ports of the given group to the given minion IP.
///
/// Authorizing a minion which is already authorized is not an error.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn authorize_minion(client: &Client, group_id: &str, ip: std::net::IpAddr) -> Result<()> {
    let permission = IpPermission::builder()
        .ip_protocol("tcp")
        .from_port(SALT_PORTS.0)
        .to_port(SALT_PORTS.1)
        .ip_ranges(IpRange::builder().cidr_ip(format!("{}/32", ip)).build())
        .build();
    let res = client
        .authorize_security_group_ingress()
        .group_id(group_id)
        .ip_permissions(permission)
        .send()
        .await;
    match res {
        Ok(_) => {
            tracing::info!(%group_id, %ip, "authorized minion");
            Ok(())
        }
        Err(err) if err.code() == Some(DUPLICATE_PERMISSION) => {
            tracing::debug!(%group_id, %ip, "minion already authorized");
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("error authorizing {} in {}", ip, group_id)),
    }
}

/// Get the VPC of the given instance, if any.
pub async fn instance_vpc(client: &Client, instance_id: &str) -> Result<Option<String>> {
    let res = client
        .describe_instances()
        .instance_ids(instance_id)
        .send()
        .await
        .with_context(|| format!("error describing instance {}", instance_id))?;
    Ok(res
        .reservations()
        .iter()
        .flat_map(|res| res.instances().iter())
        .find_map(|inst| inst.vpc_id().map(String::from)))
}

/// Add the given security group to the instance, keeping the groups it already has.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn attach_security_group(client: &Client, instance_id: &str, group_id: &str) -> Result<()> {
    let res = client
        .describe_instances()
        .instance_ids(instance_id)
        .send()
        .await
        .with_context(|| format!("error describing instance {}", instance_id))?;
    let mut groups: Vec<String> = res
        .reservations()
        .iter()
        .flat_map(|res| res.instances().iter())
        .flat_map(|inst| inst.security_groups().iter())
        .filter_map(|group| group.group_id().map(String::from))
        .collect();
    if groups.iter().any(|id| id == group_id) {
        tracing::debug!(%instance_id, %group_id, "security group already attached");
        return Ok(());
    }
    groups.push(group_id.to_string());
    client
        .modify_instance_attribute()
        .instance_id(instance_id)
        .set_groups(Some(groups))
        .send()
        .await
        .with_context(|| format!("error attaching {} to {}", group_id, instance_id))?;
    tracing::info!(%instance_id, %group_id, "attached security group");
    Ok(())
}

//! Route53 DNS records.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_route53::types::{Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType};
use aws_sdk_route53::Client;

use crate::election::MASTER_RECORD_TTL;
use crate::provider::DnsService;

/// DNS records managed through Route53.
pub struct Route53Dns {
    client: Client,
}

impl Route53Dns {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Get the ID of the hosted zone with the given name, if any.
    pub async fn hosted_zone_id(&self, zone: &str) -> Result<Option<String>> {
        let zone = format!("{}.", zone.trim_end_matches('.'));
        let res = self
            .client
            .list_hosted_zones_by_name()
            .dns_name(&zone)
            .max_items(1)
            .send()
            .await
            .with_context(|| format!("error looking up hosted zone {}", zone))?;
        Ok(res
            .hosted_zones()
            .iter()
            .find(|found| found.name() == zone)
            .map(|found| found.id().trim_start_matches("/hostedzone/").to_string()))
    }
}

#[async_trait]
impl DnsService for Route53Dns {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn upsert_record(&self, zone: &str, name: &str, record_type: &str, value: &str) -> Result<()> {
        let zone_id = self.hosted_zone_id(zone).await?.with_context(|| format!("hosted zone {} does not exist", zone))?;
        let record_set = ResourceRecordSet::builder()
            .name(name)
            .r#type(RrType::from(record_type))
            .ttl(MASTER_RECORD_TTL)
            .resource_records(ResourceRecord::builder().value(value).build().context("error building resource record")?)
            .build()
            .context("error building record set")?;
        let change = Change::builder()
            .action(ChangeAction::Upsert)
            .resource_record_set(record_set)
            .build()
            .context("error building record change")?;
        let batch = ChangeBatch::builder().changes(change).build().context("error building change batch")?;
        self.client
            .change_resource_record_sets()
            .hosted_zone_id(&zone_id)
            .change_batch(batch)
            .send()
            .await
            .with_context(|| format!("error upserting {} record {} in zone {}", record_type, name, zone))?;
        tracing::info!(%zone, %name, %value, "upserted DNS record");
        Ok(())
    }
}

//! AWS backed implementations of the cloud abstractions.

pub mod cloudformation;
pub mod ec2;
pub mod kms;
pub mod route53;
pub mod s3;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use aws_config::sts::AssumeRoleProvider;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use bootstrap_salt_core::models::{Filters, Instance, StackId, StackIdentifier};
use bootstrap_salt_core::tags::Tags;

use crate::config::{Context, Settings, CROSS_ACCOUNT_PROFILE, ENV_AWS_ROLE_ARN_ID};
use crate::provider::CloudProvider;

/// The STS session name used when assuming the cross-account role.
const ASSUME_ROLE_SESSION: &str = "AssumeRoleSession1";

/// The SDK clients of every AWS service used.
#[derive(Clone)]
pub struct AwsClients {
    pub cloudformation: aws_sdk_cloudformation::Client,
    pub ec2: aws_sdk_ec2::Client,
    pub kms: aws_sdk_kms::Client,
    pub route53: aws_sdk_route53::Client,
    pub s3: aws_sdk_s3::Client,
}

impl AwsClients {
    /// Build clients for the selected profile and region.
    ///
    /// The `cross-account` profile assumes the role named by `AWS_ROLE_ARN_ID` on top of the
    /// profile's own credentials.
    #[tracing::instrument(level = "debug", skip(ctx, settings))]
    pub async fn connect(ctx: &Context, settings: &Settings) -> Result<Self> {
        let profile = ctx.aws_profile()?;
        let region = Region::new(ctx.aws_region(settings).to_string());
        let base = aws_config::defaults(BehaviorVersion::latest())
            .profile_name(profile)
            .region(region.clone())
            .load()
            .await;
        let config = if profile == CROSS_ACCOUNT_PROFILE {
            let role_arn =
                std::env::var(ENV_AWS_ROLE_ARN_ID).with_context(|| format!("{} must be set to use the {} profile", ENV_AWS_ROLE_ARN_ID, CROSS_ACCOUNT_PROFILE))?;
            tracing::debug!(%role_arn, "assuming cross-account role");
            let provider = AssumeRoleProvider::builder(role_arn).session_name(ASSUME_ROLE_SESSION).configure(&base).build().await;
            aws_config::defaults(BehaviorVersion::latest())
                .region(region)
                .credentials_provider(provider)
                .load()
                .await
        } else {
            base
        };
        Ok(Self::from_config(&config))
    }

    fn from_config(config: &SdkConfig) -> Self {
        Self {
            cloudformation: aws_sdk_cloudformation::Client::new(config),
            ec2: aws_sdk_ec2::Client::new(config),
            kms: aws_sdk_kms::Client::new(config),
            route53: aws_sdk_route53::Client::new(config),
            s3: aws_sdk_s3::Client::new(config),
        }
    }
}

/// The stack and instance view of AWS: CloudFormation for stacks, EC2 for instances and tags.
pub struct AwsCloud {
    cloudformation: aws_sdk_cloudformation::Client,
    ec2: aws_sdk_ec2::Client,
}

impl AwsCloud {
    pub fn new(clients: &AwsClients) -> Self {
        Self {
            cloudformation: clients.cloudformation.clone(),
            ec2: clients.ec2.clone(),
        }
    }
}

#[async_trait]
impl CloudProvider for AwsCloud {
    async fn resolve_stack(&self, stack: &StackIdentifier) -> Result<Option<StackId>> {
        cloudformation::resolve_stack(&self.cloudformation, stack).await
    }

    async fn describe_instances(&self, filters: &Filters) -> Result<Vec<Instance>> {
        ec2::describe_instances(&self.ec2, filters).await
    }

    async fn set_tags(&self, instance_ids: &[String], tags: &Tags) -> Result<()> {
        ec2::create_tags(&self.ec2, instance_ids, tags).await
    }

    async fn get_tags(&self, instance_id: &str) -> Result<Tags> {
        ec2::describe_tags(&self.ec2, instance_id).await
    }
}

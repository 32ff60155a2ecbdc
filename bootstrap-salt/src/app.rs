use std::sync::Arc;

use anyhow::Result;
use bootstrap_salt_core::models::{Instance, StackIdentifier};
use bootstrap_salt_core::DeployError;

use crate::actions::address_of;
use crate::aws::route53::Route53Dns;
use crate::aws::{AwsClients, AwsCloud};
use crate::config::{Context, Settings};
use crate::discovery;
use crate::election;
use crate::remote::{Remote, SshRemote};
use crate::salt::{ControlPlane, SshMaster};

/// The application object shared by every task of a single invocation.
pub struct App {
    /// The operator's selections.
    pub ctx: Context,
    /// The runtime tunables.
    pub settings: Settings,
    /// The SDK clients of the selected account.
    pub aws: AwsClients,
    /// The stack and instance view of the selected account.
    pub cloud: Arc<AwsCloud>,
    /// Command execution on stack hosts.
    pub remote: Arc<dyn Remote>,
}

impl App {
    /// Create a new instance.
    pub async fn new(ctx: Context, settings: Settings) -> Result<Self> {
        let aws = AwsClients::connect(&ctx, &settings).await?;
        let cloud = Arc::new(AwsCloud::new(&aws));
        let remote: Arc<dyn Remote> = Arc::new(SshRemote::new(&settings));
        Ok(Self {
            ctx,
            settings,
            aws,
            cloud,
            remote,
        })
    }

    /// The stack selected for this invocation.
    pub fn stack(&self) -> Result<StackIdentifier> {
        Ok(self.ctx.stack()?)
    }

    /// The running instances of the selected stack.
    ///
    /// Fails when there are none, since every caller goes on to talk to them.
    pub async fn running_instances(&self) -> Result<Vec<Instance>> {
        let stack = self.stack()?;
        let instances = discovery::get_stack_instances(self.cloud.as_ref(), &stack, true).await?;
        if instances.is_empty() {
            tracing::error!(%stack, "stack has no running instances");
            return Err(DeployError::InvalidInput(format!("stack {} has no running instances", stack)).into());
        }
        Ok(instances)
    }

    /// The master of the selected stack.
    pub async fn master(&self) -> Result<Instance> {
        election::get_master(self.cloud.as_ref(), &self.stack()?).await
    }

    /// DNS updates in the selected account.
    pub fn dns(&self) -> Route53Dns {
        Route53Dns::new(self.aws.route53.clone())
    }

    /// The Salt control plane of the given master.
    pub fn control_plane(&self, master: &Instance) -> Result<Arc<dyn ControlPlane>> {
        let address = address_of(master)?;
        Ok(Arc::new(SshMaster::new(self.remote.clone(), address)))
    }
}

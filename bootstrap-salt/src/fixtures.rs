//! In-memory collaborators used for testing.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use bootstrap_salt_core::models::{Filters, Instance, StackId, StackIdentifier};
use bootstrap_salt_core::tags::{TagKey, Tags};
use bootstrap_salt_core::{DeployError, FILTER_INSTANCE_STATE_NAME, INSTANCE_STATE_RUNNING};
use serde_json::Value;

use crate::provider::{CloudProvider, DnsService};
use crate::remote::{CommandOutput, ConnectionLost, Remote};
use crate::salt::{ControlPlane, SaltFunction};

/// Build an instance with the given private IP and tags.
pub fn instance(id: &str, private_ip: &str, public_ip: Option<&str>, tags: Tags) -> Instance {
    Instance {
        id: id.into(),
        private_ip: private_ip.parse().ok(),
        public_ip: public_ip.and_then(|ip| ip.parse().ok()),
        tags,
    }
}

/// Parse the given IP, panicking on malformed input.
pub fn ip(val: &str) -> IpAddr {
    val.parse().expect("malformed IP in test fixture")
}

/// A cloud holding a fixed set of stacks and their instances.
#[derive(Default)]
pub struct FakeCloud {
    /// Stack names mapped to the IDs of all stacks going by that name.
    stacks: BTreeMap<String, Vec<StackId>>,
    inner: Mutex<FakeCloudState>,
}

#[derive(Default)]
struct FakeCloudState {
    instances: Vec<Instance>,
    states: BTreeMap<String, String>,
    tag_calls: Vec<(Vec<String>, Tags)>,
    /// An instance which another writer starts and tags as master whenever a master is tagged.
    interloper: Option<String>,
    /// The number of listings after a tag write which still show the instances from before it.
    stale_reads: usize,
    stale_view: Option<Vec<Instance>>,
}

impl FakeCloud {
    /// A cloud with one stack of the given name holding the given instances.
    pub fn with_stack(name: &str, instances: Vec<Instance>) -> Self {
        let stack_id = StackId::new(format!("arn:aws:cloudformation:eu-west-1:123456789012:stack/{}/1", name));
        let instances = instances
            .into_iter()
            .map(|mut inst| {
                inst.tags.insert(TagKey::StackId, stack_id.as_str());
                inst.tags.insert(TagKey::StackName, name);
                inst
            })
            .collect();
        let mut stacks = BTreeMap::new();
        stacks.insert(name.to_string(), vec![stack_id]);
        Self {
            stacks,
            inner: Mutex::new(FakeCloudState {
                instances,
                ..Default::default()
            }),
        }
    }

    /// Register a second stack going by an existing name.
    pub fn add_duplicate_stack(&mut self, name: &str) {
        let ids = self.stacks.entry(name.to_string()).or_default();
        ids.push(StackId::new(format!("arn:aws:cloudformation:eu-west-1:123456789012:stack/{}/{}", name, ids.len() + 1)));
    }

    /// Mark the given instance as being in the given state.
    pub fn set_state(&self, instance_id: &str, state: &str) {
        self.inner.lock().unwrap().states.insert(instance_id.into(), state.into());
    }

    /// Have the given instance start running and be tagged as master whenever a master is tagged.
    pub fn set_interloper(&self, instance_id: &str) {
        self.inner.lock().unwrap().interloper = Some(instance_id.into());
    }

    /// Have the given number of listings following the next tag write miss that write.
    pub fn set_stale_reads(&self, count: usize) {
        self.inner.lock().unwrap().stale_reads = count;
    }

    /// All `set_tags` calls made so far.
    pub fn tag_calls(&self) -> Vec<(Vec<String>, Tags)> {
        self.inner.lock().unwrap().tag_calls.clone()
    }

    /// The current state of the given instance.
    pub fn instance(&self, instance_id: &str) -> Option<Instance> {
        self.inner.lock().unwrap().instances.iter().find(|inst| inst.id == instance_id).cloned()
    }

    fn matches(state: &FakeCloudState, inst: &Instance, filters: &Filters) -> bool {
        filters.iter().all(|(name, val)| match name.as_str() {
            FILTER_INSTANCE_STATE_NAME => state.states.get(&inst.id).map(String::as_str).unwrap_or(INSTANCE_STATE_RUNNING) == val,
            "instance-id" => &inst.id == val,
            _ => match name.strip_prefix("tag:") {
                Some(key) => inst.tags.get(&TagKey::from(key)) == Some(val.as_str()),
                None => false,
            },
        })
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn resolve_stack(&self, stack: &StackIdentifier) -> Result<Option<StackId>> {
        if let Some(id) = self.stacks.values().flatten().find(|id| id.as_str() == stack.as_str()) {
            return Ok(Some(id.clone()));
        }
        match self.stacks.get(stack.as_str()).map(Vec::as_slice) {
            None | Some([]) => Ok(None),
            Some([id]) => Ok(Some(id.clone())),
            Some(ids) => Err(DeployError::AmbiguousStack {
                name: stack.to_string(),
                count: ids.len(),
            }
            .into()),
        }
    }

    async fn describe_instances(&self, filters: &Filters) -> Result<Vec<Instance>> {
        let mut state = self.inner.lock().unwrap();
        let view = match state.stale_view.take() {
            Some(view) if state.stale_reads > 1 => {
                state.stale_reads -= 1;
                state.stale_view = Some(view.clone());
                view
            }
            Some(view) => {
                state.stale_reads = 0;
                view
            }
            None => state.instances.clone(),
        };
        Ok(view.iter().filter(|inst| Self::matches(&state, inst, filters)).cloned().collect())
    }

    async fn set_tags(&self, instance_ids: &[String], tags: &Tags) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.tag_calls.push((instance_ids.to_vec(), tags.clone()));
        if state.stale_reads > 0 {
            state.stale_view = Some(state.instances.clone());
        }
        let mut targets: BTreeSet<String> = instance_ids.iter().cloned().collect();
        if tags.is_master() {
            if let Some(interloper) = state.interloper.clone() {
                state.states.insert(interloper.clone(), INSTANCE_STATE_RUNNING.into());
                targets.insert(interloper);
            }
        }
        for inst in state.instances.iter_mut().filter(|inst| targets.contains(&inst.id)) {
            inst.tags.extend(tags.clone());
        }
        Ok(())
    }

    async fn get_tags(&self, instance_id: &str) -> Result<Tags> {
        match self.instance(instance_id) {
            Some(inst) => Ok(inst.tags),
            None => bail!("instance {} does not exist", instance_id),
        }
    }
}

/// A DNS service recording every upsert.
#[derive(Default)]
pub struct FakeDns {
    pub fail: bool,
    records: Mutex<Vec<(String, String, String, String)>>,
}

impl FakeDns {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// All `(zone, name, type, value)` upserts made so far.
    pub fn records(&self) -> Vec<(String, String, String, String)> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl DnsService for FakeDns {
    async fn upsert_record(&self, zone: &str, name: &str, record_type: &str, value: &str) -> Result<()> {
        if self.fail {
            bail!("zone {} is not hosted here", zone);
        }
        self.records.lock().unwrap().push((zone.into(), name.into(), record_type.into(), value.into()));
        Ok(())
    }
}

type RunHandler = Box<dyn FnMut(IpAddr, &str, bool) -> Result<CommandOutput> + Send>;

/// A remote which records commands and answers them through a swappable handler.
pub struct FakeRemote {
    handler: Mutex<RunHandler>,
    commands: Mutex<Vec<(IpAddr, String, bool)>>,
    unreachable: Mutex<BTreeSet<IpAddr>>,
}

impl FakeRemote {
    /// A remote answering every command with empty, successful output.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(Box::new(|_, _, _| Ok(CommandOutput::ok("")))),
            commands: Mutex::new(vec![]),
            unreachable: Mutex::new(BTreeSet::new()),
        })
    }

    /// Set the handler answering commands.
    pub fn set_handler(&self, handler: impl FnMut(IpAddr, &str, bool) -> Result<CommandOutput> + Send + 'static) {
        *self.handler.lock().unwrap() = Box::new(handler);
    }

    /// Mark the given host as reachable or not. Commands against unreachable hosts lose their connection.
    pub fn set_reachable(&self, host: IpAddr, reachable: bool) {
        let mut unreachable = self.unreachable.lock().unwrap();
        if reachable {
            unreachable.remove(&host);
        } else {
            unreachable.insert(host);
        }
    }

    /// All `(host, command, sudo)` runs made so far.
    pub fn commands(&self) -> Vec<(IpAddr, String, bool)> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Remote for FakeRemote {
    async fn run(&self, host: IpAddr, command: &str, sudo: bool) -> Result<CommandOutput> {
        self.commands.lock().unwrap().push((host, command.into(), sudo));
        if self.unreachable.lock().unwrap().contains(&host) {
            return Err(ConnectionLost { host }.into());
        }
        let mut handler = self.handler.lock().unwrap();
        (*handler)(host, command, sudo)
    }

    async fn is_reachable(&self, host: IpAddr) -> bool {
        !self.unreachable.lock().unwrap().contains(&host)
    }
}

/// A control plane handing out sequential job IDs and queued lookup results.
#[derive(Default)]
pub struct FakeControlPlane {
    next_jid: AtomicU64,
    dispatched: Mutex<Vec<(String, SaltFunction)>>,
    results: Mutex<VecDeque<Value>>,
    lookups: AtomicU64,
}

impl FakeControlPlane {
    /// A control plane answering lookups with the given results in order.
    ///
    /// The final result is repeated once the queue is drained.
    pub fn with_results(results: Vec<Value>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            ..Default::default()
        }
    }

    /// All `(target, function)` dispatches made so far.
    pub fn dispatched(&self) -> Vec<(String, SaltFunction)> {
        self.dispatched.lock().unwrap().clone()
    }

    /// The number of lookups made so far.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn dispatch_async(&self, target: &str, function: &SaltFunction) -> Result<String> {
        self.dispatched.lock().unwrap().push((target.into(), function.clone()));
        Ok(format!("2024010112000{:07}", self.next_jid.fetch_add(1, Ordering::SeqCst)))
    }

    async fn lookup_job_result(&self, _jid: &str) -> Result<Value> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let mut results = self.results.lock().unwrap();
        let result = if results.len() > 1 { results.pop_front() } else { results.front().cloned() };
        Ok(result.unwrap_or_else(|| Value::Object(Default::default())))
    }
}

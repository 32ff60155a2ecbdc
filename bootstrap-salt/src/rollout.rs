//! The batched rollout driver.
//!
//! Batches are driven strictly one after the other. That is what bounds the number of hosts which
//! are mid-change at any time, so it must not be parallelized.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bootstrap_salt_core::models::Instance;
use bootstrap_salt_core::poll::{wait_for, PollSchedule};
use bootstrap_salt_core::state::JobReport;
use serde_json::Value;

/// A job dispatched against a single batch.
#[derive(Clone, Debug, Default)]
pub struct DispatchedJob {
    /// The job's ID, as given by whatever ran it.
    pub id: String,
    /// The IDs of the instances targeted by the job.
    pub targets: Vec<String>,
    /// The addresses the targets were reached at, for actions which talk to each host.
    pub hosts: BTreeMap<String, IpAddr>,
    /// Results already known at dispatch time, keyed by minion.
    pub collected: serde_json::Map<String, Value>,
}

/// An action which is rolled out across a fleet one batch at a time.
#[async_trait]
pub trait RolloutAction: Send + Sync {
    /// A human readable name of the action.
    fn name(&self) -> String;

    /// Start the action against the given batch without waiting for it to finish.
    async fn dispatch(&self, batch: &[Instance]) -> Result<DispatchedJob>;

    /// Check on the given job.
    ///
    /// Returns `Ok(None)` while the job is still running, and the job's result map once every
    /// target has reported. Transient failures should be mapped to `Ok(None)`.
    async fn poll(&self, job: &DispatchedJob) -> Result<Option<Value>>;
}

/// The in-flight state of one batch of a rollout.
#[derive(Clone, Debug)]
pub struct RolloutJob {
    /// The 1-based position of this batch.
    pub batch: usize,
    /// The total number of batches of the rollout.
    pub batches: usize,
    /// The IDs of the instances of this batch.
    pub targets: Vec<String>,
    pub action: String,
    pub started: Instant,
    pub schedule: PollSchedule,
}

impl RolloutJob {
    fn new(batch: usize, batches: usize, targets: &[Instance], action: String, schedule: PollSchedule) -> Self {
        Self {
            batch,
            batches,
            targets: targets.iter().map(|inst| inst.id.clone()).collect(),
            action,
            started: Instant::now(),
            schedule,
        }
    }

    fn describe(&self) -> String {
        format!("{} on batch {}/{}", self.action, self.batch, self.batches)
    }
}

/// The outcome of a completed batch.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchOutcome {
    /// The 1-based position of the batch.
    pub batch: usize,
    /// The minions which reported success.
    pub succeeded: Vec<String>,
    pub elapsed: Duration,
}

/// The outcome of a completed rollout.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RolloutReport {
    pub batches: Vec<BatchOutcome>,
}

impl RolloutReport {
    /// Every minion which succeeded, in rollout order.
    pub fn succeeded(&self) -> impl Iterator<Item = &str> {
        self.batches.iter().flat_map(|batch| batch.succeeded.iter().map(String::as_str))
    }
}

/// Drive `action` across the given batches, one batch at a time.
///
/// Each batch is dispatched and then polled on `schedule` until it completes. A batch which does
/// not complete in time fails with `DeployError::Timeout`. A batch in which any minion reports a
/// failed state, or returns something which cannot be parsed, fails with that minion's error. In
/// every failure case the remaining batches are not started.
#[tracing::instrument(level = "debug", skip(batches, action))]
pub async fn run_rollout(batches: Vec<Vec<Instance>>, action: &dyn RolloutAction, schedule: PollSchedule) -> Result<RolloutReport> {
    let count = batches.len();
    let mut report = RolloutReport::default();
    for (index, batch) in batches.into_iter().enumerate() {
        let job = RolloutJob::new(index + 1, count, &batch, action.name(), schedule);
        tracing::info!(batch = job.batch, batches = job.batches, action = %job.action, targets = ?job.targets, "starting batch");

        let dispatched = action.dispatch(&batch).await.with_context(|| format!("error dispatching {}", job.describe()))?;
        let result = wait_for(&job.describe(), job.schedule, || action.poll(&dispatched)).await?;

        let outcomes = JobReport::from_job_result(&result).map_err(|err| {
            tracing::error!(error = %err, batch = job.batch, "unexpected job result");
            err
        })?;
        for (minion, outcome) in outcomes.outcomes.iter() {
            match outcome {
                Ok(()) => tracing::info!(%minion, batch = job.batch, "minion succeeded"),
                Err(err) => tracing::error!(%minion, batch = job.batch, error = %err, "minion failed"),
            }
        }
        let succeeded = outcomes
            .into_result()
            .with_context(|| format!("{} failed, aborting rollout before the remaining batches", job.describe()))?;

        let elapsed = job.started.elapsed();
        tracing::info!(batch = job.batch, batches = job.batches, elapsed = ?elapsed, "batch complete");
        report.batches.push(BatchOutcome {
            batch: job.batch,
            succeeded,
            elapsed,
        });
    }
    Ok(report)
}

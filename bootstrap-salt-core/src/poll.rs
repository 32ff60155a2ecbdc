//! Bounded fixed-interval polling.
//!
//! This is the one retry primitive of the system. It is used for SSH reachability, bootstrap
//! completion markers, stack status and Salt job results alike. There is no backoff and no jitter.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;

use crate::error::DeployError;

/// The timing parameters of a poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSchedule {
    /// The overall time budget of the poll.
    pub timeout: Duration,
    /// The fixed delay between attempts.
    pub interval: Duration,
}

impl PollSchedule {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Build a schedule from whole seconds, as taken on the command line.
    pub fn from_secs(timeout: u64, interval: u64) -> Self {
        Self::new(Duration::from_secs(timeout), Duration::from_secs(interval))
    }

    /// The number of times the predicate may be invoked, which is `timeout / interval`.
    ///
    /// At least one attempt is always made.
    pub fn max_attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let attempts = self.timeout.as_nanos() / self.interval.as_nanos();
        attempts.clamp(1, u32::MAX as u128) as u32
    }
}

/// Parse a poll interval in whole seconds as given on the command line. Zero is rejected.
pub fn parse_interval(val: &str) -> Result<u64, DeployError> {
    match val.trim().parse::<u64>() {
        Ok(0) => Err(DeployError::InvalidInput("poll interval must be at least one second".into())),
        Ok(secs) => Ok(secs),
        Err(_) => Err(DeployError::InvalidInput(format!("poll interval must be a whole number of seconds, got {}", val))),
    }
}

/// Invoke `predicate` until it yields a value or the schedule's attempts are exhausted.
///
/// `Ok(None)` from the predicate means "not yet" and is retried after `interval`. An error is
/// returned immediately: predicates decide for themselves which failures are transient and map
/// those to `Ok(None)`. Exhausting every attempt yields `DeployError::Timeout`.
pub async fn wait_for<T, F, Fut>(what: &str, schedule: PollSchedule, mut predicate: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let max_attempts = schedule.max_attempts();
    for attempt in 1..=max_attempts {
        if let Some(val) = predicate().await? {
            tracing::debug!(what, attempt, "condition met");
            return Ok(val);
        }
        if attempt < max_attempts {
            tracing::debug!(what, attempt, max_attempts, "condition not yet met, retrying in {}s", schedule.interval.as_secs());
            tokio::time::sleep(schedule.interval).await;
        }
    }
    tracing::error!(what, attempts = max_attempts, "timed out waiting for condition");
    Err(DeployError::Timeout {
        what: what.to_string(),
        attempts: max_attempts,
    }
    .into())
}

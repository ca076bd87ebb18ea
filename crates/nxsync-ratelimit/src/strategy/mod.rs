//! Admission ordering between workers sharing one bucket.

mod none;
mod round_robin;
mod wait_priority;

pub use none::NoStrategy;
pub use round_robin::RoundRobinStrategy;
pub use wait_priority::{WaitPriorityStrategy, MAX_REFUSALS};

use crate::{LimiterError, WorkerId};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Waits at or above this are reported as warnings.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(20);

/// Decides which registered worker may draw tokens next.
///
/// `begin` is idempotent and `end` ignores unknown workers. All methods that
/// observe time take the caller's `now` so decisions can be replayed.
pub trait FairnessStrategy: Send + fmt::Debug {
    fn kind(&self) -> StrategyKind;

    fn begin(&mut self, worker: WorkerId, now: Instant);

    fn end(&mut self, worker: WorkerId);

    fn is_next(&mut self, worker: WorkerId, now: Instant) -> bool;

    /// Records the outcome of one admission attempt.
    fn update(&mut self, worker: WorkerId, ready: bool, now: Instant);

    /// Restarts the worker's wait clock and forgets its wait history.
    fn reset(&mut self, worker: WorkerId, now: Instant);

    fn count(&self, worker: WorkerId) -> u32;

    fn last_access_time(&self, worker: WorkerId) -> Option<Instant>;

    /// Longest wait observed between two grants.
    fn wait_time(&self, worker: WorkerId) -> Option<Duration>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    None,
    RoundRobin,
    WaitPriority,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::None => "none",
            StrategyKind::RoundRobin => "round_robin",
            StrategyKind::WaitPriority => "wait_priority",
        }
    }

    pub fn build(self, bucket: &str, read_timeout: Duration) -> Box<dyn FairnessStrategy> {
        match self {
            StrategyKind::None => Box::new(NoStrategy::new(bucket, read_timeout)),
            StrategyKind::RoundRobin => Box::new(RoundRobinStrategy::new(bucket, read_timeout)),
            StrategyKind::WaitPriority => Box::new(WaitPriorityStrategy::new(bucket, read_timeout)),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "none" | "no_strategy" => Ok(StrategyKind::None),
            "round_robin" | "roundrobin" => Ok(StrategyKind::RoundRobin),
            "wait_priority" | "waitpriority" => Ok(StrategyKind::WaitPriority),
            other => Err(LimiterError::UnknownStrategy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub last_access: Instant,
    pub count: u32,
    pub max_wait: Duration,
}

impl Slot {
    fn new(now: Instant) -> Self {
        Self {
            last_access: now,
            count: 0,
            max_wait: Duration::ZERO,
        }
    }

    /// Closes the current wait interval and returns its length.
    pub fn grant(&mut self, now: Instant) -> Duration {
        let waited = now.saturating_duration_since(self.last_access);
        self.max_wait = self.max_wait.max(waited);
        self.last_access = now;
        self.count = 0;
        waited
    }
}

/// Registered workers in join order.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: Vec<(WorkerId, Slot)>,
}

impl Registry {
    /// Returns true when the worker was not known before.
    pub fn insert(&mut self, worker: WorkerId, now: Instant) -> bool {
        if self.position(worker).is_some() {
            return false;
        }
        self.entries.push((worker, Slot::new(now)));
        true
    }

    pub fn remove(&mut self, worker: WorkerId) -> bool {
        match self.position(worker) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn position(&self, worker: WorkerId) -> Option<usize> {
        self.entries.iter().position(|(id, _)| *id == worker)
    }

    pub fn get(&self, worker: WorkerId) -> Option<&Slot> {
        self.entries
            .iter()
            .find(|(id, _)| *id == worker)
            .map(|(_, slot)| slot)
    }

    pub fn get_mut(&mut self, worker: WorkerId) -> Option<&mut Slot> {
        self.entries
            .iter_mut()
            .find(|(id, _)| *id == worker)
            .map(|(_, slot)| slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(WorkerId, Slot)> {
        self.entries.iter()
    }

    #[cfg(test)]
    pub fn ids(&self) -> Vec<WorkerId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn reset(&mut self, worker: WorkerId, now: Instant) {
        if let Some(slot) = self.get_mut(worker) {
            *slot = Slot::new(now);
        }
    }

    /// Counts the attempt; on `ready` closes the wait interval.
    pub fn record(
        &mut self,
        bucket: &str,
        worker: WorkerId,
        ready: bool,
        now: Instant,
        limit: Duration,
    ) {
        let Some(slot) = self.get_mut(worker) else {
            return;
        };
        slot.count = slot.count.saturating_add(1);
        if ready {
            let waited = slot.grant(now);
            tracing::trace!(
                target: "nxsync.transfer",
                bucket,
                %worker,
                max_wait_secs = slot.max_wait.as_secs_f64(),
                "granted"
            );
            warn_long_wait(bucket, worker, waited, limit);
        }
    }
}

pub(crate) fn warn_long_wait(bucket: &str, worker: WorkerId, waited: Duration, limit: Duration) {
    if waited >= limit {
        tracing::warn!(
            target: "nxsync.transfer",
            bucket,
            %worker,
            waited_secs = waited.as_secs_f64(),
            limit_secs = limit.as_secs(),
            "worker waited longer than the read timeout for tokens"
        );
    }
}

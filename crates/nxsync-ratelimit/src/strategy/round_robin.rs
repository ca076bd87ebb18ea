use super::{FairnessStrategy, Registry, StrategyKind};
use crate::WorkerId;
use std::time::{Duration, Instant};

/// Cycles through registered workers in join order.
///
/// The cursor advances on every `is_next` call whatever the answer, and
/// returns to the head whenever a worker joins or leaves.
#[derive(Debug)]
pub struct RoundRobinStrategy {
    bucket: String,
    read_timeout: Duration,
    workers: Registry,
    cursor: usize,
}

impl RoundRobinStrategy {
    pub fn new(bucket: &str, read_timeout: Duration) -> Self {
        Self {
            bucket: bucket.to_string(),
            read_timeout,
            workers: Registry::default(),
            cursor: 0,
        }
    }

    /// Worker the next `is_next` call will grant.
    pub fn current(&self) -> Option<WorkerId> {
        self.workers.iter().nth(self.cursor).map(|(id, _)| *id)
    }
}

impl FairnessStrategy for RoundRobinStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RoundRobin
    }

    fn begin(&mut self, worker: WorkerId, now: Instant) {
        if self.workers.insert(worker, now) {
            self.cursor = 0;
            tracing::trace!(target: "nxsync.transfer", bucket = %self.bucket, %worker, registered = self.workers.len(), "+1");
        }
    }

    fn end(&mut self, worker: WorkerId) {
        if self.workers.remove(worker) {
            self.cursor = 0;
            tracing::trace!(target: "nxsync.transfer", bucket = %self.bucket, %worker, registered = self.workers.len(), "-1");
        }
    }

    fn is_next(&mut self, worker: WorkerId, _now: Instant) -> bool {
        let Some(current) = self.current() else {
            return true;
        };
        self.cursor = (self.cursor + 1) % self.workers.len();
        let granted = current == worker;
        tracing::trace!(
            target: "nxsync.transfer",
            bucket = %self.bucket,
            %worker,
            %current,
            granted,
            "round robin turn"
        );
        granted
    }

    fn update(&mut self, worker: WorkerId, ready: bool, now: Instant) {
        self.workers
            .record(&self.bucket, worker, ready, now, self.read_timeout);
    }

    fn reset(&mut self, worker: WorkerId, now: Instant) {
        self.workers.reset(worker, now);
    }

    fn count(&self, worker: WorkerId) -> u32 {
        self.workers.get(worker).map(|s| s.count).unwrap_or(0)
    }

    fn last_access_time(&self, worker: WorkerId) -> Option<Instant> {
        self.workers.get(worker).map(|s| s.last_access)
    }

    fn wait_time(&self, worker: WorkerId) -> Option<Duration> {
        self.workers.get(worker).map(|s| s.max_wait)
    }

    fn len(&self) -> usize {
        self.workers.len()
    }
}

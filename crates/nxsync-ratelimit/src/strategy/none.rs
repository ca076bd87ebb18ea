use super::{FairnessStrategy, Registry, StrategyKind};
use crate::WorkerId;
use std::time::{Duration, Instant};

/// Grants every worker; only keeps per-worker wait diagnostics.
#[derive(Debug)]
pub struct NoStrategy {
    bucket: String,
    read_timeout: Duration,
    workers: Registry,
}

impl NoStrategy {
    pub fn new(bucket: &str, read_timeout: Duration) -> Self {
        Self {
            bucket: bucket.to_string(),
            read_timeout,
            workers: Registry::default(),
        }
    }
}

impl FairnessStrategy for NoStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::None
    }

    fn begin(&mut self, worker: WorkerId, now: Instant) {
        if self.workers.insert(worker, now) {
            tracing::trace!(target: "nxsync.transfer", bucket = %self.bucket, %worker, registered = self.workers.len(), "+1");
        }
    }

    fn end(&mut self, worker: WorkerId) {
        if self.workers.remove(worker) {
            tracing::trace!(target: "nxsync.transfer", bucket = %self.bucket, %worker, registered = self.workers.len(), "-1");
        }
    }

    fn is_next(&mut self, _worker: WorkerId, _now: Instant) -> bool {
        true
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

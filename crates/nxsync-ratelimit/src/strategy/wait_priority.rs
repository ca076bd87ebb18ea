use super::{warn_long_wait, FairnessStrategy, Registry, StrategyKind};
use crate::WorkerId;
use std::time::{Duration, Instant};

/// Refusals after which the longest-waiting worker loses its priority.
pub const MAX_REFUSALS: u32 = 50;

/// Grants the worker that has gone longest without a grant.
///
/// Ties go to the earlier registrant. A worker refused more than
/// [`MAX_REFUSALS`] times in a row restarts the incumbent's clock, which hands
/// the priority to the next-longest waiter.
#[derive(Debug)]
pub struct WaitPriorityStrategy {
    bucket: String,
    read_timeout: Duration,
    workers: Registry,
}

impl WaitPriorityStrategy {
    pub fn new(bucket: &str, read_timeout: Duration) -> Self {
        Self {
            bucket: bucket.to_string(),
            read_timeout,
            workers: Registry::default(),
        }
    }

    /// Longest-waiting registered worker at `now`.
    pub fn longest_waiting(&self, now: Instant) -> Option<WorkerId> {
        let mut best: Option<(WorkerId, Duration)> = None;
        for (id, slot) in self.workers.iter() {
            let waited = now.saturating_duration_since(slot.last_access);
            match best {
                Some((_, longest)) if waited <= longest => {}
                _ => best = Some((*id, waited)),
            }
        }
        best.map(|(id, _)| id)
    }
}

impl FairnessStrategy for WaitPriorityStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::WaitPriority
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

    fn is_next(&mut self, worker: WorkerId, now: Instant) -> bool {
        if self.workers.get(worker).is_none() {
            return false;
        }
        if self.workers.len() == 1 {
            return true;
        }
        let Some(next) = self.longest_waiting(now) else {
            return false;
        };
        if next == worker {
            return true;
        }
        let Some(slot) = self.workers.get_mut(worker) else {
            return false;
        };
        slot.count = slot.count.saturating_add(1);
        let refusals = slot.count;
        if refusals > MAX_REFUSALS {
            // one promotion per streak of refusals
            slot.count = 0;
            if let Some(incumbent) = self.workers.get_mut(next) {
                incumbent.last_access = now;
            }
            tracing::trace!(
                target: "nxsync.transfer",
                bucket = %self.bucket,
                %worker,
                incumbent = %next,
                refusals,
                "refused too often, restarting incumbent clock"
            );
        }
        false
    }

    fn update(&mut self, worker: WorkerId, ready: bool, now: Instant) {
        if !ready {
            return;
        }
        if let Some(slot) = self.workers.get_mut(worker) {
            let waited = slot.grant(now);
            warn_long_wait(&self.bucket, worker, waited, self.read_timeout);
        }
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

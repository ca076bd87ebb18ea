use crate::{TokenBucket, WorkerId};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Slot holding the live bucket for one direction.
///
/// Replacing the bucket swaps the whole instance; callers that resolve the
/// slot afterwards see only the new one.
#[derive(Debug)]
pub struct SharedBucket {
    current: RwLock<Arc<TokenBucket>>,
}

impl SharedBucket {
    pub fn new(bucket: TokenBucket) -> Self {
        Self {
            current: RwLock::new(Arc::new(bucket)),
        }
    }

    pub fn unlimited(name: &str) -> Self {
        Self::new(TokenBucket::unlimited(name))
    }

    pub fn current(&self) -> Arc<TokenBucket> {
        self.current.read().clone()
    }

    /// Installs `bucket` and returns the one it replaced.
    pub fn replace(&self, bucket: TokenBucket) -> Arc<TokenBucket> {
        let next = Arc::new(bucket);
        let previous = std::mem::replace(&mut *self.current.write(), next);
        tracing::debug!(target: "nxsync.transfer", bucket = %previous.name(), "token bucket replaced");
        previous
    }

    /// Waits until `tokens` have been granted to `worker`; returns the time spent waiting.
    pub async fn acquire(&self, worker: WorkerId, tokens: u64) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            let wait = self.current().consume(worker, tokens);
            if wait.is_zero() {
                return waited;
            }
            waited += wait;
            tokio::time::sleep(wait).await;
        }
    }

    /// Thread-blocking twin of [`acquire`](Self::acquire).
    pub fn acquire_blocking(&self, worker: WorkerId, tokens: u64) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            let wait = self.current().consume(worker, tokens);
            if wait.is_zero() {
                return waited;
            }
            waited += wait;
            std::thread::sleep(wait);
        }
    }

    pub fn clear(&self, worker: WorkerId) {
        self.current().clear(worker);
    }

    pub fn reset(&self, worker: WorkerId) {
        self.current().reset(worker);
    }

    pub fn update_rate(&self, average_rate: f64) {
        self.current().update_rate(average_rate);
    }
}

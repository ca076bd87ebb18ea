use crate::TransferError;
use async_trait::async_trait;
use nxsync_ratelimit::WorkerId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative pause point polled between chunks.
///
/// Returning an error halts the transfer at the next chunk boundary; an
/// implementation may also wait inside `checkpoint` until it is resumed.
#[async_trait]
pub trait Suspension: Send + Sync {
    async fn checkpoint(&self, label: &str) -> Result<(), TransferError>;
}

/// Receives byte deltas for the action a worker is running.
pub trait ProgressReporter: Send + Sync {
    fn begin(&self, _worker: WorkerId, _action: &str, _label: &str, _total: Option<u64>) {}

    fn advance(&self, _worker: WorkerId, _bytes: u64) {}

    fn finish(&self, _worker: WorkerId) {}
}

#[derive(Debug, Default)]
pub struct NeverSuspend;

#[async_trait]
impl Suspension for NeverSuspend {
    async fn checkpoint(&self, _label: &str) -> Result<(), TransferError> {
        Ok(())
    }
}

/// Suspension flipped from another task.
#[derive(Debug, Default)]
pub struct SuspendFlag {
    suspended: AtomicBool,
}

impl SuspendFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Suspension for SuspendFlag {
    async fn checkpoint(&self, label: &str) -> Result<(), TransferError> {
        if self.is_suspended() {
            return Err(TransferError::Suspended(label.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {}

/// Everything a transfer needs to know about the worker running it.
#[derive(Clone)]
pub struct WorkerContext {
    pub id: WorkerId,
    pub suspension: Arc<dyn Suspension>,
    pub reporter: Arc<dyn ProgressReporter>,
}

impl WorkerContext {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            suspension: Arc::new(NeverSuspend),
            reporter: Arc::new(NoProgress),
        }
    }

    pub fn with_suspension(mut self, suspension: Arc<dyn Suspension>) -> Self {
        self.suspension = suspension;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub(crate) async fn checkpoint(&self, label: &str) -> Result<(), TransferError> {
        self.suspension.checkpoint(label).await
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext").field("id", &self.id).finish()
    }
}

use crate::config::Config;
use crate::cookies::SessionJar;
use crate::tiers::{buffer_size_for, processor_allocation, ProcessorAllocation, RateLimit};
use crate::TransferError;
use nxsync_ratelimit::{SharedBucket, StrategyKind, TokenBucket, TransferStats, WorkerArena, WorkerId};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferDirection::Upload => "upload",
            TransferDirection::Download => "download",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which batch upload API the server speaks. `Legacy` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadApi {
    Unknown,
    Modern,
    Legacy,
}

impl UploadApi {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => UploadApi::Modern,
            2 => UploadApi::Legacy,
            _ => UploadApi::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            UploadApi::Unknown => 0,
            UploadApi::Modern => 1,
            UploadApi::Legacy => 2,
        }
    }
}

/// Bucket, stats and configured limit for one direction.
pub struct Lane {
    direction: TransferDirection,
    bucket: Arc<SharedBucket>,
    stats: TransferStats,
    limit: Mutex<RateLimit>,
}

impl Lane {
    fn new(direction: TransferDirection) -> Self {
        let bucket = Arc::new(SharedBucket::unlimited(direction.as_str()));
        Self {
            direction,
            stats: TransferStats::new(direction.as_str(), bucket.clone()),
            bucket,
            limit: Mutex::new(RateLimit::Unlimited),
        }
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn bucket(&self) -> &Arc<SharedBucket> {
        &self.bucket
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn limit(&self) -> RateLimit {
        *self.limit.lock()
    }
}

/// Limiter state shared by every worker of one synchronization session.
pub struct TransferSession {
    arena: WorkerArena,
    upload: Lane,
    download: Lane,
    strategy: StrategyKind,
    read_timeout: Duration,
    upload_tmp_dir: PathBuf,
    upload_api: AtomicU8,
    jar: Arc<SessionJar>,
}

impl TransferSession {
    /// Unlimited in both directions.
    pub fn new(strategy: StrategyKind, read_timeout: Duration, upload_tmp_dir: &Path) -> Self {
        Self {
            arena: WorkerArena::new(),
            upload: Lane::new(TransferDirection::Upload),
            download: Lane::new(TransferDirection::Download),
            strategy,
            read_timeout,
            upload_tmp_dir: upload_tmp_dir.to_path_buf(),
            upload_api: AtomicU8::new(UploadApi::Unknown.as_u8()),
            jar: Arc::new(SessionJar::new()),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, TransferError> {
        let session = Self::new(
            config.transfer.strategy,
            config.transfer.read_timeout(),
            &config.server.upload_tmp_dir(),
        );
        session.set_upload_rate_limit(config.transfer.upload_limit())?;
        session.set_download_rate_limit(config.transfer.download_limit())?;
        Ok(session)
    }

    pub fn lane(&self, direction: TransferDirection) -> &Lane {
        match direction {
            TransferDirection::Upload => &self.upload,
            TransferDirection::Download => &self.download,
        }
    }

    pub fn upload(&self) -> &Lane {
        &self.upload
    }

    pub fn download(&self) -> &Lane {
        &self.download
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    pub fn jar(&self) -> &Arc<SessionJar> {
        &self.jar
    }

    pub fn upload_tmp_dir(&self) -> &Path {
        &self.upload_tmp_dir
    }

    pub fn set_upload_rate_limit(&self, limit: RateLimit) -> Result<(), TransferError> {
        self.install_limit(TransferDirection::Upload, limit)
    }

    pub fn set_download_rate_limit(&self, limit: RateLimit) -> Result<(), TransferError> {
        self.install_limit(TransferDirection::Download, limit)
    }

    fn install_limit(&self, direction: TransferDirection, limit: RateLimit) -> Result<(), TransferError> {
        let name = direction.as_str();
        let bucket = match limit {
            RateLimit::Unlimited => TokenBucket::unlimited(name),
            RateLimit::KbPerSec(rate) => {
                let buffer = buffer_size_for(limit);
                let bucket = TokenBucket::with_strategy(
                    name,
                    rate,
                    self.strategy.build(name, self.read_timeout),
                )?;
                bucket.set_capacity(RateLimit::capacity_for(buffer), buffer)?;
                bucket
            }
        };
        let lane = self.lane(direction);
        let mut current = lane.limit.lock();
        lane.bucket.replace(bucket);
        *current = limit;
        tracing::info!(direction = %name, %limit, strategy = %self.strategy, "bandwidth limit installed");
        Ok(())
    }

    /// Chunk size for uploads: the storage block size of the upload temp
    /// dir when unlimited, otherwise the tier for the current limit.
    pub fn upload_buffer_size(&self) -> usize {
        match self.upload.limit() {
            RateLimit::Unlimited => match fs2::allocation_granularity(&self.upload_tmp_dir) {
                Ok(block) if block > 0 => block as usize,
                Ok(_) => buffer_size_for(RateLimit::Unlimited),
                Err(error) => {
                    tracing::debug!(%error, dir = %self.upload_tmp_dir.display(), "no block size for upload dir");
                    buffer_size_for(RateLimit::Unlimited)
                }
            },
            limit => buffer_size_for(limit),
        }
    }

    pub fn download_buffer_size(&self) -> usize {
        buffer_size_for(self.download.limit())
    }

    pub fn processor_allocation(&self) -> ProcessorAllocation {
        processor_allocation(self.upload.limit(), self.download.limit())
    }

    pub fn upload_api(&self) -> UploadApi {
        UploadApi::from_u8(self.upload_api.load(Ordering::SeqCst))
    }

    /// False once the session has fallen back to the legacy API.
    pub fn is_new_upload_api_available(&self) -> bool {
        self.upload_api() != UploadApi::Legacy
    }

    pub fn mark_modern(&self) {
        let _ = self.upload_api.compare_exchange(
            UploadApi::Unknown.as_u8(),
            UploadApi::Modern.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn mark_legacy(&self) {
        let previous = self.upload_api.swap(UploadApi::Legacy.as_u8(), Ordering::SeqCst);
        if previous != UploadApi::Legacy.as_u8() {
            tracing::debug!("switching to the legacy batch upload API for this session");
        }
    }

    pub fn acquire_worker(&self) -> WorkerId {
        self.arena.acquire()
    }

    pub fn is_live(&self, worker: WorkerId) -> bool {
        self.arena.is_live(worker)
    }

    pub fn live_workers(&self) -> usize {
        self.arena.live_count()
    }

    /// Folds the worker's averages into both buckets, forgets it in the
    /// strategies and returns its handle to the arena.
    pub fn finish_worker(&self, worker: WorkerId) -> bool {
        for lane in [&self.upload, &self.download] {
            lane.stats.clear(worker);
            lane.bucket.clear(worker);
        }
        self.arena.release(worker)
    }
}

impl fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("upload", &self.upload.limit())
            .field("download", &self.download.limit())
            .field("strategy", &self.strategy)
            .field("upload_api", &self.upload_api())
            .field("workers", &self.arena.live_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nxsync_ratelimit::DEFAULT_READ_TIMEOUT;

    fn session() -> TransferSession {
        TransferSession::new(StrategyKind::RoundRobin, DEFAULT_READ_TIMEOUT, &std::env::temp_dir())
    }

    #[test]
    fn limits_replace_the_bucket() {
        let session = session();
        let before = session.upload().bucket().current();
        assert!(before.is_unlimited());

        session.set_upload_rate_limit(RateLimit::KbPerSec(500.0)).unwrap();
        let after = session.upload().bucket().current();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.fill_rate(), Some(500.0));
        assert_eq!(after.strategy_kind(), StrategyKind::RoundRobin);
        let capacity = after.capacity().unwrap();
        assert!((capacity - RateLimit::capacity_for(128 * 1024)).abs() < 1e-9);
        assert_eq!(session.upload_buffer_size(), 128 * 1024);
        assert!(session.download().bucket().current().is_unlimited());

        session.set_upload_rate_limit(RateLimit::Unlimited).unwrap();
        assert!(session.upload().bucket().current().is_unlimited());
        assert!(session.upload_buffer_size() > 0);
    }

    #[test]
    fn download_buffer_follows_the_tier() {
        let session = session();
        assert_eq!(session.download_buffer_size(), 1024 * 1024);
        session.set_download_rate_limit(RateLimit::KbPerSec(5_000.0)).unwrap();
        assert_eq!(session.download_buffer_size(), 256 * 1024);
        assert_eq!(
            session.processor_allocation(),
            processor_allocation(RateLimit::Unlimited, RateLimit::KbPerSec(5_000.0))
        );
    }

    #[test]
    fn legacy_is_sticky() {
        let session = session();
        assert_eq!(session.upload_api(), UploadApi::Unknown);
        assert!(session.is_new_upload_api_available());
        session.mark_modern();
        assert_eq!(session.upload_api(), UploadApi::Modern);
        session.mark_legacy();
        session.mark_modern();
        assert_eq!(session.upload_api(), UploadApi::Legacy);
        assert!(!session.is_new_upload_api_available());
    }

    #[test]
    fn finishing_a_worker_releases_everything() {
        let session = session();
        session.set_download_rate_limit(RateLimit::KbPerSec(100.0)).unwrap();
        let worker = session.acquire_worker();
        let _ = session.download().bucket().current().consume(worker, 1);
        session.download().stats().start(worker, 10, "a.txt");
        assert!(session
            .download()
            .bucket()
            .current()
            .inspect(|s| s.len() == 1));
        assert!(session.finish_worker(worker));
        assert!(!session.is_live(worker));
        assert!(session.download().stats().label(worker).is_none());
        assert!(session.download().bucket().current().inspect(|s| s.is_empty()));
        assert!(!session.finish_worker(worker));
    }
}

use crate::{SharedBucket, SimpleMovingAverage, WorkerId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Completed transfers averaged per worker.
pub const STATS_SMA_WINDOW: usize = 10;

#[derive(Debug, Clone)]
struct Entry {
    total: u64,
    size: u64,
    instant_rate: f64,
    rates: SimpleMovingAverage,
    started_at: Instant,
    last_update: Instant,
    label: String,
}

impl Entry {
    fn new(now: Instant) -> Self {
        Self {
            total: 0,
            size: 0,
            instant_rate: 0.0,
            rates: SimpleMovingAverage::new(STATS_SMA_WINDOW),
            started_at: now,
            last_update: now,
            label: String::new(),
        }
    }

    fn percent(&self) -> Option<f64> {
        (self.total > 0).then(|| 100.0 * self.size as f64 / self.total as f64)
    }
}

/// Point-in-time view of one worker's transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSnapshot {
    pub worker: WorkerId,
    pub label: String,
    pub total: u64,
    pub size: u64,
    pub percent: Option<f64>,
    /// KB/s over the last update interval.
    pub instant_rate: f64,
    /// KB/s averaged over recently completed transfers.
    pub average_rate: f64,
    pub elapsed_secs: f64,
}

/// Per-worker transfer rates for one direction.
pub struct TransferStats {
    name: String,
    bucket: Arc<SharedBucket>,
    entries: Mutex<HashMap<WorkerId, Entry>>,
}

impl TransferStats {
    pub fn new(name: &str, bucket: Arc<SharedBucket>) -> Self {
        Self {
            name: name.to_string(),
            bucket,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bucket(&self) -> &Arc<SharedBucket> {
        &self.bucket
    }

    /// True unless the worker has bytes in flight.
    pub fn is_new_transfer(&self, worker: WorkerId) -> bool {
        self.entries
            .lock()
            .get(&worker)
            .map(|e| e.size == 0)
            .unwrap_or(true)
    }

    pub fn start(&self, worker: WorkerId, total: u64, label: &str) {
        self.start_at(worker, total, label, Instant::now());
    }

    pub fn start_at(&self, worker: WorkerId, total: u64, label: &str, now: Instant) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(worker).or_insert_with(|| Entry::new(now));
        if entry.size > 0 {
            tracing::warn!(
                target: "nxsync.transfer",
                stats = %self.name,
                %worker,
                previous = %entry.label,
                label,
                "transfer already in progress for worker; restarting counters"
            );
        }
        entry.total = total;
        entry.size = 0;
        entry.instant_rate = 0.0;
        entry.label = label.to_string();
        entry.started_at = now;
        entry.last_update = now;
    }

    pub fn update(&self, worker: WorkerId, bytes: u64) {
        self.update_at(worker, bytes, Instant::now());
    }

    /// Adds `bytes` and recomputes the instantaneous rate in KB/s. A zero
    /// interval since the previous update leaves the rate unchanged.
    pub fn update_at(&self, worker: WorkerId, bytes: u64, now: Instant) {
        if bytes == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        let entry = entries.entry(worker).or_insert_with(|| Entry::new(now));
        entry.size += bytes;
        let elapsed = now.saturating_duration_since(entry.last_update).as_secs_f64();
        if now > entry.last_update {
            entry.last_update = now;
        }
        if elapsed > 0.0 {
            entry.instant_rate = bytes as f64 / (elapsed * 1000.0);
        }
    }

    /// Closes the worker's current transfer and returns its updated average.
    pub fn end(&self, worker: WorkerId) -> f64 {
        let average = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&worker) {
                Some(entry) => {
                    let avg = entry.rates.push(entry.instant_rate);
                    entry.size = 0;
                    avg
                }
                None => 0.0,
            }
        };
        self.bucket.reset(worker);
        average
    }

    /// Drops the worker's entry and reports its average to the bucket.
    pub fn clear(&self, worker: WorkerId) {
        let removed = self.entries.lock().remove(&worker);
        if let Some(entry) = removed {
            self.bucket.update_rate(entry.rates.value());
        }
    }

    pub fn percent(&self, worker: WorkerId) -> Option<f64> {
        self.entries.lock().get(&worker).and_then(Entry::percent)
    }

    pub fn average_rate(&self, worker: WorkerId) -> f64 {
        self.entries
            .lock()
            .get(&worker)
            .map(|e| e.rates.value())
            .unwrap_or(0.0)
    }

    pub fn instant_rate(&self, worker: WorkerId) -> f64 {
        self.entries
            .lock()
            .get(&worker)
            .map(|e| e.instant_rate)
            .unwrap_or(0.0)
    }

    pub fn size(&self, worker: WorkerId) -> u64 {
        self.entries.lock().get(&worker).map(|e| e.size).unwrap_or(0)
    }

    pub fn total_size(&self, worker: WorkerId) -> u64 {
        self.entries.lock().get(&worker).map(|e| e.total).unwrap_or(0)
    }

    pub fn label(&self, worker: WorkerId) -> Option<String> {
        self.entries.lock().get(&worker).map(|e| e.label.clone())
    }

    pub fn active_count(&self) -> usize {
        self.entries.lock().values().filter(|e| e.size > 0).count()
    }

    pub fn snapshot(&self, worker: WorkerId) -> Option<TransferSnapshot> {
        let now = Instant::now();
        self.entries.lock().get(&worker).map(|e| TransferSnapshot {
            worker,
            label: e.label.clone(),
            total: e.total,
            size: e.size,
            percent: e.percent(),
            instant_rate: e.instant_rate,
            average_rate: e.rates.value(),
            elapsed_secs: now.saturating_duration_since(e.started_at).as_secs_f64(),
        })
    }
}

impl fmt::Debug for TransferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferStats")
            .field("name", &self.name)
            .field("workers", &self.entries.lock().len())
            .finish()
    }
}

impl fmt::Display for TransferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        let mut workers: Vec<_> = entries.iter().collect();
        workers.sort_by_key(|(id, _)| **id);
        for (i, (id, e)) in workers.into_iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(
                f,
                "{id}: {} {}/{} bytes, average {:.0} KB/s, instant {:.0} KB/s",
                e.label,
                e.size,
                e.total,
                e.rates.value(),
                e.instant_rate
            )?;
        }
        Ok(())
    }
}

use crate::strategy::{FairnessStrategy, StrategyKind, DEFAULT_READ_TIMEOUT};
use crate::{LimiterError, SimpleMovingAverage, WorkerId};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Completed-transfer rates averaged by the bucket.
pub const BUCKET_SMA_WINDOW: usize = 5;

const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct Limit {
    capacity: f64,
    tokens: f64,
    fill_rate: f64,
    last_refill: Instant,
    min_delay: Duration,
}

impl Limit {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + self.fill_rate * elapsed).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

#[derive(Debug)]
struct BucketState {
    // None means unlimited
    limit: Option<Limit>,
    strategy: Box<dyn FairnessStrategy>,
    rates: SimpleMovingAverage,
}

/// Token bucket metering one transfer direction, one token per kilobyte.
#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub name: String,
    pub strategy: StrategyKind,
    pub capacity: Option<f64>,
    pub tokens: Option<f64>,
    pub fill_rate: Option<f64>,
    pub average_rate: f64,
    pub workers: usize,
}

impl TokenBucket {
    pub fn unlimited(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(BucketState {
                limit: None,
                strategy: StrategyKind::None.build(name, DEFAULT_READ_TIMEOUT),
                rates: SimpleMovingAverage::new(BUCKET_SMA_WINDOW),
            }),
        }
    }

    /// Limited bucket holding one second of tokens until [`set_capacity`](Self::set_capacity).
    pub fn new(name: &str, fill_rate: f64, kind: StrategyKind) -> Result<Self, LimiterError> {
        Self::with_strategy(name, fill_rate, kind.build(name, DEFAULT_READ_TIMEOUT))
    }

    pub fn with_strategy(
        name: &str,
        fill_rate: f64,
        strategy: Box<dyn FairnessStrategy>,
    ) -> Result<Self, LimiterError> {
        if !fill_rate.is_finite() || fill_rate <= 0.0 {
            return Err(LimiterError::InvalidRate(fill_rate));
        }
        Ok(Self {
            name: name.to_string(),
            state: Mutex::new(BucketState {
                limit: Some(Limit {
                    capacity: fill_rate,
                    tokens: fill_rate,
                    fill_rate,
                    last_refill: Instant::now(),
                    min_delay: DEFAULT_MIN_DELAY,
                }),
                strategy,
                rates: SimpleMovingAverage::new(BUCKET_SMA_WINDOW),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_unlimited(&self) -> bool {
        self.state.lock().limit.is_none()
    }

    /// Sizes and fills the bucket. The minimum delay imposed on workers that
    /// are not next becomes the time needed to refill one buffer.
    pub fn set_capacity(&self, tokens: f64, buffer_bytes: usize) -> Result<(), LimiterError> {
        if !tokens.is_finite() || tokens <= 0.0 {
            return Err(LimiterError::InvalidCapacity(tokens));
        }
        let mut state = self.state.lock();
        if let Some(limit) = state.limit.as_mut() {
            let min_delay = if buffer_bytes > 0 {
                let fill_rate = limit.fill_rate;
                Duration::try_from_secs_f64(buffer_bytes as f64 / (fill_rate * 1000.0))
                    .map_err(|_| LimiterError::InvalidDelay { buffer_bytes, fill_rate })?
            } else {
                limit.min_delay
            };
            limit.capacity = tokens;
            limit.tokens = tokens;
            limit.last_refill = Instant::now();
            limit.min_delay = min_delay;
        }
        Ok(())
    }

    /// Primes the current level, clamped to the capacity.
    pub fn set_tokens(&self, tokens: f64) {
        let mut state = self.state.lock();
        if let Some(limit) = state.limit.as_mut() {
            limit.tokens = tokens.clamp(0.0, limit.capacity);
        }
    }

    pub fn tokens(&self) -> Option<f64> {
        self.tokens_at(Instant::now())
    }

    pub fn tokens_at(&self, now: Instant) -> Option<f64> {
        let mut state = self.state.lock();
        state.limit.as_mut().map(|limit| {
            limit.refill(now);
            limit.tokens
        })
    }

    pub fn consume(&self, worker: WorkerId, requested: u64) -> Duration {
        self.consume_at(worker, requested, Instant::now())
    }

    /// Asks for `requested` tokens on behalf of `worker`.
    ///
    /// Returns zero when granted (the tokens are debited), otherwise the time
    /// to wait before asking again with the same amount. Requests larger than
    /// the capacity are charged a full bucket.
    pub fn consume_at(&self, worker: WorkerId, requested: u64, now: Instant) -> Duration {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(limit) = state.limit.as_mut() else {
            return Duration::ZERO;
        };
        limit.refill(now);
        let requested = (requested as f64).min(limit.capacity);
        let existing = limit.tokens;
        let available = requested.min(limit.tokens);
        state.strategy.begin(worker, now);
        let mut wait = (requested - available) / limit.fill_rate;
        if !state.strategy.is_next(worker, now) {
            wait = wait.max(limit.min_delay.as_secs_f64());
        }
        let ready = wait <= 0.0;
        if ready {
            limit.tokens -= available;
        }
        state.strategy.update(worker, ready, now);
        tracing::trace!(
            target: "nxsync.transfer",
            bucket = %self.name,
            %worker,
            requested,
            existing,
            available,
            wait_secs = wait.max(0.0),
            "consume"
        );
        Duration::try_from_secs_f64(wait.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Folds a finished transfer's average rate into the bucket average.
    pub fn update_rate(&self, average_rate: f64) {
        if average_rate.is_nan() || average_rate <= 0.0 {
            return;
        }
        let mut state = self.state.lock();
        let avg = state.rates.push(average_rate);
        tracing::trace!(target: "nxsync.transfer", bucket = %self.name, average_rate = avg, "bucket average rate");
    }

    pub fn fill_rate(&self) -> Option<f64> {
        self.state.lock().limit.as_ref().map(|l| l.fill_rate)
    }

    pub fn capacity(&self) -> Option<f64> {
        self.state.lock().limit.as_ref().map(|l| l.capacity)
    }

    pub fn min_delay(&self) -> Duration {
        self.state
            .lock()
            .limit
            .as_ref()
            .map(|l| l.min_delay)
            .unwrap_or(Duration::ZERO)
    }

    pub fn average_rate(&self) -> f64 {
        self.state.lock().rates.value()
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.state.lock().strategy.kind()
    }

    /// Runs `f` against the fairness strategy under the bucket lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&dyn FairnessStrategy) -> R) -> R {
        let state = self.state.lock();
        f(state.strategy.as_ref())
    }

    /// The worker is done with this bucket.
    pub fn clear(&self, worker: WorkerId) {
        self.state.lock().strategy.end(worker);
    }

    pub fn reset(&self, worker: WorkerId) {
        self.reset_at(worker, Instant::now());
    }

    pub fn reset_at(&self, worker: WorkerId, now: Instant) {
        self.state.lock().strategy.reset(worker, now);
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        let mut state = self.state.lock();
        let now = Instant::now();
        let (capacity, tokens, fill_rate) = match state.limit.as_mut() {
            Some(limit) => {
                limit.refill(now);
                (Some(limit.capacity), Some(limit.tokens), Some(limit.fill_rate))
            }
            None => (None, None, None),
        };
        BucketSnapshot {
            name: self.name.clone(),
            strategy: state.strategy.kind(),
            capacity,
            tokens,
            fill_rate,
            average_rate: state.rates.value(),
            workers: state.strategy.len(),
        }
    }
}

impl fmt::Display for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        match state.limit.as_ref() {
            Some(limit) => write!(
                f,
                "token bucket={}, capacity={:.0}, fill rate={:.0}, average file transfer rate={:.0}",
                self.name,
                limit.capacity,
                limit.fill_rate,
                state.rates.value()
            ),
            None => write!(
                f,
                "token bucket={}, capacity=unlimited, average file transfer rate={:.0}",
                self.name,
                state.rates.value()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(i: u32) -> WorkerId {
        WorkerId::from_parts(i, 0)
    }

    fn secs(d: Duration) -> f64 {
        d.as_secs_f64()
    }

    #[test]
    fn unlimited_never_waits() {
        let bucket = TokenBucket::unlimited("upload");
        assert!(bucket.is_unlimited());
        for requested in [0, 1, 1_000, u64::MAX] {
            assert_eq!(bucket.consume(worker(0), requested), Duration::ZERO);
        }
        assert_eq!(bucket.fill_rate(), None);
        assert_eq!(bucket.tokens(), None);
    }

    #[test]
    fn rejects_non_positive_rates_and_capacities() {
        assert!(matches!(
            TokenBucket::new("upload", 0.0, StrategyKind::None),
            Err(LimiterError::InvalidRate(_))
        ));
        assert!(TokenBucket::new("upload", f64::NAN, StrategyKind::None).is_err());
        let bucket = TokenBucket::new("upload", 10.0, StrategyKind::None).unwrap();
        assert_eq!(
            bucket.set_capacity(-1.0, 0),
            Err(LimiterError::InvalidCapacity(-1.0))
        );
    }

    #[test]
    fn unrepresentable_refill_delay_is_an_error() {
        let bucket = TokenBucket::new("upload", 1e-300, StrategyKind::None).unwrap();
        assert_eq!(
            bucket.set_capacity(100.0, 1024 * 1024),
            Err(LimiterError::InvalidDelay {
                buffer_bytes: 1024 * 1024,
                fill_rate: 1e-300
            })
        );
        assert_eq!(bucket.capacity(), Some(1e-300));
        assert_eq!(bucket.min_delay(), DEFAULT_MIN_DELAY);

        bucket.set_capacity(100.0, 0).unwrap();
        bucket.set_tokens(0.0);
        assert_eq!(bucket.consume(worker(0), 50), Duration::MAX);
    }

    #[test]
    fn deficit_is_paid_by_waiting() {
        let bucket = TokenBucket::new("download", 10.0, StrategyKind::None).unwrap();
        bucket.set_capacity(100.0, 0).unwrap();
        bucket.set_tokens(0.0);
        let t0 = Instant::now();
        let w = worker(0);

        let wait = bucket.consume_at(w, 5, t0);
        assert!((secs(wait) - 0.5).abs() < 0.01, "waited {wait:?}");

        let wait = bucket.consume_at(w, 5, t0 + Duration::from_millis(500));
        assert_eq!(wait, Duration::ZERO);
        let left = bucket.tokens_at(t0 + Duration::from_millis(500)).unwrap();
        assert!(left.abs() < 0.01, "tokens left {left}");
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let bucket = TokenBucket::new("upload", 50.0, StrategyKind::None).unwrap();
        bucket.set_capacity(20.0, 0).unwrap();
        let far = Instant::now() + Duration::from_secs(60);
        assert_eq!(bucket.tokens_at(far), Some(20.0));
        bucket.set_tokens(500.0);
        assert_eq!(bucket.tokens_at(far), Some(20.0));
    }

    #[test]
    fn oversized_requests_are_charged_a_full_bucket() {
        let bucket = TokenBucket::new("upload", 10.0, StrategyKind::None).unwrap();
        bucket.set_capacity(8.0, 0).unwrap();
        let now = Instant::now() + Duration::from_secs(1);
        assert_eq!(bucket.consume_at(worker(0), 100, now), Duration::ZERO);
        assert!(bucket.tokens_at(now).unwrap().abs() < 1e-9);
    }

    #[test]
    fn workers_that_are_not_next_wait_at_least_the_min_delay() {
        let bucket = TokenBucket::new("upload", 300.0, StrategyKind::RoundRobin).unwrap();
        bucket.set_capacity(144.0, 131_072).unwrap();
        let expected = 131_072.0 / (300.0 * 1000.0);
        assert!((secs(bucket.min_delay()) - expected).abs() < 1e-9);

        let now = Instant::now() + Duration::from_secs(1);
        let (a, b) = (worker(0), worker(1));
        // a joins alone and gets its turn
        assert_eq!(bucket.consume_at(a, 1, now), Duration::ZERO);
        // b joins and the cycle restarts at a, so b is refused despite tokens
        let wait = bucket.consume_at(b, 1, now);
        assert!((secs(wait) - expected).abs() < 1e-9, "waited {wait:?}");
        bucket.inspect(|s| {
            assert_eq!(s.len(), 2);
            assert_eq!(s.count(b), 1);
        });
    }

    #[test]
    fn sampled_rates_form_a_five_sample_average() {
        let bucket = TokenBucket::new("download", 100.0, StrategyKind::None).unwrap();
        bucket.update_rate(0.0);
        bucket.update_rate(-3.0);
        assert_eq!(bucket.average_rate(), 0.0);
        for rate in [10.0, 20.0, 30.0, 40.0, 50.0, 60.0] {
            bucket.update_rate(rate);
        }
        assert!((bucket.average_rate() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn clear_forgets_the_worker() {
        let bucket = TokenBucket::new("upload", 10.0, StrategyKind::WaitPriority).unwrap();
        let w = worker(3);
        bucket.consume(w, 1);
        assert_eq!(bucket.snapshot().workers, 1);
        bucket.clear(w);
        bucket.clear(w);
        assert_eq!(bucket.snapshot().workers, 0);
    }

    #[test]
    fn display_mentions_rates() {
        let bucket = TokenBucket::new("upload", 300.0, StrategyKind::None).unwrap();
        bucket.set_capacity(144.0, 0).unwrap();
        assert_eq!(
            bucket.to_string(),
            "token bucket=upload, capacity=144, fill rate=300, average file transfer rate=0"
        );
        assert!(TokenBucket::unlimited("download")
            .to_string()
            .contains("capacity=unlimited"));
    }
}

//! Buffer sizes and worker allocation keyed by bandwidth bracket.

use std::fmt;

pub const BUFFER_SIZE_WITH_RATE_LIMIT: usize = 128 * 1024;
pub const BUFFER_SIZE_NO_RATE_LIMIT: usize = 1024 * 1024;

const LESS_THAN_300_KBS: f64 = 300.0;
const LESS_THAN_1000_KBS: f64 = 1_000.0;
const LESS_THAN_10000_KBS: f64 = 10_000.0;
const LESS_THAN_100000_KBS: f64 = 100_000.0;

/// Bandwidth limit for one direction, in KB/s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimit {
    Unlimited,
    KbPerSec(f64),
}

impl RateLimit {
    /// `None`, zero, negative or non-finite values all mean unlimited.
    pub fn from_kbps(value: Option<f64>) -> Self {
        match value {
            Some(v) if v.is_finite() && v > 0.0 => RateLimit::KbPerSec(v),
            _ => RateLimit::Unlimited,
        }
    }

    pub fn kbps(self) -> Option<f64> {
        match self {
            RateLimit::Unlimited => None,
            RateLimit::KbPerSec(v) => Some(v),
        }
    }

    pub fn is_limited(self) -> bool {
        matches!(self, RateLimit::KbPerSec(_))
    }

    /// Bucket capacity that holds slightly more than one buffer.
    pub fn capacity_for(buffer_bytes: usize) -> f64 {
        1.1 * buffer_bytes as f64 / 1000.0
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimit::Unlimited => f.write_str("unlimited"),
            RateLimit::KbPerSec(v) => write!(f, "{v:.0} KB/s"),
        }
    }
}

/// Transfer buffer for `limit`. Smaller buffers at low rates keep the
/// limiter's feedback loop responsive.
pub fn buffer_size_for(limit: RateLimit) -> usize {
    match limit {
        RateLimit::KbPerSec(r) if r <= LESS_THAN_1000_KBS => BUFFER_SIZE_WITH_RATE_LIMIT,
        RateLimit::KbPerSec(r) if r <= LESS_THAN_10000_KBS => BUFFER_SIZE_WITH_RATE_LIMIT * 2,
        RateLimit::KbPerSec(r) if r <= LESS_THAN_100000_KBS => BUFFER_SIZE_WITH_RATE_LIMIT * 4,
        _ => BUFFER_SIZE_NO_RATE_LIMIT,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateStep {
    Under300,
    Under1000,
    NoLimit,
}

impl RateStep {
    pub fn of(limit: RateLimit) -> Self {
        match limit {
            RateLimit::KbPerSec(r) if r <= LESS_THAN_300_KBS => RateStep::Under300,
            RateLimit::KbPerSec(r) if r <= LESS_THAN_1000_KBS => RateStep::Under1000,
            _ => RateStep::NoLimit,
        }
    }
}

/// Worker counts for a pair of limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessorAllocation {
    pub upload: usize,
    pub download: usize,
    pub generic: usize,
}

impl ProcessorAllocation {
    const fn new(upload: usize, download: usize, generic: usize) -> Self {
        Self {
            upload,
            download,
            generic,
        }
    }

    pub fn total(&self) -> usize {
        self.upload + self.download + self.generic
    }
}

pub fn processor_allocation(upload: RateLimit, download: RateLimit) -> ProcessorAllocation {
    use RateStep::*;
    match (RateStep::of(upload), RateStep::of(download)) {
        (Under300, Under300) => ProcessorAllocation::new(2, 2, 0),
        (Under300, Under1000) => ProcessorAllocation::new(2, 5, 0),
        (Under300, NoLimit) => ProcessorAllocation::new(2, 11, 0),
        (Under1000, Under300) => ProcessorAllocation::new(5, 2, 0),
        (Under1000, Under1000) => ProcessorAllocation::new(5, 5, 0),
        (Under1000, NoLimit) => ProcessorAllocation::new(5, 11, 0),
        (NoLimit, Under300) => ProcessorAllocation::new(11, 2, 0),
        (NoLimit, Under1000) => ProcessorAllocation::new(11, 5, 0),
        (NoLimit, NoLimit) => ProcessorAllocation::new(0, 0, 12),
    }
}

/// Largest worker count any bracket pair allocates.
pub const MAX_PROCESSORS: usize = 16;

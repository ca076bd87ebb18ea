//! Bandwidth limiting for concurrent transfer workers.
//!
//! A [`TokenBucket`] meters kilobytes per second for one transfer direction
//! and delegates the order in which workers may draw tokens to a
//! [`FairnessStrategy`]. [`TransferStats`] measures per-worker rates and feeds
//! finished-transfer averages back into the bucket held by a [`SharedBucket`].

mod bucket;
mod error;
mod shared;
mod sma;
mod stats;
pub mod strategy;
mod worker;

pub use bucket::{BucketSnapshot, TokenBucket, BUCKET_SMA_WINDOW};
pub use error::LimiterError;
pub use shared::SharedBucket;
pub use sma::SimpleMovingAverage;
pub use stats::{TransferSnapshot, TransferStats, STATS_SMA_WINDOW};
pub use strategy::{
    FairnessStrategy, NoStrategy, RoundRobinStrategy, StrategyKind, WaitPriorityStrategy,
    DEFAULT_READ_TIMEOUT,
};
pub use worker::{WorkerArena, WorkerId};

/// Number of tokens needed for `bytes`, one token per started kilobyte.
pub fn tokens_for(bytes: usize) -> u64 {
    (bytes as u64).div_ceil(1000)
}

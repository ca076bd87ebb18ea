//! Transfer core of the synchronization client.
//!
//! [`TransferClient`] talks to the server's automation API: it discovers the
//! operation catalog, validates and runs operations, uploads blobs through
//! the batch upload API (falling back to the legacy endpoints for the rest
//! of the session when the server lacks the resumable one) and downloads
//! with digest verification. Every chunk is metered by the buckets of the
//! shared [`TransferSession`].

pub mod catalog;
pub mod client;
pub mod config;
pub mod context;
pub mod cookies;
pub mod digest;
pub mod download;
mod error;
pub mod http;
pub mod lock;
pub mod proxy;
pub mod session;
pub mod tiers;
pub mod upload;
pub mod util;

pub use catalog::{OperationCatalog, OperationDescriptor, ParamDescriptor};
pub use client::{Credentials, ExecuteOptions, ExecuteOutput, TransferClient};
pub use config::{load_config, Config, ServerConfig, TransferConfig};
pub use context::{NeverSuspend, NoProgress, ProgressReporter, SuspendFlag, Suspension, WorkerContext};
pub use cookies::SessionJar;
pub use digest::DigestAlgorithm;
pub use download::{DownloadOutput, DownloadTarget};
pub use error::{Availability, RemoteError, TransferError};
pub use proxy::{ProxyMode, ProxyResolution, ProxySettings};
pub use session::{Lane, TransferDirection, TransferSession, UploadApi};
pub use tiers::{ProcessorAllocation, RateLimit};

pub use nxsync_ratelimit::{StrategyKind, WorkerId};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Error document returned by the server alongside a failing status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RemoteError {
    /// Parses a JSON error body; anything else becomes the message.
    pub fn parse(status: u16, body: &str) -> Self {
        let mut remote = match serde_json::from_str::<RemoteError>(body) {
            Ok(parsed) => parsed,
            Err(_) => RemoteError {
                message: (!body.trim().is_empty() && !body.contains("<html>"))
                    .then(|| body.trim().to_string()),
                ..RemoteError::default()
            },
        };
        remote.status.get_or_insert(status);
        remote
    }

    /// True when `exception` is the remote code or appears in the message.
    pub fn names(&self, exception: &str) -> bool {
        self.code.as_deref() == Some(exception)
            || self
                .message
                .as_deref()
                .map(|m| m.contains(exception))
                .unwrap_or(false)
    }

    pub fn is_unknown_batch(&self) -> bool {
        self.error
            .as_deref()
            .map(|e| e.starts_with("Unable to find batch"))
            .unwrap_or(false)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    #[error("'{user}' is not authorized to access '{server}' with the provided credentials (HTTP {code})")]
    Unauthorized {
        server: String,
        user: String,
        code: u16,
    },
    #[error("either the nuxeo-drive addon is not installed on {server} or the server is older than client {client_version} supports (missing {operation})")]
    AddonNotInstalled {
        server: String,
        client_version: String,
        operation: String,
    },
    #[error("'{0}' is not a registered operation")]
    UnknownOperation(String),
    #[error("missing required param '{param}' for operation '{operation}'")]
    MissingParam { operation: String, param: String },
    #[error("invalid batch: {}", .remote.error.as_deref().unwrap_or("unknown batch"))]
    InvalidBatch { remote: RemoteError },
    #[error("corrupted file {}: expected digest = {expected}, actual digest = {actual}", .path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "<memory>".into()))]
    CorruptedFile {
        path: Option<PathBuf>,
        expected: String,
        actual: String,
    },
    #[error("unknown digest method: {0}")]
    UnknownDigest(String),
    #[error("{message}")]
    Connectivity { message: String },
    #[error("HTTP {status} from {url}{}", .remote.message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Http {
        status: u16,
        url: String,
        remote: RemoteError,
    },
    #[error("bad response: {0}")]
    BadResponse(String),
    #[error("suspended: {0}")]
    Suspended(String),
    #[error("credentials: {0}")]
    Credentials(String),
    #[error("configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Limiter(#[from] nxsync_ratelimit::LimiterError),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TransferError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransferError::Unauthorized { code, .. } => Some(*code),
            TransferError::Http { status, .. } => Some(*status),
            TransferError::Transport(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransferError::Unauthorized { .. })
    }
}

/// Outcome of asking the server for an optional feature.
///
/// Transport failures stay in the surrounding `Result`; `Absent` only means
/// the server does not offer the feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability<T> {
    Available(T),
    Absent,
}

impl<T> Availability<T> {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Availability::Available(v) => Some(v),
            Availability::Absent => None,
        }
    }
}

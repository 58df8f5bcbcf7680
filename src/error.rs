//! Error types for every boundary of the sync engine, plus the
//! transient / permanent / conflict classification of request failures.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::model::OrderId;

/// How a failed request is treated by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Network trouble or a 5xx. Retried on the next drain cycle.
    Transient,
    /// Rejected by the server (4xx). Abandoned and surfaced on the order.
    Permanent,
    /// Rejected because the order's `changeVersion` moved on. Surfaced like
    /// `Permanent`.
    Conflict,
}

impl FailureKind {
    pub fn is_terminal(self) -> bool {
        !matches!(self, FailureKind::Transient)
    }
}

// ---------------------------------------------------------------------------
// Request layer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    #[error("Cannot reach order server at {url}")]
    Connect { url: String },
    #[error("Connection to {url} timed out")]
    Timeout { url: String },
    #[error("Network error communicating with {url}: {message}")]
    Network { url: String, message: String },
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },
    #[error("Invalid response from order server: {0}")]
    Decode(String),
    #[error("Invalid request: {0}")]
    Request(String),
    #[error("Credential unavailable: {0}")]
    Credential(String),
}

impl ApiError {
    pub fn classify(&self) -> FailureKind {
        match self {
            ApiError::Connect { .. } | ApiError::Timeout { .. } | ApiError::Network { .. } => {
                FailureKind::Transient
            }
            // The session may be restored later; never drop work over it.
            ApiError::Credential(_) => FailureKind::Transient,
            ApiError::Status { status, message } => classify_status(*status, message),
            ApiError::Decode(_) | ApiError::Request(_) => FailureKind::Permanent,
        }
    }
}

fn classify_status(status: u16, message: &str) -> FailureKind {
    match status {
        408 | 429 => FailureKind::Transient,
        s if s >= 500 => FailureKind::Transient,
        409 => FailureKind::Conflict,
        s if (400..500).contains(&s) && is_version_conflict_message(message) => {
            FailureKind::Conflict
        }
        _ => FailureKind::Permanent,
    }
}

fn is_version_conflict_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("changeversion")
        || lower.contains("change_version")
        || lower.contains("change version")
        || lower.contains("version conflict")
        || lower.contains("version mismatch")
        || lower.contains("stale version")
}

// ---------------------------------------------------------------------------
// Other boundaries
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Cannot connect to push channel at {addr}: {message}")]
    Connect { addr: String, message: String },
    #[error("Push channel connect to {addr} timed out")]
    Timeout { addr: String },
    #[error("Push channel closed")]
    Closed,
    #[error("Push channel I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed push message: {0}")]
    Protocol(String),
    #[error("Credential unavailable: {0}")]
    Credential(#[from] CredentialError),
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential store error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("No credential stored under {0}")]
    Missing(String),
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Replay buffer database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Replay buffer payload error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to prepare replay buffer directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
}

/// Errors returned to callers of the engine's operator actions.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Orders have not been loaded yet")]
    NotLoaded,
    #[error("Order {0} is not known to this session")]
    UnknownOrder(OrderId),
    #[error("Order {0} has no failed command to retry")]
    NoFailure(OrderId),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error("Sync loop has stopped")]
    Stopped,
}

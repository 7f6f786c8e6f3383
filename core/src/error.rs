use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Stable error codes surfaced to callers in the `{kind, detail}` envelope.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Duplicate,
    UnsafeCommand,
    Timeout,
    RecoveryDiscarded,
    SinkUnavailable,
    InvalidAddress,
    InvalidPattern,
    InvalidRule,
    /// A request that could not be parsed into an operation.
    InvalidRequest,
    ProcessUnavailable,
    SpawnFailed,
    Storage,
    Internal,
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("session `{name}` not found")]
    SessionNotFound { name: String },
    #[error("window `{address}` not found")]
    WindowNotFound { address: String },
    #[error("pane `{address}` not found")]
    PaneNotFound { address: String },
    #[error("trigger rule `{id}` not found")]
    RuleNotFound { id: String },
    #[error("sink `{id}` is not registered")]
    SinkNotFound { id: String },
    #[error("pane `{address}` is not being watched")]
    WatchNotFound { address: String },
    #[error("session `{name}` already exists")]
    DuplicateSession { name: String },
    #[error("window `{address}` already exists")]
    DuplicateWindow { address: String },
    #[error("trigger rule `{id}` already exists")]
    DuplicateRule { id: String },
    #[error("command rejected: {reason}")]
    UnsafeCommand { reason: String },
    #[error("pane `{address}` did not exit within {grace:?}")]
    Timeout { address: String, grace: Duration },
    #[error("recovery of session `{session}` discarded: {reason}")]
    RecoveryDiscarded { session: String, reason: String },
    #[error("sink `{id}` unavailable: {reason}")]
    SinkUnavailable { id: String, reason: String },
    #[error("invalid address `{input}`: {reason}")]
    InvalidAddress { input: String, reason: String },
    #[error("invalid pattern `{name}`: {reason}")]
    InvalidPattern { name: String, reason: String },
    #[error("invalid trigger rule `{id}`: {reason}")]
    InvalidRule { id: String, reason: String },
    #[error("process for pane `{address}` is unavailable: {reason}")]
    ProcessUnavailable { address: String, reason: String },
    #[error("failed to spawn pane `{address}`: {source}")]
    SpawnFailed {
        address: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotFound { .. }
            | Self::WindowNotFound { .. }
            | Self::PaneNotFound { .. }
            | Self::RuleNotFound { .. }
            | Self::SinkNotFound { .. }
            | Self::WatchNotFound { .. } => ErrorKind::NotFound,
            Self::DuplicateSession { .. }
            | Self::DuplicateWindow { .. }
            | Self::DuplicateRule { .. } => ErrorKind::Duplicate,
            Self::UnsafeCommand { .. } => ErrorKind::UnsafeCommand,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RecoveryDiscarded { .. } => ErrorKind::RecoveryDiscarded,
            Self::SinkUnavailable { .. } => ErrorKind::SinkUnavailable,
            Self::InvalidAddress { .. } => ErrorKind::InvalidAddress,
            Self::InvalidPattern { .. } => ErrorKind::InvalidPattern,
            Self::InvalidRule { .. } => ErrorKind::InvalidRule,
            Self::ProcessUnavailable { .. } => ErrorKind::ProcessUnavailable,
            Self::SpawnFailed { .. } => ErrorKind::SpawnFailed,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Encode(_) => ErrorKind::Internal,
            Self::ShuttingDown => ErrorKind::ShuttingDown,
        }
    }

    pub fn session_not_found(name: impl Into<String>) -> Self {
        Self::SessionNotFound { name: name.into() }
    }

    pub fn window_not_found(address: impl ToString) -> Self {
        Self::WindowNotFound {
            address: address.to_string(),
        }
    }

    pub fn pane_not_found(address: impl ToString) -> Self {
        Self::PaneNotFound {
            address: address.to_string(),
        }
    }

    pub fn unsafe_command(reason: impl Into<String>) -> Self {
        Self::UnsafeCommand {
            reason: reason.into(),
        }
    }

    pub fn invalid_address(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_pattern(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidPattern {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn process_unavailable(address: impl ToString, reason: impl Into<String>) -> Self {
        Self::ProcessUnavailable {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    pub fn spawn_failed(address: impl ToString, source: anyhow::Error) -> Self {
        Self::SpawnFailed {
            address: address.to_string(),
            source,
        }
    }
}

/// Failures of the durable session store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write `{path}`: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode record for `{session}`: {source}")]
    Encode {
        session: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("record `{path}` is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl StoreError {
    pub(crate) fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Wire form of an error, `{ "kind": ..., "detail": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub detail: String,
}

impl From<&OrchestratorError> for ErrorPayload {
    fn from(err: &OrchestratorError) -> Self {
        Self {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

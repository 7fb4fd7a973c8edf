use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Lifecycle state of an encode session, as reported in state errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Ready,
    Collecting,
    Building,
    Completed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "ready",
            Self::Collecting => "collecting",
            Self::Building => "building",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Rejections raised by the encoder state machine. All of them are
/// recoverable by waiting for a build to finish or by calling `reset`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("no chunks to encode")]
    NoChunks,

    #[error("build in progress")]
    BuildingInProgress,

    #[error("session already completed; reset it first")]
    AlreadyCompleted,

    #[error("unexpected call '{call}' in state {state}")]
    UnexpectedCall {
        state: SessionState,
        call: &'static str,
    },
}

/// Failures reported by an embedding provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmbeddingError {
    #[error("cannot embed empty text")]
    EmptyText,

    #[error("embedding model unavailable: {reason}")]
    ModelUnavailable { reason: Box<str> },

    #[error("embedding request timed out")]
    Timeout,

    #[error("embedding failed: {reason}")]
    Other { reason: Box<str> },
}

/// Canonical error surface for framevault.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {source}")]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serialization error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Deserialization error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Invalid configuration: {reason}")]
    Validation { reason: Cow<'static, str> },

    #[error("Input contains no non-empty text")]
    EmptyInput,

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Codec error: {reason}")]
    Codec { reason: Cow<'static, str> },

    #[error("Symbol is not a valid code: {reason}")]
    InvalidCode { reason: Cow<'static, str> },

    #[error("Index error: {reason}")]
    Index { reason: Cow<'static, str> },

    #[error("Vector dimension mismatch (expected {expected}, got {actual})")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Capacity exceeded: index holds at most {max_elements} items, {requested} requested")]
    CapacityExceeded { max_elements: usize, requested: usize },

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("Build failed: {reason}")]
    BuildFailed { reason: String },
}

impl ArchiveError {
    pub(crate) fn io_at(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    pub(crate) fn validation(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub(crate) fn codec(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Codec {
            reason: reason.into(),
        }
    }

    pub(crate) fn index(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Index {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for ArchiveError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }
}

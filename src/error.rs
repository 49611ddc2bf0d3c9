use std::time::Duration;
use thiserror::Error;

/// Validation failure on a producer-supplied record.
///
/// Malformed records are never rejected: they bypass deduplication and are
/// still batched, and the problem is reported back in the ingest result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record is missing required field `{0}`")]
    MissingField(&'static str),
}

/// Failure reported by a [`Sink`](crate::sink::Sink) implementation.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("sink rejected write: {0}")]
    Rejected(String),
    #[error("sink write timed out after {0:?}")]
    Timeout(Duration),
    #[error("group could not be encoded: {0}")]
    Encoding(#[from] CompressionError),
    #[error("sink i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("failed to serialize group: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("compression stream failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload is corrupt: {0}")]
    Corrupt(String),
}

/// Errors surfaced by the engine lifecycle API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine already started")]
    AlreadyStarted,
    #[error("engine has already stopped")]
    Stopped,
    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("flush worker terminated before draining")]
    WorkerGone,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("`{field}` {reason}")]
    Invalid { field: &'static str, reason: String },
}

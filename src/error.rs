//! Error taxonomy for the store, codec, producer and worker.
//!
//! These are kinds, not exception classes: every public operation returns
//! one of the enums below rather than a boxed `dyn Error`, so callers can
//! match on the failure instead of string-sniffing it.

use crate::store::TaskId;

/// Persistence-layer failures (spec kinds: `StoreConnectError`,
/// `StoreClosedError`, `StoreIOError`, `DuplicateTaskError`).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to connect to store: {0}")]
    Connect(String),

    #[error("store is closed")]
    Closed,

    #[error("store io error: {0}")]
    Io(String),

    #[error("task already exists: {0}")]
    Duplicate(TaskId),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        // Callers that can name the offending id (`enqueue`) map
        // `SQLITE_CONSTRAINT` to `Duplicate` inline instead of going through
        // this conversion; everything else lands here as `Io`.
        StoreError::Io(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Envelope/value encoding failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode: {0}")]
    Encode(String),

    #[error("failed to decode: {0}")]
    Decode(String),
}

/// Input violations raised at the Producer/Worker public boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("handler name must be non-empty")]
    MissingHandler,

    #[error("max_concurrency must be a positive integer")]
    NonPositiveConcurrency,

    #[error("batch_size must be a positive integer")]
    NonPositiveBatchSize,
}

/// What a registered handler raises on failure. Never surfaced to the
/// producer directly: the worker turns this into a `failed` row
/// (`TaskExecutionFailure` in spec terms, which never escapes the worker).
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub message: String,
    pub traceback: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(message: impl Into<String>, traceback: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: Some(traceback.into()),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Aggregate error surfaced by `TaskQueue` (the Producer).
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Raised only by `Worker::start()` when called on an already-`stopped`
/// worker; every other worker failure is absorbed and recorded as a
/// `failed` task (spec §7's propagation policy). Input validation
/// (`max_concurrency`/`batch_size`) belongs to `ValidationError`, raised by
/// `Worker::new` instead — see `QueueError`/`ValidationError`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error("invalid worker state: {0}")]
    InvalidState(&'static str),
}

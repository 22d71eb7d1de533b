//! Summary: Error types for the thunderstream write path.
//! Copyright (c) YOAB. All rights reserved.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for thunderstream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for store and write stream operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// I/O error from filesystem operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The store could not be opened.
    #[error("failed to open database: {reason}")]
    OpenFailed { reason: String },

    /// A flushed put or batch was rejected by the store.
    #[error("failed to apply {ops} buffered operation(s): {source}")]
    ApplyFailed {
        ops: usize,
        #[source]
        source: Box<Error>,
    },

    /// Key not found in the database.
    #[error("key not found")]
    NotFound,

    /// The database has not finished opening.
    #[error("database is not open")]
    NotOpen,

    /// The database has been closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// The write stream no longer accepts writes.
    #[error("write stream is not writable")]
    NotWritable,

    /// Invalid stream or database options.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The database location already exists and `error_if_exists` was set.
    #[error("database already exists at '{}'", path.display())]
    DatabaseExists { path: PathBuf },

    /// The database location is missing and `create_if_missing` was not set.
    #[error("database does not exist at '{}'", path.display())]
    DatabaseMissing { path: PathBuf },

    /// A log record failed validation.
    #[error("invalid record at offset {offset}: {reason}")]
    RecordInvalid { offset: u64, reason: String },

    /// A key or record exceeds the log format limits.
    #[error("{what} size {size} exceeds maximum {max}")]
    RecordTooLarge {
        what: &'static str,
        size: usize,
        max: usize,
    },

    /// An injected fault from the in-memory backend.
    #[error("injected fault: {0}")]
    FaultInjected(&'static str),

    /// A background task panicked, was cancelled or could not be spawned.
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::TaskFailed(err.to_string())
    }
}

impl Error {
    /// Returns true if this error reports a missing key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// Wraps a store error raised while applying `ops` flushed operations.
    pub(crate) fn apply(ops: usize, source: Error) -> Self {
        Error::ApplyFailed {
            ops,
            source: Box::new(source),
        }
    }

    /// Converts any store error into an open failure.
    pub(crate) fn open(source: &Error) -> Self {
        match source {
            Error::OpenFailed { reason } => Error::OpenFailed {
                reason: reason.clone(),
            },
            other => Error::OpenFailed {
                reason: other.to_string(),
            },
        }
    }
}

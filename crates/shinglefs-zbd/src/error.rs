//! Error types for the zoned block device core.

use thiserror::Error;

/// Result type alias for zoned block device operations.
pub type ZbdResult<T> = Result<T, ZbdError>;

/// Error variants for zoned block device operations.
///
/// The enum is `Clone` because a deferred write error is latched on the pool
/// and handed back verbatim to every subsequent allocation attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ZbdError {
    /// A backend device operation failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// Not enough capacity in a zone, or a reserved zone ring is exhausted.
    #[error("no space: {0}")]
    NoSpace(String),

    /// No zone matched the requested criteria.
    #[error("not found: {0}")]
    NotFound(String),

    /// The device cannot back a pool (wrong geometry or zone model).
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A caller-supplied argument violates a precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal state is inconsistent, e.g. releasing an unheld busy flag.
    #[error("corruption: {0}")]
    Corruption(String),
}

impl From<std::io::Error> for ZbdError {
    fn from(e: std::io::Error) -> Self {
        ZbdError::Io(e.to_string())
    }
}

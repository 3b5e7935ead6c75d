//! Unified error type for spanstore.
//!
//! Every crate in the workspace returns [`Error`]. Variants map one-to-one onto
//! the failure classes callers act on: reject one push, surface to caller,
//! return partial results, retry, or skip and continue.

use thiserror::Error;

/// All spanstore errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed trace id or payload. Rejects one push only.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown block or object
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request argument (unknown tag scope, bad query, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Lifecycle step issued out of order
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Tenant over a live-trace or trace-size cap
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Backend or local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed WAL record, block footer or checksum mismatch
    #[error("corruption: {0}")]
    Corruption(String),

    /// Encoding failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The operation's context was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// The operation's context deadline passed
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Result type for spanstore operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is retryable.
    ///
    /// Only I/O failures may succeed on retry; everything else is a property
    /// of the input or of durable state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    /// Check if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
            || matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Check if this is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    /// Check if this is a corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    /// Check if the operation stopped because its context ended.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_io_is_retryable() {
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(io.is_retryable());
        assert!(!Error::Corruption("x".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_io_not_found_is_not_found() {
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(io.is_not_found());
        assert!(Error::NotFound("block".into()).is_not_found());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::InvalidArgument("scope".into()).to_string(),
            "invalid argument: scope"
        );
    }
}

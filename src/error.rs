//! Error handling for sendspin.
//!
//! Provides a unified error type categorized along the protocol's failure
//! taxonomy: protocol violations, decode failures, capability mismatches,
//! timeouts, and precondition errors. Transport- and serialization-level
//! errors from the underlying crates convert into the matching category.
//!
//! # Example
//!
//! ```rust
//! use sendspin::error::{Error, ErrorKind, Result};
//!
//! fn must_be_synchronized(synchronized: bool) -> Result<()> {
//!     if !synchronized {
//!         return Err(Error::failed_precondition("time filter not synchronized"));
//!     }
//!     Ok(())
//! }
//! ```

use std::fmt;

use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

/// Standard result type for sendspin operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories.
///
/// Each variant represents a distinct failure category of the protocol
/// machinery and carries a standard error message.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// The operation was cancelled before it could complete.
    #[error("operation was cancelled")]
    Cancelled,

    /// A time-bound operation exceeded its limit (connect, hello,
    /// initial-state, graceful close).
    #[error("operation timed out")]
    DeadlineExceeded,

    /// The current state forbids the operation (sending source audio
    /// without sync, sending on a closed socket, wrong handshake order).
    #[error("invalid state")]
    FailedPrecondition,

    /// Malformed input: short binary header, invalid JSON, bad argument.
    #[error("invalid argument specified")]
    InvalidArgument,

    /// A requested entity does not exist (unknown client id).
    #[error("not found")]
    NotFound,

    /// A value exceeds its allowed bounds (artwork channel index, sample
    /// parameters).
    #[error("out of range")]
    OutOfRange,

    /// The transport is gone or refused the operation.
    #[error("service unavailable")]
    Unavailable,

    /// Unexpected internal error.
    #[error("internal error")]
    Internal,
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Creates an error for cancelled operations.
    pub fn cancelled<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Cancelled, error)
    }

    /// Creates an error for operations that exceeded their deadline.
    pub fn deadline_exceeded<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::DeadlineExceeded, error)
    }

    /// Creates an error for operations that failed due to current state.
    pub fn failed_precondition<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::FailedPrecondition, error)
    }

    /// Creates an error for invalid arguments.
    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidArgument, error)
    }

    /// Creates an error for missing resources.
    pub fn not_found<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::NotFound, error)
    }

    /// Creates an error for values outside valid range.
    pub fn out_of_range<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::OutOfRange, error)
    }

    /// Creates an error for unavailable services or transports.
    pub fn unavailable<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unavailable, error)
    }

    /// Creates an error for internal errors.
    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Internal, error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.error)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::new(ErrorKind::Unavailable, error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::new(ErrorKind::InvalidArgument, error)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        let kind = match &error {
            WsError::ConnectionClosed | WsError::AlreadyClosed => ErrorKind::FailedPrecondition,
            WsError::Io(_) => ErrorKind::Unavailable,
            _ => ErrorKind::Internal,
        };
        Self::new(kind, error)
    }
}

impl From<url::ParseError> for Error {
    fn from(error: url::ParseError) -> Self {
        Self::new(ErrorKind::InvalidArgument, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_kind() {
        assert_eq!(
            Error::failed_precondition("nope").kind,
            ErrorKind::FailedPrecondition
        );
        assert_eq!(
            Error::deadline_exceeded("slow").kind,
            ErrorKind::DeadlineExceeded
        );
        assert_eq!(Error::invalid_argument("bad").kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn display_includes_kind_and_detail() {
        let err = Error::out_of_range("channel 7");
        let text = err.to_string();
        assert!(text.contains("out of range"));
        assert!(text.contains("channel 7"));
    }

    #[test]
    fn json_errors_convert_to_invalid_argument() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }
}

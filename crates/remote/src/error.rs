//! Remote Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::time::Duration;

/// A remote error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for remote operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
/// [`Throttled`](Self::Throttled) is absorbed by the
/// [`RateLimiter`](crate::RateLimiter); callers only ever see it when they
/// bypass [`RateLimiter::execute`](crate::RateLimiter::execute).
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Upstream signalled rate exhaustion (HTTP 429).
    #[display("throttled by upstream (retry after {}ms)", retry_after.as_millis())]
    Throttled {
        #[error(not(source))]
        retry_after: Duration,
    },
    /// The resource does not exist or is not shared with the integration.
    #[display("resource not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// The resource exists but is not the type that was requested.
    #[display("resource has the wrong type: {_0}")]
    WrongType(#[error(not(source))] String),
    /// The API token was rejected.
    #[display("unauthorized")]
    Unauthorized,
    /// Connection, timeout or unexpected status code.
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// The response body could not be understood.
    #[display("invalid response: {_0}")]
    InvalidResponse(#[error(not(source))] String),
    /// Input could not be parsed as a resource identifier.
    #[display("invalid resource id: {_0}")]
    InvalidId(#[error(not(source))] String),
    /// The shared cancellation token fired while waiting.
    #[display("cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::Network(_))
    }

    /// Not-found and wrong-type both mean "this ID is not what you asked for".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::WrongType(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exn::ResultExt;

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::NotFound("abc".to_string()).to_string(), "resource not found: abc");
        assert_eq!(
            ErrorKind::Throttled { retry_after: Duration::from_millis(1500) }.to_string(),
            "throttled by upstream (retry after 1500ms)"
        );
        assert_eq!(ErrorKind::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn error_kind_retryable() {
        assert!(ErrorKind::Throttled { retry_after: Duration::from_secs(1) }.is_retryable());
        assert!(ErrorKind::Network("reset".to_string()).is_retryable());
        assert!(!ErrorKind::NotFound("abc".to_string()).is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn error_kind_not_found() {
        assert!(ErrorKind::NotFound("abc".to_string()).is_not_found());
        assert!(ErrorKind::WrongType("abc".to_string()).is_not_found());
        assert!(!ErrorKind::Unauthorized.is_not_found());
    }

    #[test]
    fn error_from_result() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        let err: Result<()> = result.or_raise(|| ErrorKind::Network("reset".to_string()));
        let exn = err.unwrap_err();
        assert_eq!(*exn, ErrorKind::Network("reset".to_string()));
    }
}

//! Error types for metafs
//!
//! This module defines the common error type used throughout the client.

use crate::types::errno;
use thiserror::Error;

/// Common result type for metafs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for metafs
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// MDS returned a non-zero result; the errno code is surfaced verbatim.
    #[error("mds returned errno {0}")]
    Mds(i32),

    #[error("request timed out")]
    Timeout,

    #[error("client is shutting down")]
    ShuttingDown,

    /// A message could not be interpreted. Protocol errors are logged and
    /// dropped at the dispatch layer; they reach a caller only when the
    /// caller's own reply was malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An outbound payload could not be built (for example, the reconnect
    /// record for a cap could not be encoded into the reserved space and
    /// regrowth was exhausted).
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl Error {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Check if this is a stale-handle error from the MDS
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Mds(code) if *code == errno::ESTALE)
    }

    /// Check if this is a not-found error from the MDS
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Mds(code) if *code == errno::ENOENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_stale() {
        assert!(Error::Mds(errno::ESTALE).is_stale());
        assert!(!Error::Mds(errno::EIO).is_stale());
        assert!(!Error::Timeout.is_stale());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::Mds(errno::ENOENT).is_not_found());
        assert!(!Error::Mds(errno::EPERM).is_not_found());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(Error::Mds(5).to_string(), "mds returned errno 5");
        assert_eq!(Error::Timeout.to_string(), "request timed out");
    }
}

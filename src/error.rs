//! Crate error type.
//!
//! Read operations distinguish the transient [`Error::Underflow`] ("not enough
//! data yet, retry on the next data notification") from every other kind,
//! which is fatal for the current operation and surfaces once to the
//! application handler chain.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::runtime::queue::Underflow;
use crate::tls::TlsError;

/// Errors returned by connection and framing operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Not enough data is queued yet. Never closes the connection.
    #[error("buffer underflow: not enough data available")]
    Underflow,

    /// A delimited read exceeded the caller's maximum before the delimiter
    /// was found.
    #[error("max read size of {max} bytes exceeded before delimiter was found")]
    MaxLengthExceeded { max: usize },

    /// The connection is closed.
    #[error("connection closed")]
    Closed,

    /// A blocking operation did not complete in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Text could not be encoded or decoded with the requested encoding.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The operation is not available in the current connection state.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Returns true for conditions that are part of the normal retry protocol.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Underflow)
    }
}

impl From<Underflow> for Error {
    fn from(_: Underflow) -> Self {
        Error::Underflow
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Underflow.is_transient());
        assert!(!Error::MaxLengthExceeded { max: 8 }.is_transient());
        assert!(!Error::Closed.is_transient());
        let underflow = Underflow {
            needed: 4,
            available: 1,
        };
        assert!(Error::from(underflow).is_transient());
    }
}

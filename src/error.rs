//! Error types for htun
//!
//! A single `thiserror` enum covers the carrier, protocol, and lifecycle
//! failures. Read-side errors are sticky: once stored on a connection they
//! are cloned back out of every subsequent operation, so all variants are
//! `Clone`.

use thiserror::Error;

/// Central error type for tunnel operations
#[derive(Error, Debug, Clone)]
pub enum TunnelError {
    // === Lifecycle ===
    #[error("use of closed connection")]
    ClosedConn,

    #[error("accept on closed listener")]
    ListenerClosed,

    #[error("operation timed out")]
    Timeout,

    // === Protocol violations (fatal, sticky) ===
    #[error("invalid frames")]
    InvalidFrames,

    #[error("un-synced counter")]
    UnsyncedCounter,

    #[error("fatal: unmatched stream index")]
    UnmatchedStreamIndex,

    #[error("fatal: missing certain frame")]
    MissingFrame,

    // === Carrier failures ===
    #[error("remote is unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("carrier failure: {0}")]
    Carrier(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl TunnelError {
    /// Whether this error is a deadline expiry.
    ///
    /// Mirrors the standard socket timeout contract: a timed-out read may be
    /// retried after pushing the deadline forward.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TunnelError::Timeout)
    }

    /// Timeouts are terminal for the blocked call, never transient.
    pub fn is_temporary(&self) -> bool {
        false
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(err: std::io::Error) -> Self {
        TunnelError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for TunnelError {
    fn from(err: reqwest::Error) -> Self {
        TunnelError::Carrier(err.to_string())
    }
}

/// Result type alias using TunnelError
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_contract() {
        let err = TunnelError::Timeout;
        assert!(err.is_timeout());
        assert!(!err.is_temporary());
        assert!(!TunnelError::ClosedConn.is_timeout());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            TunnelError::ClosedConn.to_string(),
            "use of closed connection"
        );
        assert!(TunnelError::RemoteUnavailable("503".into())
            .to_string()
            .contains("503"));
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: TunnelError = io_err.into();
        assert!(matches!(err, TunnelError::Io(_)));
    }
}

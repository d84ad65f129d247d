//! Error types for the mount bridge.

use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Bridge error types.
///
/// Per-request failures never surface here: the dispatcher converts them into
/// SFTP status replies. This enum covers the failures that end or prevent a
/// session — transport loss, a dead mount helper, bad configuration.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SFTP protocol violation on the wire
    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    /// Secure channel failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Remote mount helper failed to start or died irrecoverably
    #[error("Mount helper error: {0}")]
    Helper(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a protocol error with context
    pub fn protocol(context: impl Into<String>) -> Self {
        Error::Protocol(context.into())
    }

    /// Create a connection error with context
    pub fn connection(context: impl Into<String>) -> Self {
        Error::Connection(context.into())
    }

    /// Create a mount helper error with context
    pub fn helper(context: impl Into<String>) -> Self {
        Error::Helper(context.into())
    }

    /// Check if error is recoverable by restarting the helper session
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Helper(_))
    }
}

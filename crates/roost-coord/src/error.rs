//! Error types for the coordination layer.

use thiserror::Error;

/// Result type alias for coordination operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors from the coordination client and embedded server.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The session could not be established within the configured timeout.
    #[error("could not establish session to {target}: {detail}")]
    Connection { target: String, detail: String },

    /// The embedded server's port is already in use.
    #[error("address already in use: {0}")]
    Bind(String),

    /// The server configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A malformed or unexpected frame, or a request that timed out.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session was closed or lost while a request was in flight.
    #[error("session closed")]
    SessionClosed,

    /// The server rejected a namespace operation (bad path, missing
    /// parent, auth failure, ...).
    #[error("request rejected: {0}")]
    Remote(String),

    /// Snapshot or transaction-log storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

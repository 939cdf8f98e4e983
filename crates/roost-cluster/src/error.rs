//! Error types for the membership layer.

use roost_coord::CoordError;
use thiserror::Error;

/// Result type alias for membership operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors surfaced by [`crate::ClusterMembership`].
#[derive(Debug, Error)]
pub enum ClusterError {
    /// `join()` was called while a session already exists.
    #[error("already joined; call leave() first")]
    AlreadyJoined,

    /// The operation requires a joined session.
    #[error("not joined")]
    NotJoined,

    /// The embedded coordination server could not start.
    #[error("embedded server failed to start: {0}")]
    Server(#[source] CoordError),

    /// The coordination session could not be established.
    #[error("connection failed: {0}")]
    Connection(#[source] CoordError),

    /// The membership record could not be created.
    #[error("registration failed: {0}")]
    Registration(#[source] CoordError),

    /// The membership watcher could not start.
    #[error("watcher failed to start: {0}")]
    Watch(#[source] CoordError),

    /// A settings record could not be bound from configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

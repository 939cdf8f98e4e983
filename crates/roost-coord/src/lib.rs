//! roost-coord: the coordination layer for Roost.
//!
//! Provides the session client ([`CoordClient`]) and an embeddable
//! single-node coordination server ([`EmbeddedServer`]) speaking a small
//! newline-delimited JSON protocol. The service offers exactly the
//! primitives membership needs: atomic node creation with server-assigned
//! sequence numbers, session-scoped ephemeral nodes, and child-change
//! notifications.
//!
//! # Architecture
//!
//! ```text
//! CoordClient (one session)
//!   ├── writer task   → request frames
//!   ├── reader task   ← replies (by id) + unsolicited child events
//!   └── ping task     → keep-alive at a third of the session timeout
//!
//! EmbeddedServer (standalone / test deployments)
//!   ├── accept task   → one task per connection
//!   ├── sweeper task  → expires idle sessions each tick
//!   └── namespace tree (ephemerals, sequences, watches) + snapshot storage
//! ```

pub mod client;
pub mod error;
pub mod proto;
pub mod server;

pub use client::{ClientConfig, CoordClient};
pub use error::{CoordError, CoordResult};
pub use proto::{ChildEvent, ChildEventKind};
pub use server::{EmbeddedServer, ServerConfig};

/// Lock a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

//! roost-cluster: membership tracking over the Roost coordination layer.
//!
//! Each process registers itself as a uniquely identified, ephemeral
//! participant and observes its peers through a locally cached,
//! watch-driven view.
//!
//! # Architecture
//!
//! ```text
//! ClusterMembership (facade)
//!   ├── EmbeddedServer (optional, standalone/test deployments)
//!   ├── CoordClient (session to the coordination service)
//!   ├── registrar  → one ephemeral sequential node per live process
//!   └── MembershipWatcher
//!       ├── initial synchronous fetch, then child-change notifications
//!       ├── immutable snapshots, swapped on every change
//!       └── listener callbacks (Added / Removed)
//! ```
//!
//! Ids are the node names under the membership path with the path prefix
//! stripped; uniqueness comes from the service's atomic sequence
//! assignment, not from client-side coordination.

pub mod config;
pub mod error;
pub mod member;
pub mod membership;
pub mod registrar;
pub mod watcher;

pub use config::{ClusterConfig, DEFAULT_MEMBERSHIP_PATH};
pub use error::{ClusterError, ClusterResult};
pub use member::{MemberEvent, MemberRecord, MembershipListener};
pub use membership::ClusterMembership;
pub use watcher::MembershipWatcher;

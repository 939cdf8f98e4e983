//! Watch-driven cache of the current membership set.
//!
//! The watcher owns the authoritative in-memory view and publishes an
//! immutable snapshot on every change (replace-on-write), so reads never
//! block and never observe a partially-updated set. The view is eventually
//! consistent with the service's true child set; it may lag by the
//! notification-delivery latency.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use roost_coord::{ChildEventKind, CoordClient, CoordResult};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::member::{MemberEvent, MemberRecord, MembershipListener};

/// Shared, swappable listener registration.
pub(crate) type ListenerSlot = Arc<RwLock<Option<Arc<dyn MembershipListener>>>>;

/// Live view of all current membership records under one path.
pub struct MembershipWatcher {
    view: Arc<RwLock<Arc<Vec<MemberRecord>>>>,
    task: JoinHandle<()>,
}

impl MembershipWatcher {
    /// Subscribe to child changes and build the initial view before
    /// returning, so the first [`snapshot`](Self::snapshot) reflects a
    /// complete picture rather than an empty one racing with the first
    /// notifications.
    ///
    /// The subscription is registered before the initial fetch; a change
    /// that lands in between is deduplicated, not lost.
    pub(crate) async fn start(
        client: &CoordClient,
        membership_path: &str,
        listener: ListenerSlot,
    ) -> CoordResult<MembershipWatcher> {
        client.ensure(membership_path).await?;
        let mut events = client.watch(membership_path).await?;

        let mut members: BTreeMap<String, MemberRecord> = BTreeMap::new();
        for path in client.children(membership_path).await? {
            let record = MemberRecord::from_path(membership_path, &path);
            members.insert(path, record);
        }
        let view = Arc::new(RwLock::new(Arc::new(ordered(&members))));
        debug!(
            path = %membership_path,
            members = members.len(),
            "membership watcher started"
        );

        let task_view = view.clone();
        let membership_path = membership_path.to_string();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let record = MemberRecord::from_path(&membership_path, &event.path);
                let (kind, changed) = match event.kind {
                    ChildEventKind::ChildAdded => (
                        MemberEvent::Added,
                        members.insert(event.path.clone(), record.clone()).is_none(),
                    ),
                    ChildEventKind::ChildRemoved => {
                        (MemberEvent::Removed, members.remove(&event.path).is_some())
                    }
                };
                if !changed {
                    continue;
                }
                *write(&task_view) = Arc::new(ordered(&members));
                debug!(id = %record.id, ?kind, "membership changed");

                let callback = read(&listener).clone();
                if let Some(callback) = callback {
                    callback.on_member(kind, &record.id);
                }
            }
            // Not an error: callers needing strict freshness must poll.
            warn!("membership event stream ended; view may be stale");
        });

        Ok(MembershipWatcher { view, task })
    }

    /// The current membership set, ordered by sequence. A non-blocking
    /// point-in-time read; changes after the call are not reflected.
    pub fn snapshot(&self) -> Arc<Vec<MemberRecord>> {
        read(&self.view).clone()
    }

    /// Cancel the subscription. Other sessions' records are unaffected.
    pub fn close(&self) {
        self.task.abort();
    }
}

/// Records in sequence order. Keys are full paths, whose zero-padded
/// sequence suffix makes lexicographic order match numeric order.
fn ordered(members: &BTreeMap<String, MemberRecord>) -> Vec<MemberRecord> {
    members.values().cloned().collect()
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

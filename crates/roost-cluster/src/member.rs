//! Membership records and the listener seam.

/// One live participant, as derived from its coordination-service node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    /// The node's name with the membership-path prefix removed. Uniqueness
    /// is guaranteed by the service's atomic sequence assignment.
    pub id: String,
    /// Sequence number assigned by the coordination service.
    pub sequence: u64,
    /// Full coordination-service path.
    pub path: String,
}

impl MemberRecord {
    /// Derive a record from a full node path.
    ///
    /// When `path` does not actually start with `membership_path` plus the
    /// separator, `id` is left equal to the untouched full path: a
    /// detectable degraded case, not a failure.
    pub fn from_path(membership_path: &str, path: &str) -> Self {
        let prefix = format!("{membership_path}/");
        let id = match path.strip_prefix(&prefix) {
            Some(stripped) => stripped.to_string(),
            None => path.to_string(),
        };
        let sequence = id.parse::<u64>().unwrap_or(0);
        Self {
            id,
            sequence,
            path: path.to_string(),
        }
    }
}

/// Kind of a membership change delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEvent {
    Added,
    Removed,
}

/// Callback interface for membership changes.
///
/// Invoked on the watcher's notification-delivery path: keep
/// implementations short and offload long work to another task, or
/// subsequent notifications are delayed.
pub trait MembershipListener: Send + Sync {
    fn on_member(&self, event: MemberEvent, id: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_strips_the_membership_prefix() {
        let record = MemberRecord::from_path("/app/nodes", "/app/nodes/0000000001");
        assert_eq!(record.id, "0000000001");
        assert_eq!(record.sequence, 1);
        assert_eq!(record.path, "/app/nodes/0000000001");
    }

    #[test]
    fn mismatched_prefix_degrades_to_the_full_path() {
        let record = MemberRecord::from_path("/other/root", "/app/nodes/0000000001");
        assert_eq!(record.id, "/app/nodes/0000000001");
        assert_eq!(record.sequence, 0);
    }

    #[test]
    fn non_numeric_names_get_sequence_zero() {
        let record = MemberRecord::from_path("/app/nodes", "/app/nodes/not-a-number");
        assert_eq!(record.id, "not-a-number");
        assert_eq!(record.sequence, 0);
    }
}

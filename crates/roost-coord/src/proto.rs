//! Wire protocol for the coordination service.
//!
//! Frames are newline-delimited JSON. The client sends [`Request`]s and
//! receives [`ServerFrame`]s; replies are correlated by request id, while
//! child-change events arrive unsolicited on the same connection.

use serde::{Deserialize, Serialize};

/// Width of the zero-padded sequence suffix assigned to sequential nodes.
pub const SEQ_WIDTH: usize = 10;

/// Fixed username for the digest credential scheme. Only the password is
/// configurable.
pub const DIGEST_USER: &str = "roost";

/// A client request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub op: Op,
}

/// Operations a session may perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    /// Session handshake. Must be the first request on a connection; the
    /// server clamps the requested timeout into its configured bounds.
    Hello { session_timeout_ms: u64 },
    /// Digest-style credential. The username is fixed ([`DIGEST_USER`]),
    /// only the password travels.
    Auth { secret: String },
    /// Create `path` and any missing ancestors as persistent nodes.
    /// Idempotent.
    Ensure { path: String },
    /// Atomically create one sequentially-numbered child of `parent`.
    CreateSeq { parent: String, ephemeral: bool },
    /// Remove a childless node.
    Delete { path: String },
    /// Full paths of the current children of `path`, sorted.
    Children { path: String },
    /// Subscribe this session to child-change events under `path`.
    Watch { path: String },
    /// Keep-alive; refreshes the session's last-activity time.
    Ping,
}

/// A server-to-client frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Reply { id: u64, result: OpResult },
    Event { kind: ChildEventKind, path: String },
}

/// The result carried in a reply frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpResult {
    /// Granted session, with the timeout actually in effect.
    Session { session_id: u64, timeout_ms: u64 },
    /// Full path of a node created by `CreateSeq`.
    Created { path: String },
    Children { paths: Vec<String> },
    Ok,
    Error { message: String },
}

/// Kind of a child-change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildEventKind {
    ChildAdded,
    ChildRemoved,
}

/// A child-change notification as delivered to watch subscribers.
#[derive(Debug, Clone)]
pub struct ChildEvent {
    pub kind: ChildEventKind,
    /// Full path of the child that was added or removed.
    pub path: String,
}

/// Format the child name for sequence number `seq`.
pub fn sequence_name(seq: u64) -> String {
    format!("{seq:0width$}", width = SEQ_WIDTH)
}

/// Parent of `path`, or `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// Join a parent path and a child name.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// A valid path is absolute, has no empty segments, and no trailing slash
/// (except the root itself).
pub fn is_valid_path(path: &str) -> bool {
    path == "/"
        || (path.starts_with('/') && !path.ends_with('/') && !path.contains("//"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_names_are_zero_padded() {
        assert_eq!(sequence_name(1), "0000000001");
        assert_eq!(sequence_name(42), "0000000042");
        assert_eq!(sequence_name(9_999_999_999), "9999999999");
    }

    #[test]
    fn parent_of_nested_path() {
        assert_eq!(parent("/a/b/c"), Some("/a/b"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
    }

    #[test]
    fn join_handles_root() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }

    #[test]
    fn path_validation() {
        assert!(is_valid_path("/"));
        assert!(is_valid_path("/roost/nodes"));
        assert!(!is_valid_path("roost/nodes"));
        assert!(!is_valid_path("/roost/"));
        assert!(!is_valid_path("/roost//nodes"));
        assert!(!is_valid_path(""));
    }

    #[test]
    fn frames_round_trip_as_json() {
        let req = Request {
            id: 7,
            op: Op::CreateSeq {
                parent: "/roost/nodes".to_string(),
                ephemeral: true,
            },
        };
        let line = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(back.id, 7);
        match back.op {
            Op::CreateSeq { parent, ephemeral } => {
                assert_eq!(parent, "/roost/nodes");
                assert!(ephemeral);
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }
}

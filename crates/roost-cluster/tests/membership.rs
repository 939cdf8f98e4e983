//! End-to-end membership tests: multiple facades against one shared
//! coordination server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use roost_coord::{ClientConfig, EmbeddedServer, ServerConfig};
use roost_cluster::{
    ClusterConfig, ClusterError, ClusterMembership, MemberEvent, MembershipListener,
};

fn server_config(dir: &tempfile::TempDir) -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1".to_string(),
        port: 0,
        tick_ms: 50,
        data_dir: dir.path().join("data"),
        log_dir: dir.path().join("log"),
        ..ServerConfig::default()
    }
}

/// Start a coordination server shared by the facades under test.
async fn shared_server(dir: &tempfile::TempDir) -> (EmbeddedServer, String) {
    let server = EmbeddedServer::start(&server_config(dir)).await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    (server, addr)
}

fn member_config(addr: &str) -> ClusterConfig {
    ClusterConfig {
        membership_path: "/app/nodes".to_string(),
        server: None,
        client: ClientConfig {
            connect_string: addr.to_string(),
            timeout_ms: 5_000,
            session_timeout_ms: 2_000,
            ..ClientConfig::default()
        },
    }
}

async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Collects listener callbacks for later assertions.
#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<(MemberEvent, String)>>,
}

impl RecordingListener {
    fn contains(&self, event: MemberEvent, id: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|(e, i)| *e == event && i == id)
    }
}

impl MembershipListener for RecordingListener {
    fn on_member(&self, event: MemberEvent, id: &str) {
        self.events.lock().unwrap().push((event, id.to_string()));
    }
}

#[tokio::test]
async fn nodes_appear_in_each_others_view() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = shared_server(&dir).await;

    let mut a = ClusterMembership::new(member_config(&addr));
    a.join().await.unwrap();
    let id_a = a.node_id().unwrap().to_string();

    let mut b = ClusterMembership::new(member_config(&addr));
    b.join().await.unwrap();
    let id_b = b.node_id().unwrap().to_string();

    assert_ne!(id_a, id_b, "ids must be unique");

    eventually("both members in a's view", || {
        let nodes = a.nodes();
        nodes.contains(&id_a) && nodes.contains(&id_b)
    })
    .await;
    eventually("both members in b's view", || b.nodes().len() == 2).await;

    b.leave().await.unwrap();
    eventually("b gone from a's view", || a.nodes() == vec![id_a.clone()]).await;

    a.leave().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn ids_are_bare_sequence_names() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = shared_server(&dir).await;

    let mut a = ClusterMembership::new(member_config(&addr));
    a.join().await.unwrap();

    let record = a.local_record().unwrap();
    // The id is the path with the membership prefix stripped.
    assert_eq!(record.path, format!("/app/nodes/{}", record.id));
    assert!(
        record.id.chars().all(|c| c.is_ascii_digit()),
        "id should be a bare sequence name, got {}",
        record.id
    );
    assert!(record.sequence > 0);

    a.leave().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn consecutive_snapshots_are_identical_without_changes() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = shared_server(&dir).await;

    let mut a = ClusterMembership::new(member_config(&addr));
    a.join().await.unwrap();
    eventually("self visible", || !a.nodes().is_empty()).await;

    let first = a.nodes();
    let second = a.nodes();
    assert_eq!(first, second);

    a.leave().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn join_while_joined_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = shared_server(&dir).await;

    let mut a = ClusterMembership::new(member_config(&addr));
    a.join().await.unwrap();
    assert!(matches!(a.join().await, Err(ClusterError::AlreadyJoined)));
    // The original session is untouched.
    assert!(a.is_joined());

    a.leave().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn rejoining_yields_a_fresh_id() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = shared_server(&dir).await;

    let mut a = ClusterMembership::new(member_config(&addr));
    a.join().await.unwrap();
    let first = a.node_id().unwrap().to_string();
    a.leave().await.unwrap();
    assert!(a.node_id().is_none());

    a.join().await.unwrap();
    let second = a.node_id().unwrap().to_string();
    assert_ne!(first, second);

    a.leave().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn listener_sees_adds_and_removes_in_the_right_direction() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = shared_server(&dir).await;

    let mut a = ClusterMembership::new(member_config(&addr));
    let listener = Arc::new(RecordingListener::default());
    a.set_listener(listener.clone());
    a.join().await.unwrap();

    let mut b = ClusterMembership::new(member_config(&addr));
    b.join().await.unwrap();
    let id_b = b.node_id().unwrap().to_string();

    eventually("added callback for b", || {
        listener.contains(MemberEvent::Added, &id_b)
    })
    .await;

    b.leave().await.unwrap();
    eventually("removed callback for b", || {
        listener.contains(MemberEvent::Removed, &id_b)
    })
    .await;

    a.leave().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn facade_can_own_its_embedded_server() {
    let dir = tempfile::tempdir().unwrap();
    let config = ClusterConfig {
        membership_path: "/app/nodes".to_string(),
        server: Some(server_config(&dir)),
        client: ClientConfig {
            // Empty: connect to the server the facade starts.
            connect_string: String::new(),
            timeout_ms: 5_000,
            session_timeout_ms: 2_000,
            ..ClientConfig::default()
        },
    };

    let mut a = ClusterMembership::new(config);
    a.join().await.unwrap();
    let id = a.node_id().unwrap().to_string();
    eventually("self visible", || a.nodes() == vec![id.clone()]).await;
    a.leave().await.unwrap();
    assert!(!a.is_joined());
}

#[tokio::test]
async fn bind_conflict_tolerance_lets_a_second_process_proceed() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = shared_server(&dir).await;
    let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();

    // This facade tries to start its own server on the occupied port but
    // tolerates the conflict and joins through the existing one.
    let dir2 = tempfile::tempdir().unwrap();
    let config = ClusterConfig {
        membership_path: "/app/nodes".to_string(),
        server: Some(ServerConfig {
            port,
            ignore_bind_conflict: true,
            ..server_config(&dir2)
        }),
        client: member_config(&addr).client,
    };

    let mut b = ClusterMembership::new(config);
    b.join().await.unwrap();
    assert!(b.node_id().is_some());

    b.leave().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn inert_server_with_no_connect_string_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = shared_server(&dir).await;
    let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();

    // The owned server loses the bind and yields an inert handle, and the
    // empty connect string leaves no address to fall back to.
    let dir2 = tempfile::tempdir().unwrap();
    let config = ClusterConfig {
        membership_path: "/app/nodes".to_string(),
        server: Some(ServerConfig {
            port,
            ignore_bind_conflict: true,
            ..server_config(&dir2)
        }),
        client: ClientConfig {
            connect_string: String::new(),
            ..ClientConfig::default()
        },
    };

    let mut b = ClusterMembership::new(config);
    assert!(matches!(b.join().await, Err(ClusterError::Config(_))));
    assert!(!b.is_joined());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn leave_is_best_effort_when_the_server_is_already_gone() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = shared_server(&dir).await;

    let mut a = ClusterMembership::new(member_config(&addr));
    a.join().await.unwrap();

    // Pull the coordination service out from under the session.
    server.stop().await.unwrap();

    // Teardown still completes and reports success.
    a.leave().await.unwrap();
    assert!(!a.is_joined());
}

#[tokio::test]
async fn join_failure_leaves_nothing_running() {
    // Nothing listens on this address, so the connect phase fails.
    let config = ClusterConfig {
        membership_path: "/app/nodes".to_string(),
        server: None,
        client: ClientConfig {
            connect_string: "127.0.0.1:1".to_string(),
            timeout_ms: 200,
            retry_max: 2,
            ..ClientConfig::default()
        },
    };

    let mut a = ClusterMembership::new(config);
    let result = a.join().await;
    assert!(matches!(result, Err(ClusterError::Connection(_))));
    assert!(!a.is_joined());
    assert!(a.node_id().is_none());

    // A later join attempt starts from a clean slate.
    assert!(matches!(
        a.join().await,
        Err(ClusterError::Connection(_))
    ));
}

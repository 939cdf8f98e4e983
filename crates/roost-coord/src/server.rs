//! Embeddable single-node coordination server.
//!
//! Hosts the coordination namespace in-process for standalone or test
//! deployments where no external ensemble is available. The namespace is a
//! tree of nodes; sequential children get a zero-padded per-parent counter,
//! ephemeral nodes live exactly as long as the owning session, and watch
//! subscribers are notified of child-set changes.
//!
//! Persistent nodes are written to a JSON snapshot in `data_dir` on clean
//! shutdown and reloaded on the next start. Ephemeral nodes are never
//! persisted.

use std::collections::{BTreeSet, HashMap};
use std::io::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CoordError, CoordResult};
use crate::lock;
use crate::proto::{self, ChildEventKind, Op, OpResult, Request, ServerFrame};

/// Bounded wait for in-flight teardown phases during `stop()`.
const QUIESCE_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for the embedded coordination server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to accept client connections on.
    pub bind_addr: String,
    pub port: u16,
    /// Tick interval driving the session-expiry sweep.
    pub tick_ms: u64,
    /// Lower bound on granted session timeouts; 0 means "unset" and
    /// defaults to twice the tick interval.
    pub min_session_timeout_ms: u64,
    /// Upper bound on granted session timeouts; 0 means "unset" and
    /// defaults to twenty times the tick interval.
    pub max_session_timeout_ms: u64,
    /// Directory for snapshot data. Created if absent.
    pub data_dir: PathBuf,
    /// Directory for the transaction log. Created if absent.
    pub log_dir: PathBuf,
    /// Recursively delete prior storage contents before starting.
    pub purge: bool,
    /// Treat a bind conflict as evidence that a peer process already runs
    /// an equivalent server on this port, instead of failing.
    pub ignore_bind_conflict: bool,
    /// Digest password clients must present; empty disables auth.
    pub secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 2181,
            tick_ms: 3000,
            min_session_timeout_ms: 0,
            max_session_timeout_ms: 0,
            data_dir: PathBuf::from("roost/data"),
            log_dir: PathBuf::from("roost/log"),
            purge: false,
            ignore_bind_conflict: false,
            secret: String::new(),
        }
    }
}

impl ServerConfig {
    fn min_session_timeout(&self) -> u64 {
        if self.min_session_timeout_ms == 0 {
            self.tick_ms * 2
        } else {
            self.min_session_timeout_ms
        }
    }

    fn max_session_timeout(&self) -> u64 {
        if self.max_session_timeout_ms == 0 {
            self.tick_ms * 20
        } else {
            self.max_session_timeout_ms
        }
    }
}

// ── Namespace tree ───────────────────────────────────────────────────

type EventSink = mpsc::UnboundedSender<ServerFrame>;

#[derive(Debug)]
struct NodeEntry {
    /// Owning session for ephemeral nodes; `None` for persistent ones.
    owner: Option<u64>,
    /// Counter for naming this node's sequential children.
    next_seq: u64,
}

/// The in-memory namespace. Mutated only under the server's tree lock.
#[derive(Default)]
struct Tree {
    nodes: HashMap<String, NodeEntry>,
    children: HashMap<String, BTreeSet<String>>,
    watchers: HashMap<String, Vec<(u64, EventSink)>>,
}

impl Tree {
    fn new() -> Self {
        let mut tree = Self::default();
        tree.nodes.insert(
            "/".to_string(),
            NodeEntry {
                owner: None,
                next_seq: 1,
            },
        );
        tree
    }

    /// Create `path` and any missing ancestors as persistent nodes.
    fn ensure(&mut self, path: &str) -> Result<(), String> {
        if !proto::is_valid_path(path) {
            return Err(format!("invalid path: {path}"));
        }
        if path == "/" {
            return Ok(());
        }
        let mut cur = String::new();
        for seg in path.trim_start_matches('/').split('/') {
            cur.push('/');
            cur.push_str(seg);
            if !self.nodes.contains_key(cur.as_str()) {
                self.insert_node(cur.clone(), None);
            }
        }
        Ok(())
    }

    /// Atomically create one sequentially-numbered child of `parent`.
    fn create_seq(
        &mut self,
        parent: &str,
        ephemeral: bool,
        session: u64,
    ) -> Result<String, String> {
        if !proto::is_valid_path(parent) {
            return Err(format!("invalid path: {parent}"));
        }
        let entry = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| format!("no such node: {parent}"))?;
        let seq = entry.next_seq;
        entry.next_seq += 1;
        let path = proto::join(parent, &proto::sequence_name(seq));
        self.insert_node(path.clone(), ephemeral.then_some(session));
        Ok(path)
    }

    /// Remove a childless node.
    fn delete(&mut self, path: &str) -> Result<(), String> {
        if !self.nodes.contains_key(path) {
            return Err(format!("no such node: {path}"));
        }
        if self.children.get(path).is_some_and(|c| !c.is_empty()) {
            return Err(format!("node not empty: {path}"));
        }
        self.nodes.remove(path);
        self.children.remove(path);
        self.watchers.remove(path);
        if let Some(parent) = proto::parent(path) {
            let parent = parent.to_string();
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.remove(path);
            }
            self.notify(&parent, ChildEventKind::ChildRemoved, path);
        }
        Ok(())
    }

    /// Full paths of the current children of `path`, sorted.
    fn children(&self, path: &str) -> Result<Vec<String>, String> {
        if !self.nodes.contains_key(path) {
            return Err(format!("no such node: {path}"));
        }
        Ok(self
            .children
            .get(path)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Subscribe `session` to child-change events under `path`.
    fn watch(&mut self, path: &str, session: u64, sink: EventSink) -> Result<(), String> {
        if !self.nodes.contains_key(path) {
            return Err(format!("no such node: {path}"));
        }
        self.watchers
            .entry(path.to_string())
            .or_default()
            .push((session, sink));
        Ok(())
    }

    /// Drop everything owned by `session`: its ephemeral nodes (with
    /// child-removed notifications) and its watch registrations.
    fn session_close(&mut self, session: u64) {
        let ephemerals: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, e)| e.owner == Some(session))
            .map(|(p, _)| p.clone())
            .collect();
        for path in ephemerals {
            if let Err(e) = self.delete(&path) {
                warn!(%path, error = %e, "could not remove ephemeral node");
            }
        }
        for subs in self.watchers.values_mut() {
            subs.retain(|(s, _)| *s != session);
        }
    }

    fn insert_node(&mut self, path: String, owner: Option<u64>) {
        // Caller guarantees the parent exists.
        let parent = proto::parent(&path).unwrap_or("/").to_string();
        self.nodes.insert(
            path.clone(),
            NodeEntry {
                owner,
                next_seq: 1,
            },
        );
        self.children
            .entry(parent.clone())
            .or_default()
            .insert(path.clone());
        self.notify(&parent, ChildEventKind::ChildAdded, &path);
    }

    fn notify(&mut self, parent: &str, kind: ChildEventKind, path: &str) {
        if let Some(subs) = self.watchers.get_mut(parent) {
            subs.retain(|(_, sink)| {
                sink.send(ServerFrame::Event {
                    kind,
                    path: path.to_string(),
                })
                .is_ok()
            });
        }
    }

    /// Persistent subtree, for snapshotting. Sorted so parents precede
    /// children on restore.
    fn snapshot(&self) -> Snapshot {
        let mut nodes: Vec<SnapNode> = self
            .nodes
            .iter()
            .filter(|(_, e)| e.owner.is_none())
            .map(|(path, e)| SnapNode {
                path: path.clone(),
                next_seq: e.next_seq,
            })
            .collect();
        nodes.sort_by(|a, b| a.path.cmp(&b.path));
        Snapshot { nodes }
    }

    fn restore(&mut self, snap: &Snapshot) {
        for node in &snap.nodes {
            if node.path == "/" {
                if let Some(root) = self.nodes.get_mut("/") {
                    root.next_seq = node.next_seq;
                }
                continue;
            }
            let parent = proto::parent(&node.path).unwrap_or("/").to_string();
            self.nodes.insert(
                node.path.clone(),
                NodeEntry {
                    owner: None,
                    next_seq: node.next_seq,
                },
            );
            self.children
                .entry(parent)
                .or_default()
                .insert(node.path.clone());
        }
    }
}

// ── Storage ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    nodes: Vec<SnapNode>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapNode {
    path: String,
    next_seq: u64,
}

#[derive(Debug, Serialize)]
struct TxnRecord<'a> {
    op: &'a str,
    path: &'a str,
}

/// On-disk storage: snapshot file in `data_dir`, append-only transaction
/// log in `log_dir`.
struct Storage {
    snapshot_path: PathBuf,
    log: Mutex<std::fs::File>,
}

impl Storage {
    fn prepare(cfg: &ServerConfig) -> CoordResult<Self> {
        if cfg.purge {
            purge_dir(&cfg.data_dir)?;
            purge_dir(&cfg.log_dir)?;
        }
        std::fs::create_dir_all(&cfg.data_dir)?;
        std::fs::create_dir_all(&cfg.log_dir)?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(cfg.log_dir.join("txn.log"))?;
        Ok(Self {
            snapshot_path: cfg.data_dir.join("snapshot.json"),
            log: Mutex::new(log),
        })
    }

    fn load(&self) -> CoordResult<Option<Snapshot>> {
        match std::fs::read(&self.snapshot_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CoordError::Storage(format!("corrupt snapshot: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, snap: &Snapshot) -> CoordResult<()> {
        let bytes = serde_json::to_vec_pretty(snap)
            .map_err(|e| CoordError::Storage(e.to_string()))?;
        std::fs::write(&self.snapshot_path, bytes)?;
        Ok(())
    }

    /// Best effort: a failed log append is reported but does not fail the
    /// operation it records.
    fn append(&self, op: &str, path: &str) {
        let record = TxnRecord { op, path };
        let Ok(line) = serde_json::to_string(&record) else {
            return;
        };
        let mut file = lock(&self.log);
        if let Err(e) = writeln!(file, "{line}") {
            warn!(error = %e, "txn log append failed");
        }
    }
}

/// Recursively delete the contents of `dir`, keeping the directory itself.
fn purge_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

// ── Server ───────────────────────────────────────────────────────────

struct SessionState {
    last_seen: Instant,
    timeout: Duration,
}

struct Shared {
    cfg: ServerConfig,
    tree: Mutex<Tree>,
    sessions: Mutex<HashMap<u64, SessionState>>,
    storage: Storage,
    next_session: AtomicU64,
}

/// A running (or deliberately inert, see `ignore_bind_conflict`) embedded
/// coordination server.
pub struct EmbeddedServer {
    inner: Option<Inner>,
}

struct Inner {
    shared: Arc<Shared>,
    addr: SocketAddr,
    accept: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    conns: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl EmbeddedServer {
    /// Prepare storage, restore any snapshot, and begin accepting client
    /// connections.
    ///
    /// On a bind conflict with `ignore_bind_conflict` set, logs a warning
    /// and returns an inert handle: the caller proceeds as if satisfied and
    /// `stop()` is a no-op.
    pub async fn start(cfg: &ServerConfig) -> CoordResult<EmbeddedServer> {
        let (min, max) = (cfg.min_session_timeout(), cfg.max_session_timeout());
        if min > max {
            return Err(CoordError::Config(format!(
                "min session timeout {min}ms exceeds max {max}ms"
            )));
        }
        let bind = format!("{}:{}", cfg.bind_addr, cfg.port);
        let listener = match TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if cfg.ignore_bind_conflict {
                    warn!(
                        addr = %bind,
                        "port already bound, assuming a peer process runs the coordination server"
                    );
                    return Ok(EmbeddedServer { inner: None });
                }
                return Err(CoordError::Bind(bind));
            }
            Err(e) => return Err(e.into()),
        };
        let addr = listener.local_addr()?;

        let storage = Storage::prepare(cfg)?;
        let mut tree = Tree::new();
        if let Some(snap) = storage.load()? {
            info!(nodes = snap.nodes.len(), "restored namespace snapshot");
            tree.restore(&snap);
        }

        let shared = Arc::new(Shared {
            cfg: cfg.clone(),
            tree: Mutex::new(tree),
            sessions: Mutex::new(HashMap::new()),
            storage,
            next_session: AtomicU64::new(1),
        });

        let conns: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_shared = shared.clone();
        let accept_conns = conns.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "client connected");
                        let conn_shared = accept_shared.clone();
                        let handle =
                            tokio::spawn(async move { serve_conn(stream, conn_shared).await });
                        let mut conns = lock(&accept_conns);
                        conns.retain(|h| !h.is_finished());
                        conns.push(handle);
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });

        let sweep_shared = shared.clone();
        let tick = Duration::from_millis(cfg.tick_ms.max(1));
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                expire_sessions(&sweep_shared);
            }
        });

        info!(%addr, "embedded coordination server started");
        Ok(EmbeddedServer {
            inner: Some(Inner {
                shared,
                addr,
                accept,
                sweeper,
                conns,
            }),
        })
    }

    /// Whether this handle actually bound the port (false after a tolerated
    /// bind conflict, or after `stop()`).
    pub fn is_bound(&self) -> bool {
        self.inner.is_some()
    }

    /// The bound address, useful when configured with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.as_ref().map(|inner| inner.addr)
    }

    /// Shut down: stop accepting, wait (bounded) for the acceptor to
    /// quiesce, terminate connections, then write the snapshot. Each phase
    /// proceeds even if an earlier one could not fully complete. Idempotent.
    pub async fn stop(&mut self) -> CoordResult<()> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };

        inner.sweeper.abort();
        inner.accept.abort();
        let _ = tokio::time::timeout(QUIESCE_TIMEOUT, inner.accept).await;

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&inner.conns));
        for handle in &handles {
            handle.abort();
        }

        let snap = lock(&inner.shared.tree).snapshot();
        let result = inner.shared.storage.save(&snap);
        if let Err(e) = &result {
            warn!(error = %e, "snapshot write failed during shutdown");
        }
        info!(addr = %inner.addr, "embedded coordination server stopped");
        result
    }
}

fn expire_sessions(shared: &Arc<Shared>) {
    let now = Instant::now();
    let expired: Vec<u64> = lock(&shared.sessions)
        .iter()
        .filter(|(_, s)| now.duration_since(s.last_seen) > s.timeout)
        .map(|(id, _)| *id)
        .collect();
    for sid in expired {
        warn!(session = sid, "session expired");
        end_session(shared, sid);
    }
}

fn end_session(shared: &Arc<Shared>, session: u64) {
    lock(&shared.sessions).remove(&session);
    lock(&shared.tree).session_close(session);
}

async fn serve_conn(stream: TcpStream, shared: Arc<Shared>) {
    let peer = stream.peer_addr().ok();
    let (read_half, mut write_half) = stream.into_split();

    let (sink, mut outbound) = mpsc::unbounded_channel::<ServerFrame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let Ok(mut line) = serde_json::to_string(&frame) else {
                continue;
            };
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut session: Option<u64> = None;
    let mut authed = shared.cfg.secret.is_empty();
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "dropping malformed frame");
                continue;
            }
        };
        let result = handle_request(&shared, &sink, &mut session, &mut authed, request.op);
        if sink
            .send(ServerFrame::Reply {
                id: request.id,
                result,
            })
            .is_err()
        {
            break;
        }
    }

    if let Some(sid) = session {
        end_session(&shared, sid);
    }
    drop(sink);
    let _ = writer.await;
    debug!(?peer, "connection closed");
}

fn handle_request(
    shared: &Arc<Shared>,
    sink: &EventSink,
    session: &mut Option<u64>,
    authed: &mut bool,
    op: Op,
) -> OpResult {
    if let Some(sid) = *session {
        match lock(&shared.sessions).get_mut(&sid) {
            Some(state) => state.last_seen = Instant::now(),
            None => return err("session expired"),
        }
    }

    match op {
        Op::Hello { session_timeout_ms } => {
            if session.is_some() {
                return err("session already established");
            }
            let granted = session_timeout_ms.clamp(
                shared.cfg.min_session_timeout(),
                shared.cfg.max_session_timeout(),
            );
            let sid = shared.next_session.fetch_add(1, Ordering::Relaxed);
            lock(&shared.sessions).insert(
                sid,
                SessionState {
                    last_seen: Instant::now(),
                    timeout: Duration::from_millis(granted),
                },
            );
            *session = Some(sid);
            debug!(session = sid, timeout_ms = granted, "session established");
            OpResult::Session {
                session_id: sid,
                timeout_ms: granted,
            }
        }
        Op::Auth { secret } => {
            if secret == shared.cfg.secret {
                *authed = true;
                OpResult::Ok
            } else {
                err("auth failed")
            }
        }
        Op::Ping => OpResult::Ok,
        _ if session.is_none() => err("session not established"),
        _ if !*authed => err("auth required"),
        Op::Ensure { path } => match lock(&shared.tree).ensure(&path) {
            Ok(()) => {
                shared.storage.append("ensure", &path);
                OpResult::Ok
            }
            Err(message) => OpResult::Error { message },
        },
        Op::CreateSeq { parent, ephemeral } => {
            let Some(sid) = *session else {
                return err("session not established");
            };
            match lock(&shared.tree).create_seq(&parent, ephemeral, sid) {
                Ok(path) => {
                    if !ephemeral {
                        shared.storage.append("create", &path);
                    }
                    OpResult::Created { path }
                }
                Err(message) => OpResult::Error { message },
            }
        }
        Op::Delete { path } => match lock(&shared.tree).delete(&path) {
            Ok(()) => {
                shared.storage.append("delete", &path);
                OpResult::Ok
            }
            Err(message) => OpResult::Error { message },
        },
        Op::Children { path } => match lock(&shared.tree).children(&path) {
            Ok(paths) => OpResult::Children { paths },
            Err(message) => OpResult::Error { message },
        },
        Op::Watch { path } => {
            let Some(sid) = *session else {
                return err("session not established");
            };
            match lock(&shared.tree).watch(&path, sid, sink.clone()) {
                Ok(()) => OpResult::Ok,
                Err(message) => OpResult::Error { message },
            }
        }
    }
}

fn err(message: impl Into<String>) -> OpResult {
    OpResult::Error {
        message: message.into(),
    }
}

//! Coordination service client.
//!
//! Owns one session: a TCP connection with background reader, writer, and
//! keep-alive tasks. Connection establishment applies a bounded
//! exponential-backoff retry policy across the configured targets; if a
//! digest credential is configured it is attached before the session is
//! handed to the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CoordError, CoordResult};
use crate::lock;
use crate::proto::{self, ChildEvent, Op, OpResult, Request, ServerFrame};

/// Configuration for the coordination client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Comma-separated list of host:port targets.
    pub connect_string: String,
    /// Overall budget for establishing the session, and the per-request
    /// timeout once connected.
    pub timeout_ms: u64,
    /// Session timeout requested at the handshake; the server clamps it
    /// into its configured bounds.
    pub session_timeout_ms: u64,
    /// Base delay of the exponential-backoff retry policy.
    pub retry_base_ms: u64,
    /// Maximum number of connect retries.
    pub retry_max: u32,
    /// Digest password; empty means no credential is attached.
    pub secret: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_string: "127.0.0.1:2181".to_string(),
            timeout_ms: 30_000,
            session_timeout_ms: 20_000,
            retry_base_ms: 5,
            retry_max: 10,
            secret: String::new(),
        }
    }
}

struct ClientInner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<OpResult>>>,
    /// Watch subscribers keyed by the watched parent path.
    watches: Mutex<HashMap<String, mpsc::UnboundedSender<ChildEvent>>>,
    out: mpsc::UnboundedSender<Request>,
    closed: AtomicBool,
    op_timeout: Duration,
    session_id: u64,
    session_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientInner {
    async fn request(&self, op: Op) -> CoordResult<OpResult> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(CoordError::SessionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        if self.out.send(Request { id, op }).is_err() {
            lock(&self.pending).remove(&id);
            return Err(CoordError::SessionClosed);
        }
        match tokio::time::timeout(self.op_timeout, rx).await {
            Ok(Ok(OpResult::Error { message })) => Err(CoordError::Remote(message)),
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(CoordError::SessionClosed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(CoordError::Protocol("request timed out".to_string()))
            }
        }
    }
}

/// A live session to the coordination service.
///
/// Cloning is cheap; clones share the session. Dropping the last clone does
/// not close the session by itself, call [`CoordClient::close`].
#[derive(Clone)]
pub struct CoordClient {
    inner: Arc<ClientInner>,
}

impl CoordClient {
    /// Establish a session per `cfg`, retrying with exponential backoff
    /// inside the configured overall timeout.
    pub async fn connect(cfg: &ClientConfig) -> CoordResult<CoordClient> {
        let targets: Vec<String> = cfg
            .connect_string
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if targets.is_empty() {
            return Err(CoordError::Connection {
                target: cfg.connect_string.clone(),
                detail: "empty connect string".to_string(),
            });
        }

        let deadline = Instant::now() + Duration::from_millis(cfg.timeout_ms);
        let mut last_err = "no connect attempt made".to_string();
        'retry: for attempt in 0..=cfg.retry_max {
            for target in &targets {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break 'retry;
                }
                match tokio::time::timeout(remaining, TcpStream::connect(target.as_str())).await
                {
                    Ok(Ok(stream)) => match Self::establish(stream, cfg, deadline).await {
                        Ok(client) => {
                            info!(%target, session = client.session_id(), "session established");
                            return Ok(client);
                        }
                        Err(e) => {
                            last_err = e.to_string();
                            debug!(%target, error = %last_err, "handshake failed");
                        }
                    },
                    Ok(Err(e)) => last_err = e.to_string(),
                    Err(_) => last_err = "connect timed out".to_string(),
                }
            }
            let backoff =
                Duration::from_millis(cfg.retry_base_ms.saturating_mul(1 << attempt.min(16)));
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            debug!(attempt, ?backoff, "retrying connect");
            tokio::time::sleep(backoff.min(remaining)).await;
        }
        Err(CoordError::Connection {
            target: cfg.connect_string.clone(),
            detail: last_err,
        })
    }

    async fn establish(
        stream: TcpStream,
        cfg: &ClientConfig,
        deadline: Instant,
    ) -> CoordResult<CoordClient> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // Session handshake happens on the raw stream, before the
        // background tasks take over.
        let hello = Request {
            id: 0,
            op: Op::Hello {
                session_timeout_ms: cfg.session_timeout_ms,
            },
        };
        write_frame(&mut write_half, &hello).await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let frame = tokio::time::timeout(remaining, read_frame(&mut reader))
            .await
            .map_err(|_| CoordError::Protocol("handshake timed out".to_string()))??;
        let (session_id, granted_ms) = match frame {
            ServerFrame::Reply {
                result:
                    OpResult::Session {
                        session_id,
                        timeout_ms,
                    },
                ..
            } => (session_id, timeout_ms),
            ServerFrame::Reply {
                result: OpResult::Error { message },
                ..
            } => return Err(CoordError::Remote(message)),
            other => return Err(unexpected(&other)),
        };

        let (out, mut outbound) = mpsc::unbounded_channel::<Request>();
        let inner = Arc::new(ClientInner {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            out,
            closed: AtomicBool::new(false),
            op_timeout: Duration::from_millis(cfg.timeout_ms),
            session_id,
            session_timeout: Duration::from_millis(granted_ms),
            tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(async move {
            while let Some(request) = outbound.recv().await {
                if write_frame(&mut write_half, &request).await.is_err() {
                    break;
                }
            }
        });

        let reader_inner = inner.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(ServerFrame::Reply { id, result }) => {
                        if let Some(tx) = lock(&reader_inner.pending).remove(&id) {
                            let _ = tx.send(result);
                        }
                    }
                    Ok(ServerFrame::Event { kind, path }) => {
                        let Some(parent) = proto::parent(&path) else {
                            continue;
                        };
                        let mut watches = lock(&reader_inner.watches);
                        let delivered = watches
                            .get(parent)
                            .is_some_and(|tx| tx.send(ChildEvent { kind, path: path.clone() }).is_ok());
                        if !delivered {
                            watches.remove(parent);
                            debug!(%path, "dropping event without live subscriber");
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "session stream ended");
                        break;
                    }
                }
            }
            reader_inner.closed.store(true, Ordering::Relaxed);
            // Fail in-flight requests and wake watch consumers.
            lock(&reader_inner.pending).clear();
            lock(&reader_inner.watches).clear();
        });

        let ping_inner = inner.clone();
        let ping_every = (ping_inner.session_timeout / 3).max(Duration::from_millis(1));
        let ping = tokio::spawn(async move {
            loop {
                tokio::time::sleep(ping_every).await;
                if ping_inner.request(Op::Ping).await.is_err() {
                    warn!("keep-alive ping failed, stopping");
                    break;
                }
            }
        });

        {
            let mut tasks = lock(&inner.tasks);
            tasks.push(writer);
            tasks.push(reader_task);
            tasks.push(ping);
        }

        let client = CoordClient { inner };
        if !cfg.secret.is_empty() {
            if let Err(e) = client.inner.request(Op::Auth { secret: cfg.secret.clone() }).await
            {
                client.close();
                return Err(e);
            }
        }
        Ok(client)
    }

    /// Create `path` and any missing ancestors as persistent nodes.
    pub async fn ensure(&self, path: &str) -> CoordResult<()> {
        match self
            .inner
            .request(Op::Ensure {
                path: path.to_string(),
            })
            .await?
        {
            OpResult::Ok => Ok(()),
            other => Err(unexpected_result(&other)),
        }
    }

    /// Create one sequentially-numbered child of `parent` and return its
    /// full path. The sequence suffix is assigned atomically by the server.
    pub async fn create_sequential(&self, parent: &str, ephemeral: bool) -> CoordResult<String> {
        match self
            .inner
            .request(Op::CreateSeq {
                parent: parent.to_string(),
                ephemeral,
            })
            .await?
        {
            OpResult::Created { path } => Ok(path),
            other => Err(unexpected_result(&other)),
        }
    }

    /// Remove a childless node.
    pub async fn delete(&self, path: &str) -> CoordResult<()> {
        match self
            .inner
            .request(Op::Delete {
                path: path.to_string(),
            })
            .await?
        {
            OpResult::Ok => Ok(()),
            other => Err(unexpected_result(&other)),
        }
    }

    /// Full paths of the current children of `path`, sorted.
    pub async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        match self
            .inner
            .request(Op::Children {
                path: path.to_string(),
            })
            .await?
        {
            OpResult::Children { paths } => Ok(paths),
            other => Err(unexpected_result(&other)),
        }
    }

    /// Subscribe to child-change events under `path`. Events are delivered
    /// on the session's background reader; the receiver closes when the
    /// session does.
    pub async fn watch(&self, path: &str) -> CoordResult<mpsc::UnboundedReceiver<ChildEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Register before the request is acknowledged so no event can slip
        // between the reply and the subscription.
        lock(&self.inner.watches).insert(path.to_string(), tx);
        let result = self
            .inner
            .request(Op::Watch {
                path: path.to_string(),
            })
            .await;
        match result {
            Ok(OpResult::Ok) => Ok(rx),
            Ok(other) => {
                lock(&self.inner.watches).remove(path);
                Err(unexpected_result(&other))
            }
            Err(e) => {
                lock(&self.inner.watches).remove(path);
                Err(e)
            }
        }
    }

    /// The server-assigned session id.
    pub fn session_id(&self) -> u64 {
        self.inner.session_id
    }

    /// The session timeout granted by the server.
    pub fn session_timeout(&self) -> Duration {
        self.inner.session_timeout
    }

    /// Whether the session is still usable.
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Relaxed)
    }

    /// Tear down the session: background tasks stop and the connection
    /// drops, which releases this session's ephemeral nodes server-side.
    /// Safe to call more than once.
    pub fn close(&self) {
        let already = self.inner.closed.swap(true, Ordering::Relaxed);
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        lock(&self.inner.pending).clear();
        lock(&self.inner.watches).clear();
        if !already {
            debug!(session = self.inner.session_id, "session closed");
        }
    }
}

async fn write_frame(write_half: &mut OwnedWriteHalf, request: &Request) -> CoordResult<()> {
    let mut line =
        serde_json::to_string(request).map_err(|e| CoordError::Protocol(e.to_string()))?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;
    Ok(())
}

async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> CoordResult<ServerFrame> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(CoordError::SessionClosed);
        }
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(line.trim())
            .map_err(|e| CoordError::Protocol(format!("malformed frame: {e}")));
    }
}

fn unexpected(frame: &ServerFrame) -> CoordError {
    CoordError::Protocol(format!("unexpected frame: {frame:?}"))
}

fn unexpected_result(result: &OpResult) -> CoordError {
    CoordError::Protocol(format!("unexpected reply: {result:?}"))
}

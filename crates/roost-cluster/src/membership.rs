//! The cluster membership facade.
//!
//! Composes the embedded server (optional), the coordination client, the
//! registrar, and the membership watcher behind join/leave semantics. All
//! session state lives in one [`Session`] value created fresh on each
//! `join()` and fully cleared on `leave()`, never partially reused.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use roost_coord::{CoordClient, EmbeddedServer};
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::member::{MemberRecord, MembershipListener};
use crate::registrar;
use crate::watcher::{ListenerSlot, MembershipWatcher};

/// Everything a joined process holds: torn down as a unit on `leave()`.
struct Session {
    /// Present only when this facade instance started the embedded server;
    /// an externally provided ensemble is never stopped from here.
    server: Option<EmbeddedServer>,
    client: CoordClient,
    local: MemberRecord,
    watcher: MembershipWatcher,
}

/// Membership tracking for one process.
///
/// `join()` and `leave()` take `&mut self` and are expected to be driven
/// from a single controlling task per instance.
pub struct ClusterMembership {
    config: ClusterConfig,
    listener: ListenerSlot,
    session: Option<Session>,
}

impl ClusterMembership {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            listener: Arc::new(RwLock::new(None)),
            session: None,
        }
    }

    /// Build a facade from a flat dotted-key configuration map (`server.`
    /// and `client.` groups).
    pub fn from_properties(map: &HashMap<String, String>) -> ClusterResult<Self> {
        Ok(Self::new(ClusterConfig::from_properties(map)?))
    }

    /// Register the listener invoked on membership changes. Replaces any
    /// previous listener; effective for all subsequent notifications.
    pub fn set_listener(&self, listener: Arc<dyn MembershipListener>) {
        *self
            .listener
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    /// Join the cluster: start the embedded server if configured, connect,
    /// register this process's ephemeral record, and start the watcher.
    ///
    /// Either fully succeeds or fails with every successfully started
    /// sub-resource torn down again. Calling while joined fails fast with
    /// [`ClusterError::AlreadyJoined`].
    pub async fn join(&mut self) -> ClusterResult<()> {
        if self.session.is_some() {
            return Err(ClusterError::AlreadyJoined);
        }

        let mut server = None;
        if let Some(server_cfg) = &self.config.server {
            server = Some(
                EmbeddedServer::start(server_cfg)
                    .await
                    .map_err(ClusterError::Server)?,
            );
        }

        // With an owned, bound server and no explicit connect string, talk
        // to the server we just started (covers port 0 in tests).
        let mut client_cfg = self.config.client.clone();
        if client_cfg.connect_string.is_empty() {
            match server.as_ref().and_then(|s| s.local_addr()) {
                Some(addr) => client_cfg.connect_string = addr.to_string(),
                None => {
                    teardown(None, None, server).await;
                    return Err(ClusterError::Config(
                        "empty client connect string and no bound embedded server; \
                         set client.connect_string"
                            .to_string(),
                    ));
                }
            }
        }

        let client = match CoordClient::connect(&client_cfg).await {
            Ok(client) => client,
            Err(e) => {
                teardown(None, None, server).await;
                return Err(ClusterError::Connection(e));
            }
        };

        let local = match registrar::register(&client, &self.config.membership_path).await {
            Ok(local) => local,
            Err(e) => {
                teardown(None, Some(client), server).await;
                return Err(ClusterError::Registration(e));
            }
        };

        let watcher = match MembershipWatcher::start(
            &client,
            &self.config.membership_path,
            self.listener.clone(),
        )
        .await
        {
            Ok(watcher) => watcher,
            Err(e) => {
                teardown(None, Some(client), server).await;
                return Err(ClusterError::Watch(e));
            }
        };

        info!(id = %local.id, path = %self.config.membership_path, "joined cluster");
        self.session = Some(Session {
            server,
            client,
            local,
            watcher,
        });
        Ok(())
    }

    /// Leave the cluster: best-effort teardown of watcher, client, and the
    /// embedded server (only if this instance started it). Sub-failures
    /// are logged and never propagated; always returns `Ok`.
    pub async fn leave(&mut self) -> ClusterResult<()> {
        let Some(session) = self.session.take() else {
            debug!("leave() without a joined session is a no-op");
            return Ok(());
        };
        info!(id = %session.local.id, "leaving cluster");
        teardown(Some(session.watcher), Some(session.client), session.server).await;
        Ok(())
    }

    /// This process's derived id; `Some` only while joined. A fresh
    /// `join()` always yields a new id.
    pub fn node_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.local.id.as_str())
    }

    /// This process's full membership record, while joined.
    pub fn local_record(&self) -> Option<&MemberRecord> {
        self.session.as_ref().map(|s| &s.local)
    }

    pub fn is_joined(&self) -> bool {
        self.session.is_some()
    }

    /// Ids of all currently known members, in sequence order: a
    /// point-in-time snapshot of the watcher's cache. Empty when not
    /// joined.
    pub fn nodes(&self) -> Vec<String> {
        match &self.session {
            Some(session) => session
                .watcher
                .snapshot()
                .iter()
                .map(|r| r.id.clone())
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Best-effort teardown shared by `leave()` and failed `join()` attempts.
/// Every step runs regardless of earlier failures.
async fn teardown(
    watcher: Option<MembershipWatcher>,
    client: Option<CoordClient>,
    server: Option<EmbeddedServer>,
) {
    if let Some(watcher) = watcher {
        watcher.close();
    }
    if let Some(client) = client {
        client.close();
    }
    if let Some(mut server) = server {
        if let Err(e) = server.stop().await {
            warn!(error = %e, "embedded server did not stop cleanly");
        }
    }
}

//! Registry of live agent connections.
//!
//! One record per agent, period: a new registration for the same agent
//! evicts the old connection, and eviction synchronously unblocks every
//! pending command the connection owned before it returns. The lock guards
//! map bookkeeping only — storage writes happen after it is released.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    tokio::sync::{RwLock, mpsc, oneshot},
    tracing::{debug, info, warn},
};

use {
    fleetgate_auth::keys::generate_session_token,
    fleetgate_protocol::{GatewayFrame, HEARTBEAT_TIMEOUT_MS, Scope},
};

use crate::store::FleetStore;

/// Reason string used by the liveness sweep; nothing else may evict a
/// connection purely on silence.
pub const REASON_HEARTBEAT_TIMEOUT: &str = "heartbeat timeout";
pub const REASON_CONNECTION_CLOSED: &str = "connection closed";
pub const REASON_REPLACED: &str = "replaced by new connection";

/// What a dispatched command eventually resolves to.
#[derive(Debug, Clone)]
pub struct CommandReply {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl CommandReply {
    /// Terminal reply delivered when the owning connection goes away.
    pub fn connection_closed(reason: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(format!("connection closed: {reason}")),
            duration_ms: 0,
        }
    }
}

/// A command in flight, owned by the connection that issued it.
pub struct PendingCommand {
    pub action: String,
    pub created_at: Instant,
    pub reply: oneshot::Sender<CommandReply>,
}

/// A live, authenticated agent connection.
pub struct AgentConnection {
    pub agent_id: String,
    pub conn_id: String,
    pub session_token: String,
    pub source_addr: String,
    pub agent_version: String,
    pub scopes: Vec<Scope>,
    /// Serialized frames for this connection's write loop.
    pub sender: mpsc::UnboundedSender<String>,
    pub connected_at: Instant,
    pub last_heartbeat: Instant,
    /// command_id → pending command.
    pending: HashMap<String, PendingCommand>,
}

/// Read-only snapshot of a connection, safe to hand out.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub agent_id: String,
    pub conn_id: String,
    pub session_token: String,
    pub source_addr: String,
    pub agent_version: String,
    pub connected_at: Instant,
    pub last_heartbeat: Instant,
    pub pending_count: usize,
}

impl AgentConnection {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            agent_id: self.agent_id.clone(),
            conn_id: self.conn_id.clone(),
            session_token: self.session_token.clone(),
            source_addr: self.source_addr.clone(),
            agent_version: self.agent_version.clone(),
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat,
            pending_count: self.pending.len(),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    /// agent_id → connection.
    by_agent: HashMap<String, AgentConnection>,
    /// conn_id → agent_id (reverse lookup for cleanup on disconnect).
    by_conn: HashMap<String, String>,
}

/// Failure modes for emitting a command frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("agent is not connected")]
    Offline,
    #[error("transport send failed")]
    SendFailed,
}

pub struct AgentRegistry {
    inner: RwLock<RegistryInner>,
    store: Arc<dyn FleetStore>,
    heartbeat_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self::with_heartbeat_timeout(store, Duration::from_millis(HEARTBEAT_TIMEOUT_MS))
    }

    pub fn with_heartbeat_timeout(store: Arc<dyn FleetStore>, timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            store,
            heartbeat_timeout: timeout,
        }
    }

    /// Register an authenticated connection and issue its session token.
    /// Any existing connection for the same agent is evicted first.
    pub async fn register(
        &self,
        agent_id: &str,
        conn_id: &str,
        sender: mpsc::UnboundedSender<String>,
        source_addr: &str,
        agent_version: &str,
        scopes: Vec<Scope>,
    ) -> String {
        let session_token = generate_session_token();
        let now = Instant::now();
        let conn = AgentConnection {
            agent_id: agent_id.to_string(),
            conn_id: conn_id.to_string(),
            session_token: session_token.clone(),
            source_addr: source_addr.to_string(),
            agent_version: agent_version.to_string(),
            scopes,
            sender,
            connected_at: now,
            last_heartbeat: now,
            pending: HashMap::new(),
        };

        let evicted = {
            let mut inner = self.inner.write().await;
            let evicted = inner.by_agent.remove(agent_id);
            if let Some(old) = evicted.as_ref() {
                inner.by_conn.remove(&old.conn_id);
            }
            inner
                .by_conn
                .insert(conn_id.to_string(), agent_id.to_string());
            inner.by_agent.insert(agent_id.to_string(), conn);
            evicted
        };

        if let Some(old) = evicted {
            info!(agent_id, old_conn = %old.conn_id, "evicting superseded connection");
            cancel_pending(old, REASON_REPLACED);
        }

        info!(agent_id, conn_id, source_addr, "agent registered");
        if let Err(e) = self
            .store
            .mark_online(agent_id, agent_version, source_addr)
            .await
        {
            warn!(agent_id, error = %e, "failed to mark agent online");
        }
        if let Err(e) = self.store.record_session_open(agent_id, conn_id).await {
            warn!(agent_id, error = %e, "failed to record session open");
        }
        session_token
    }

    /// Remove the record for this connection handle if it is still current.
    /// No-op when a newer connection has already superseded it. Pending
    /// commands are cancelled before storage is touched or control returns.
    pub async fn unregister(&self, conn_id: &str, reason: &str) {
        let removed = {
            let mut inner = self.inner.write().await;
            let Some(agent_id) = inner.by_conn.remove(conn_id) else {
                return;
            };
            // `by_conn` is pruned on eviction, so this record is current.
            inner.by_agent.remove(&agent_id)
        };
        let Some(conn) = removed else { return };

        let agent_id = conn.agent_id.clone();
        info!(agent_id = %agent_id, conn_id, reason, "agent unregistered");
        cancel_pending(conn, reason);

        if let Err(e) = self.store.mark_offline(&agent_id, reason).await {
            warn!(agent_id = %agent_id, error = %e, "failed to mark agent offline");
        }
        if let Err(e) = self
            .store
            .record_session_close(&agent_id, conn_id, reason)
            .await
        {
            warn!(agent_id = %agent_id, error = %e, "failed to record session close");
        }
    }

    pub async fn lookup(&self, agent_id: &str) -> Option<ConnectionInfo> {
        self.inner
            .read()
            .await
            .by_agent
            .get(agent_id)
            .map(AgentConnection::info)
    }

    pub async fn lookup_by_conn(&self, conn_id: &str) -> Option<ConnectionInfo> {
        let inner = self.inner.read().await;
        let agent_id = inner.by_conn.get(conn_id)?;
        inner.by_agent.get(agent_id).map(AgentConnection::info)
    }

    pub async fn scopes_of(&self, agent_id: &str) -> Option<Vec<Scope>> {
        self.inner
            .read()
            .await
            .by_agent
            .get(agent_id)
            .map(|c| c.scopes.clone())
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.by_agent.len()
    }

    /// Refresh the heartbeat clock and forward metrics (best-effort).
    pub async fn heartbeat(&self, agent_id: &str, metrics: Option<&serde_json::Value>) {
        {
            let mut inner = self.inner.write().await;
            if let Some(conn) = inner.by_agent.get_mut(agent_id) {
                conn.last_heartbeat = Instant::now();
            }
        }
        if let Err(e) = self.store.record_heartbeat(agent_id, metrics).await {
            debug!(agent_id, error = %e, "heartbeat storage write failed");
        }
    }

    /// Insert a pending command and emit its frame in one locked step, so a
    /// concurrent eviction can never strand the pending entry. A failed
    /// channel send removes the entry again.
    pub async fn dispatch_frame(
        &self,
        agent_id: &str,
        command_id: &str,
        pending: PendingCommand,
        frame: &GatewayFrame,
    ) -> Result<(), SendError> {
        let serialized = serde_json::to_string(frame).map_err(|_| SendError::SendFailed)?;
        let mut inner = self.inner.write().await;
        let conn = inner.by_agent.get_mut(agent_id).ok_or(SendError::Offline)?;
        if conn.sender.send(serialized).is_err() {
            return Err(SendError::SendFailed);
        }
        conn.pending.insert(command_id.to_string(), pending);
        Ok(())
    }

    /// Remove a pending command, by the connection it belongs to.
    pub async fn take_pending(&self, conn_id: &str, command_id: &str) -> Option<PendingCommand> {
        let mut inner = self.inner.write().await;
        let agent_id = inner.by_conn.get(conn_id)?.clone();
        inner
            .by_agent
            .get_mut(&agent_id)?
            .pending
            .remove(command_id)
    }

    /// Remove a pending command by agent (used on dispatch timeout).
    pub async fn take_pending_by_agent(
        &self,
        agent_id: &str,
        command_id: &str,
    ) -> Option<PendingCommand> {
        let mut inner = self.inner.write().await;
        inner
            .by_agent
            .get_mut(agent_id)?
            .pending
            .remove(command_id)
    }

    /// Send a pre-serialized frame to an agent's write loop.
    pub async fn send_to(&self, agent_id: &str, frame: &GatewayFrame) -> Result<(), SendError> {
        let serialized = serde_json::to_string(frame).map_err(|_| SendError::SendFailed)?;
        let inner = self.inner.read().await;
        let conn = inner.by_agent.get(agent_id).ok_or(SendError::Offline)?;
        conn.sender
            .send(serialized)
            .map_err(|_| SendError::SendFailed)
    }

    /// Evict every connection whose heartbeat age exceeds the timeout.
    /// Stale handles are snapshotted under the read lock, then evicted one
    /// by one through the normal unregister path.
    pub async fn sweep(&self) {
        let cutoff = self.heartbeat_timeout;
        let stale: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .by_agent
                .values()
                .filter(|c| c.last_heartbeat.elapsed() > cutoff)
                .map(|c| c.conn_id.clone())
                .collect()
        };
        for conn_id in stale {
            warn!(conn_id = %conn_id, "connection missed heartbeats, evicting");
            self.unregister(&conn_id, REASON_HEARTBEAT_TIMEOUT).await;
        }
    }
}

/// Deliver a terminal reply to every waiter the connection still owns.
fn cancel_pending(conn: AgentConnection, reason: &str) {
    for (command_id, pending) in conn.pending {
        debug!(command_id = %command_id, reason, "cancelling pending command");
        let _ = pending.reply.send(CommandReply::connection_closed(reason));
    }
}

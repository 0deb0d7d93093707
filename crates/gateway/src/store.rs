//! Contracts with the durable world.
//!
//! The gateway itself keeps no durable state. Agent records, command audit
//! rows, connection sessions and security alerts belong to the orchestration
//! layer's storage, reached through [`FleetStore`]; telemetry fan-out to
//! panel subscribers goes through [`EventSink`]. Both are best-effort from
//! the protocol's point of view — a failed write must never stall a
//! connection (the one exception, retrying a command's final audit state,
//! lives in the router).

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::sync::RwLock,
};

use fleetgate_auth::AgentCredentials;

// ── Records ──────────────────────────────────────────────────────────────────

/// Final state of a dispatched command, written to the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditState {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAudit {
    pub command_id: String,
    pub agent_id: String,
    pub action: String,
    pub user_id: Option<String>,
    pub state: AuditState,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Resolved,
}

/// A security alert produced by the anomaly detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub id: String,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub source_addr: String,
    pub agent_id: Option<String>,
    pub details: serde_json::Value,
    pub status: AlertStatus,
}

// ── Traits ───────────────────────────────────────────────────────────────────

/// Durable storage owned by the orchestration layer.
#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn load_credentials(&self, agent_id: &str) -> anyhow::Result<Option<AgentCredentials>>;
    async fn save_credentials(&self, creds: &AgentCredentials) -> anyhow::Result<()>;

    async fn mark_online(&self, agent_id: &str, version: &str, addr: &str) -> anyhow::Result<()>;
    async fn mark_offline(&self, agent_id: &str, reason: &str) -> anyhow::Result<()>;
    async fn record_heartbeat(
        &self,
        agent_id: &str,
        metrics: Option<&serde_json::Value>,
    ) -> anyhow::Result<()>;
    async fn record_system_info(
        &self,
        agent_id: &str,
        info: &serde_json::Value,
    ) -> anyhow::Result<()>;

    async fn record_session_open(&self, agent_id: &str, conn_id: &str) -> anyhow::Result<()>;
    async fn record_session_close(
        &self,
        agent_id: &str,
        conn_id: &str,
        reason: &str,
    ) -> anyhow::Result<()>;

    async fn create_command_audit(&self, audit: &CommandAudit) -> anyhow::Result<()>;
    async fn finalize_command_audit(
        &self,
        command_id: &str,
        state: AuditState,
        error: Option<&str>,
        duration: Duration,
    ) -> anyhow::Result<()>;

    /// Returns the new alert's id.
    async fn create_alert(&self, alert: &SecurityAlert) -> anyhow::Result<String>;
    async fn update_alert(&self, alert_id: &str, details: serde_json::Value)
    -> anyhow::Result<()>;

    /// (agent_id, source_addr) pairs seen in past sessions; seeds the
    /// first-seen-address set at startup.
    async fn known_addresses(&self) -> anyhow::Result<Vec<(String, String)>>;
}

/// Opaque publish sink for telemetry/log streams (the panel's realtime
/// transport lives behind this).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value);
}

// ── No-op implementations ────────────────────────────────────────────────────

/// Store that remembers nothing. Useful when the orchestration layer is not
/// attached (standalone gateway, some tests).
pub struct NoopStore;

#[async_trait]
impl FleetStore for NoopStore {
    async fn load_credentials(&self, _: &str) -> anyhow::Result<Option<AgentCredentials>> {
        Ok(None)
    }
    async fn save_credentials(&self, _: &AgentCredentials) -> anyhow::Result<()> {
        Ok(())
    }
    async fn mark_online(&self, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn mark_offline(&self, _: &str, _: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn record_heartbeat(&self, _: &str, _: Option<&serde_json::Value>) -> anyhow::Result<()> {
        Ok(())
    }
    async fn record_system_info(&self, _: &str, _: &serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }
    async fn record_session_open(&self, _: &str, _: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn record_session_close(&self, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn create_command_audit(&self, _: &CommandAudit) -> anyhow::Result<()> {
        Ok(())
    }
    async fn finalize_command_audit(
        &self,
        _: &str,
        _: AuditState,
        _: Option<&str>,
        _: Duration,
    ) -> anyhow::Result<()> {
        Ok(())
    }
    async fn create_alert(&self, _: &SecurityAlert) -> anyhow::Result<String> {
        Ok(uuid::Uuid::new_v4().to_string())
    }
    async fn update_alert(&self, _: &str, _: serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }
    async fn known_addresses(&self) -> anyhow::Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }
}

/// Sink that drops everything.
pub struct NoopSink;

#[async_trait]
impl EventSink for NoopSink {
    async fn publish(&self, _: &str, _: serde_json::Value) {}
}

// ── In-memory implementations ────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    credentials: HashMap<String, AgentCredentials>,
    online: HashMap<String, bool>,
    heartbeats: HashMap<String, u64>,
    system_info: HashMap<String, serde_json::Value>,
    sessions: Vec<(String, String, Option<String>)>,
    audits: HashMap<String, CommandAudit>,
    alerts: Vec<SecurityAlert>,
    known_addrs: HashSet<(String, String)>,
    /// When set, the next finalize_command_audit calls fail (for retry tests).
    finalize_failures: u32,
}

/// RwLock-backed store for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn put_credentials(&self, creds: AgentCredentials) {
        let mut inner = self.inner.write().await;
        inner.credentials.insert(creds.agent_id.clone(), creds);
    }

    pub async fn seed_known_address(&self, agent_id: &str, addr: &str) {
        let mut inner = self.inner.write().await;
        inner
            .known_addrs
            .insert((agent_id.to_string(), addr.to_string()));
    }

    pub async fn audit(&self, command_id: &str) -> Option<CommandAudit> {
        self.inner.read().await.audits.get(command_id).cloned()
    }

    pub async fn audits_for_agent(&self, agent_id: &str) -> Vec<CommandAudit> {
        self.inner
            .read()
            .await
            .audits
            .values()
            .filter(|a| a.agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub async fn alerts(&self) -> Vec<SecurityAlert> {
        self.inner.read().await.alerts.clone()
    }

    pub async fn is_online(&self, agent_id: &str) -> bool {
        self.inner
            .read()
            .await
            .online
            .get(agent_id)
            .copied()
            .unwrap_or(false)
    }

    /// Make the next `n` finalize_command_audit calls fail.
    pub async fn fail_next_finalizes(&self, n: u32) {
        self.inner.write().await.finalize_failures = n;
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn load_credentials(&self, agent_id: &str) -> anyhow::Result<Option<AgentCredentials>> {
        Ok(self.inner.read().await.credentials.get(agent_id).cloned())
    }

    async fn save_credentials(&self, creds: &AgentCredentials) -> anyhow::Result<()> {
        self.put_credentials(creds.clone()).await;
        Ok(())
    }

    async fn mark_online(&self, agent_id: &str, _version: &str, addr: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        inner.online.insert(agent_id.to_string(), true);
        inner
            .known_addrs
            .insert((agent_id.to_string(), addr.to_string()));
        Ok(())
    }

    async fn mark_offline(&self, agent_id: &str, _reason: &str) -> anyhow::Result<()> {
        self.inner
            .write()
            .await
            .online
            .insert(agent_id.to_string(), false);
        Ok(())
    }

    async fn record_heartbeat(
        &self,
        agent_id: &str,
        _metrics: Option<&serde_json::Value>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        *inner.heartbeats.entry(agent_id.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn record_system_info(
        &self,
        agent_id: &str,
        info: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.inner
            .write()
            .await
            .system_info
            .insert(agent_id.to_string(), info.clone());
        Ok(())
    }

    async fn record_session_open(&self, agent_id: &str, conn_id: &str) -> anyhow::Result<()> {
        self.inner
            .write()
            .await
            .sessions
            .push((agent_id.to_string(), conn_id.to_string(), None));
        Ok(())
    }

    async fn record_session_close(
        &self,
        agent_id: &str,
        conn_id: &str,
        reason: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner
            .sessions
            .iter_mut()
            .rev()
            .find(|(a, c, r)| a == agent_id && c == conn_id && r.is_none())
        {
            session.2 = Some(reason.to_string());
        }
        Ok(())
    }

    async fn create_command_audit(&self, audit: &CommandAudit) -> anyhow::Result<()> {
        self.inner
            .write()
            .await
            .audits
            .insert(audit.command_id.clone(), audit.clone());
        Ok(())
    }

    async fn finalize_command_audit(
        &self,
        command_id: &str,
        state: AuditState,
        error: Option<&str>,
        duration: Duration,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if inner.finalize_failures > 0 {
            inner.finalize_failures -= 1;
            anyhow::bail!("injected finalize failure");
        }
        let audit = inner
            .audits
            .get_mut(command_id)
            .ok_or_else(|| anyhow::anyhow!("unknown command {command_id}"))?;
        audit.state = state;
        audit.error = error.map(str::to_string);
        audit.duration_ms = Some(duration.as_millis() as u64);
        Ok(())
    }

    async fn create_alert(&self, alert: &SecurityAlert) -> anyhow::Result<String> {
        let mut inner = self.inner.write().await;
        inner.alerts.push(alert.clone());
        Ok(alert.id.clone())
    }

    async fn update_alert(
        &self,
        alert_id: &str,
        details: serde_json::Value,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(alert) = inner.alerts.iter_mut().find(|a| a.id == alert_id) {
            alert.details = details;
        }
        Ok(())
    }

    async fn known_addresses(&self) -> anyhow::Result<Vec<(String, String)>> {
        Ok(self.inner.read().await.known_addrs.iter().cloned().collect())
    }
}

/// Sink that records published events for assertions.
#[derive(Default)]
pub struct MemorySink {
    events: RwLock<Vec<(String, serde_json::Value)>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, topic: &str, payload: serde_json::Value) {
        self.events.write().await.push((topic.to_string(), payload));
    }
}

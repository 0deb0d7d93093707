//! Dispatches commands to connected agents and correlates replies.
//!
//! A dispatch parks its caller on a private oneshot channel; the protocol
//! handler feeds `command_result` frames back through [`CommandRouter::resolve_reply`].
//! Exactly one of reply / timeout / eviction releases each caller.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use fleetgate_protocol::{ErrorShape, GatewayFrame, error_codes, scope::any_covers};

use crate::{
    anomaly::AnomalyDetector,
    registry::{AgentRegistry, CommandReply, PendingCommand, SendError},
    store::{AuditState, CommandAudit, FleetStore},
};

/// Successful dispatch result handed back to the orchestration layer. The
/// agent may still report failure (`success == false`, `error` set); routing
/// level failures come back as `ErrorShape` instead.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command_id: String,
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

pub struct CommandRouter {
    registry: Arc<AgentRegistry>,
    store: Arc<dyn FleetStore>,
    anomaly: Arc<AnomalyDetector>,
}

impl CommandRouter {
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<dyn FleetStore>,
        anomaly: Arc<AnomalyDetector>,
    ) -> Self {
        Self {
            registry,
            store,
            anomaly,
        }
    }

    /// Send `action` to a connected agent and wait up to `timeout` for its
    /// reply. The caller is always released: by reply, by timeout, or by a
    /// terminal error when the connection is evicted mid-flight.
    pub async fn dispatch(
        &self,
        agent_id: &str,
        action: &str,
        params: serde_json::Value,
        timeout: Duration,
        user_id: Option<&str>,
    ) -> Result<CommandOutcome, ErrorShape> {
        let target = self
            .registry
            .lookup(agent_id)
            .await
            .ok_or_else(|| ErrorShape::new(error_codes::AGENT_OFFLINE, "agent is not connected"))?;
        let scopes = self.registry.scopes_of(agent_id).await.unwrap_or_default();
        if !any_covers(&scopes, action) {
            return Err(ErrorShape::new(
                error_codes::PERMISSION_DENIED,
                format!("agent scope does not cover {action}"),
            ));
        }

        let command_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();

        // Audit row first, state = running. Best-effort: a storage hiccup
        // must not block the command path.
        let audit = CommandAudit {
            command_id: command_id.clone(),
            agent_id: agent_id.to_string(),
            action: action.to_string(),
            user_id: user_id.map(str::to_string),
            state: AuditState::Running,
            error: None,
            duration_ms: None,
        };
        if let Err(e) = self.store.create_command_audit(&audit).await {
            warn!(command_id = %command_id, error = %e, "failed to create command audit");
        }

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let pending = PendingCommand {
            action: action.to_string(),
            created_at: started,
            reply: reply_tx,
        };
        let frame = GatewayFrame::Command {
            id: command_id.clone(),
            action: action.to_string(),
            params,
            timeout_ms: timeout.as_millis() as u64,
        };

        if let Err(e) = self
            .registry
            .dispatch_frame(agent_id, &command_id, pending, &frame)
            .await
        {
            let (code, msg) = match e {
                SendError::Offline => (error_codes::AGENT_OFFLINE, "agent is not connected"),
                SendError::SendFailed => (error_codes::SEND_ERROR, "failed to send command"),
            };
            self.finalize(&command_id, AuditState::Failed, Some(msg), started)
                .await;
            return Err(ErrorShape::new(code, msg));
        }

        // Burst tracking; a command flood shows up as a security alert.
        self.anomaly
            .record_command(agent_id, &target.source_addr)
            .await;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => {
                let state = if reply.success {
                    AuditState::Completed
                } else {
                    AuditState::Failed
                };
                self.finalize(&command_id, state, reply.error.as_deref(), started)
                    .await;
                Ok(outcome(command_id, reply))
            },
            Ok(Err(_)) => {
                // Sender dropped without an explicit reply; treat like an
                // eviction that lost the race to deliver one.
                self.finalize(
                    &command_id,
                    AuditState::Failed,
                    Some("connection closed"),
                    started,
                )
                .await;
                Ok(outcome(
                    command_id,
                    CommandReply::connection_closed("channel dropped"),
                ))
            },
            Err(_elapsed) => {
                // Late replies for this id are discarded by resolve_reply.
                self.registry
                    .take_pending_by_agent(agent_id, &command_id)
                    .await;
                self.finalize(&command_id, AuditState::Failed, Some("timeout"), started)
                    .await;
                Err(ErrorShape::new(error_codes::TIMEOUT, "command timeout"))
            },
        }
    }

    /// Feed a `command_result` frame into the matching pending slot.
    /// Unmatched or repeated replies are discarded, not errors.
    pub async fn resolve_reply(&self, conn_id: &str, command_id: &str, reply: CommandReply) {
        match self.registry.take_pending(conn_id, command_id).await {
            Some(pending) => {
                debug!(
                    command_id,
                    action = %pending.action,
                    elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                    "command reply received"
                );
                // The waiter may have timed out between removal and here;
                // a dead receiver is fine.
                let _ = pending.reply.send(reply);
            },
            None => {
                debug!(conn_id, command_id, "discarding unmatched command reply");
            },
        }
    }

    /// Record a command's final audit state. This is the one storage write
    /// that gets a retry; the in-memory result is returned either way.
    async fn finalize(
        &self,
        command_id: &str,
        state: AuditState,
        error: Option<&str>,
        started: Instant,
    ) {
        let duration = started.elapsed();
        let first = self
            .store
            .finalize_command_audit(command_id, state, error, duration)
            .await;
        if first.is_err()
            && let Err(e) = self
                .store
                .finalize_command_audit(command_id, state, error, duration)
                .await
        {
            warn!(command_id, error = %e, "failed to finalize command audit after retry");
        }
    }
}

fn outcome(command_id: String, reply: CommandReply) -> CommandOutcome {
    CommandOutcome {
        command_id,
        success: reply.success,
        data: reply.data,
        error: reply.error,
        duration_ms: reply.duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use {
        fleetgate_protocol::Scope,
        tokio::sync::mpsc,
    };

    use crate::store::MemoryStore;

    async fn setup(
        scopes: &[&str],
    ) -> (
        Arc<MemoryStore>,
        Arc<AgentRegistry>,
        CommandRouter,
        mpsc::UnboundedReceiver<String>,
    ) {
        let store = MemoryStore::new();
        let registry = Arc::new(AgentRegistry::new(store.clone()));
        let anomaly = Arc::new(AnomalyDetector::new(
            store.clone(),
            fleetgate_config::schema::AnomalyConfig::default(),
        ));
        let router = CommandRouter::new(registry.clone(), store.clone(), anomaly);
        let (tx, rx) = mpsc::unbounded_channel();
        registry
            .register(
                "srv-1",
                "c1",
                tx,
                "10.0.0.1",
                "1.0",
                scopes.iter().map(|s| Scope::parse(s)).collect(),
            )
            .await;
        (store, registry, router, rx)
    }

    fn reply_ok() -> CommandReply {
        CommandReply {
            success: true,
            data: Some(serde_json::json!({"containers": []})),
            error: None,
            duration_ms: 7,
        }
    }

    #[tokio::test]
    async fn dispatch_to_unknown_agent_is_offline() {
        let store = MemoryStore::new();
        let registry = Arc::new(AgentRegistry::new(store.clone()));
        let anomaly = Arc::new(AnomalyDetector::new(
            store.clone(),
            fleetgate_config::schema::AnomalyConfig::default(),
        ));
        let router = CommandRouter::new(registry, store, anomaly);
        let err = router
            .dispatch("ghost", "docker:ps", serde_json::json!({}), Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(err.is(error_codes::AGENT_OFFLINE));
    }

    #[tokio::test]
    async fn dispatch_outside_scope_is_denied() {
        let (_store, _registry, router, _rx) = setup(&["files:read"]).await;
        let err = router
            .dispatch("srv-1", "docker:ps", serde_json::json!({}), Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(err.is(error_codes::PERMISSION_DENIED));
    }

    #[tokio::test]
    async fn reply_releases_the_caller_and_completes_audit() {
        let (store, registry, router, mut rx) = setup(&["docker:*"]).await;
        let router = Arc::new(router);

        let call = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .dispatch(
                        "srv-1",
                        "docker:ps",
                        serde_json::json!({}),
                        Duration::from_secs(5),
                        Some("user-9"),
                    )
                    .await
            })
        };

        // Read the emitted command frame to learn its id.
        let frame = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["type"], "command");
        assert_eq!(parsed["action"], "docker:ps");
        let command_id = parsed["id"].as_str().unwrap().to_string();

        router.resolve_reply("c1", &command_id, reply_ok()).await;

        let outcome = call.await.unwrap().unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.command_id, command_id);

        let audit = store.audit(&command_id).await.unwrap();
        assert_eq!(audit.state, AuditState::Completed);
        assert_eq!(audit.user_id.as_deref(), Some("user-9"));
        assert!(audit.duration_ms.is_some());
        let _ = registry;
    }

    #[tokio::test]
    async fn timeout_releases_the_caller_and_fails_audit() {
        let (store, _registry, router, mut rx) = setup(&["docker:*"]).await;

        let err = router
            .dispatch(
                "srv-1",
                "docker:ps",
                serde_json::json!({}),
                Duration::from_millis(50),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is(error_codes::TIMEOUT));

        let frame = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        let command_id = parsed["id"].as_str().unwrap();
        let audit = store.audit(command_id).await.unwrap();
        assert_eq!(audit.state, AuditState::Failed);
        assert_eq!(audit.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn late_reply_after_timeout_is_discarded() {
        let (_store, _registry, router, mut rx) = setup(&["docker:*"]).await;

        let err = router
            .dispatch(
                "srv-1",
                "docker:ps",
                serde_json::json!({}),
                Duration::from_millis(20),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is(error_codes::TIMEOUT));

        let frame = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        let command_id = parsed["id"].as_str().unwrap();
        // Nothing to panic on, nothing delivered twice.
        router.resolve_reply("c1", command_id, reply_ok()).await;
        router.resolve_reply("c1", command_id, reply_ok()).await;
    }

    #[tokio::test]
    async fn eviction_mid_flight_returns_terminal_error_immediately() {
        let (_store, registry, router, _rx) = setup(&["docker:*"]).await;
        let router = Arc::new(router);

        let call = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .dispatch(
                        "srv-1",
                        "docker:ps",
                        serde_json::json!({}),
                        // Generous timeout: the test fails if eviction
                        // doesn't short-circuit it.
                        Duration::from_secs(30),
                        None,
                    )
                    .await
            })
        };
        // Let the dispatch park on its reply channel.
        tokio::time::sleep(Duration::from_millis(30)).await;

        registry.unregister("c1", "connection closed").await;

        let outcome =
            tokio::time::timeout(Duration::from_secs(1), call).await.unwrap().unwrap().unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("connection closed"));
    }

    #[tokio::test]
    async fn finalize_retries_once_on_storage_failure() {
        let (store, _registry, router, mut rx) = setup(&["docker:*"]).await;
        let router = Arc::new(router);
        store.fail_next_finalizes(1).await;

        let call = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .dispatch(
                        "srv-1",
                        "docker:ps",
                        serde_json::json!({}),
                        Duration::from_secs(5),
                        None,
                    )
                    .await
            })
        };

        let frame = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        let command_id = parsed["id"].as_str().unwrap().to_string();
        router.resolve_reply("c1", &command_id, reply_ok()).await;

        // Caller still gets its result, and the retry landed the audit.
        let outcome = call.await.unwrap().unwrap();
        assert!(outcome.success);
        let audit = store.audit(&command_id).await.unwrap();
        assert_eq!(audit.state, AuditState::Completed);
    }
}

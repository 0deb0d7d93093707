//! Shared gateway runtime state, wrapped in Arc for use across async tasks.
//!
//! Everything here is an explicitly constructed service instance — there is
//! no process-wide singleton, and tests build as many isolated states as
//! they like.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tracing::info;

use {
    fleetgate_auth::{NonceGuard, rotation::RotationGrant},
    fleetgate_config::FleetgateConfig,
    fleetgate_protocol::{ErrorShape, error_codes},
};

use crate::{
    anomaly::AnomalyDetector,
    registry::AgentRegistry,
    router::{CommandOutcome, CommandRouter},
    store::{EventSink, FleetStore},
};

pub struct GatewayState {
    pub registry: Arc<AgentRegistry>,
    pub router: CommandRouter,
    pub anomaly: Arc<AnomalyDetector>,
    nonces: Mutex<NonceGuard>,
    pub store: Arc<dyn FleetStore>,
    pub sink: Arc<dyn EventSink>,
    /// Identifier sent to agents in `auth_ok`.
    pub server_id: String,
    /// Server version string.
    pub version: String,
    pub heartbeat_interval: Duration,
    pub default_command_timeout: Duration,
}

impl GatewayState {
    pub fn new(
        config: &FleetgateConfig,
        store: Arc<dyn FleetStore>,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let server_id = if config.gateway.server_id.is_empty() {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "fleetgate".into())
        } else {
            config.gateway.server_id.clone()
        };

        let heartbeat_interval = Duration::from_millis(config.timing.heartbeat_interval_ms());
        let registry = Arc::new(AgentRegistry::with_heartbeat_timeout(
            Arc::clone(&store),
            3 * heartbeat_interval,
        ));
        let anomaly = Arc::new(AnomalyDetector::new(
            Arc::clone(&store),
            config.anomaly.clone(),
        ));
        let router = CommandRouter::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&anomaly),
        );

        Arc::new(Self {
            registry,
            router,
            anomaly,
            nonces: Mutex::new(NonceGuard::new()),
            store,
            sink,
            server_id,
            version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat_interval,
            default_command_timeout: Duration::from_millis(config.timing.command_timeout_ms()),
        })
    }

    /// Short-held lock over the nonce guard. A poisoned lock only means a
    /// panic mid-bookkeeping; the map stays usable.
    pub fn nonces(&self) -> MutexGuard<'_, NonceGuard> {
        match self.nonces.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Dispatch a command with the configured default timeout. Callers with
    /// their own deadline go through [`CommandRouter::dispatch`] directly.
    pub async fn dispatch(
        &self,
        agent_id: &str,
        action: &str,
        params: serde_json::Value,
        user_id: Option<&str>,
    ) -> Result<CommandOutcome, ErrorShape> {
        self.router
            .dispatch(
                agent_id,
                action,
                params,
                self.default_command_timeout,
                user_id,
            )
            .await
    }

    /// Mint fresh credentials into the agent's pending slot. The active key
    /// keeps working for the whole rotation window, so a crashed agent can
    /// never be locked out by a half-finished rotation.
    pub async fn begin_rotation(&self, agent_id: &str) -> Result<RotationGrant, ErrorShape> {
        let mut creds = self
            .store
            .load_credentials(agent_id)
            .await
            .map_err(|e| ErrorShape::new(error_codes::DB_ERROR, e.to_string()))?
            .ok_or_else(|| ErrorShape::new(error_codes::INVALID_REQUEST, "unknown agent"))?;
        let grant = creds
            .begin_rotation()
            .map_err(|e| ErrorShape::new(error_codes::INVALID_REQUEST, e.to_string()))?;
        self.store
            .save_credentials(&creds)
            .await
            .map_err(|e| ErrorShape::new(error_codes::DB_ERROR, e.to_string()))?;
        Ok(grant)
    }

    /// Promote a pending rotation to active. Recorded nonces for the agent
    /// are cleared — they were minted under the old secret.
    pub async fn complete_rotation(
        &self,
        agent_id: &str,
        rotation_id: &str,
    ) -> Result<(), ErrorShape> {
        let mut creds = self
            .store
            .load_credentials(agent_id)
            .await
            .map_err(|e| ErrorShape::new(error_codes::DB_ERROR, e.to_string()))?
            .ok_or_else(|| ErrorShape::new(error_codes::INVALID_REQUEST, "unknown agent"))?;
        creds
            .complete_rotation(rotation_id)
            .map_err(|e| ErrorShape::new(error_codes::INVALID_REQUEST, e.to_string()))?;
        self.store
            .save_credentials(&creds)
            .await
            .map_err(|e| ErrorShape::new(error_codes::DB_ERROR, e.to_string()))?;
        self.nonces().clear_for_agent(agent_id);
        info!(agent_id, "credentials rotated");
        Ok(())
    }
}

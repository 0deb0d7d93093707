use serde::{Deserialize, Serialize};

// ── Agent → gateway ──────────────────────────────────────────────────────────

/// Frames an agent may send up the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    /// The one and only frame accepted on an unauthenticated connection.
    Auth {
        agent_id: String,
        api_key_prefix: String,
        /// Lowercase hex HMAC-SHA256 over the canonical request.
        signature: String,
        /// Milliseconds since the Unix epoch, agent clock.
        timestamp: u64,
        nonce: String,
        /// Agent build version, informational.
        #[serde(default)]
        agent_version: String,
    },
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metrics: Option<serde_json::Value>,
    },
    CommandResult {
        command_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        duration_ms: u64,
    },
    SystemInfo {
        info: serde_json::Value,
    },
    Stream {
        channel: String,
        data: serde_json::Value,
    },
    Error {
        message: String,
    },
}

// ── Gateway → agent ──────────────────────────────────────────────────────────

/// Frames the gateway sends down the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayFrame {
    AuthOk {
        session_token: String,
        expires_in_ms: u64,
        server_id: String,
    },
    /// Deliberately carries no detail about which check failed.
    AuthFail {
        error: String,
    },
    HeartbeatAck,
    Command {
        id: String,
        action: String,
        params: serde_json::Value,
        timeout_ms: u64,
    },
}

impl GatewayFrame {
    /// The generic rejection sent for every authentication failure.
    pub fn auth_fail() -> Self {
        Self::AuthFail {
            error: "auth_fail".into(),
        }
    }
}

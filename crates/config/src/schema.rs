//! Config schema types (gateway listener, protocol timing, anomaly limits).

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetgateConfig {
    pub gateway: GatewayConfig,
    pub timing: TimingConfig,
    pub anomaly: AnomalyConfig,
}

/// Listener settings for the gateway server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
    /// Identifier sent to agents in `auth_ok`. Defaults to the hostname
    /// when empty.
    pub server_id: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8444,
            server_id: String::new(),
        }
    }
}

/// Protocol timing overrides. Zero means "use the protocol default".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub heartbeat_interval_ms: u64,
    pub command_timeout_ms: u64,
}

impl TimingConfig {
    pub fn heartbeat_interval_ms(&self) -> u64 {
        if self.heartbeat_interval_ms == 0 {
            fleetgate_protocol_default_heartbeat()
        } else {
            self.heartbeat_interval_ms
        }
    }

    pub fn command_timeout_ms(&self) -> u64 {
        if self.command_timeout_ms == 0 {
            30_000
        } else {
            self.command_timeout_ms
        }
    }
}

// Kept as a free fn so the schema crate stays serde-only (no protocol dep).
fn fleetgate_protocol_default_heartbeat() -> u64 {
    30_000
}

/// Thresholds for the anomaly detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Auth failures from one source within a minute before a warning.
    pub auth_failures_per_minute: u32,
    /// Auth failures from one source within an hour before a critical.
    pub auth_failures_per_hour: u32,
    /// Commands for one agent within a minute before a warning.
    pub commands_per_minute: u32,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            auth_failures_per_minute: 5,
            auth_failures_per_hour: 20,
            commands_per_minute: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_every_section() {
        let cfg: FleetgateConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.gateway.port, 8444);
        assert_eq!(cfg.anomaly.auth_failures_per_minute, 5);
        assert_eq!(cfg.timing.heartbeat_interval_ms(), 30_000);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg: FleetgateConfig = toml::from_str("[gateway]\nport = 9000\n").unwrap();
        assert_eq!(cfg.gateway.port, 9000);
        assert_eq!(cfg.gateway.bind, "0.0.0.0");
    }

    #[test]
    fn timing_zero_means_default() {
        let cfg = TimingConfig {
            heartbeat_interval_ms: 0,
            command_timeout_ms: 5_000,
        };
        assert_eq!(cfg.heartbeat_interval_ms(), 30_000);
        assert_eq!(cfg.command_timeout_ms(), 5_000);
    }
}

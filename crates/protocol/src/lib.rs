//! Wire protocol spoken between the gateway and fleet agents.
//!
//! Frames are JSON objects discriminated by a `type` field, carried over a
//! persistent duplex transport (WebSocket in practice). This crate also owns
//! the protocol constants, the error shape returned to panel callers, the
//! permission-scope matcher, and the stream-channel → publish-topic mapping.

pub mod error;
pub mod frames;
pub mod scope;
pub mod topic;

pub use {
    error::{ErrorShape, error_codes},
    frames::{AgentFrame, GatewayFrame},
    scope::Scope,
};

/// Protocol revision negotiated in `auth_ok`.
pub const PROTOCOL_VERSION: u32 = 2;

/// Expected interval between agent heartbeats.
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// A connection is evicted once its heartbeat age exceeds this.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 3 * HEARTBEAT_INTERVAL_MS;

/// Period of the registry liveness sweep.
pub const LIVENESS_SWEEP_MS: u64 = 30_000;

/// How long a recorded nonce blocks reuse.
pub const NONCE_TTL_MS: u64 = 300_000;

/// Accepted skew (either direction) between an auth timestamp and server time.
pub const AUTH_WINDOW_MS: u64 = 300_000;

/// Lifetime of a pending credential rotation.
pub const ROTATION_WINDOW_MS: u64 = 300_000;

/// Advisory session lifetime reported in `auth_ok`. Liveness is governed by
/// heartbeats, not by this value.
pub const SESSION_TTL_MS: u64 = 86_400_000;

/// Dispatch timeout applied when the caller does not supply one.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

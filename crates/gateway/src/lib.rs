//! Gateway: the control-plane endpoint fleet agents dial into.
//!
//! Lifecycle:
//! 1. Load config, construct storage + publish sink collaborators
//! 2. Build state (registry, router, anomaly detector, nonce guard)
//! 3. Seed the first-seen-address set from session history
//! 4. Start HTTP server (health) and attach the WebSocket upgrade handler
//! 5. Spawn liveness sweep + cleanup timers
//!
//! The REST surface, templating, and OS-tool orchestration live in the
//! panel's own codebase and reach agents through [`router::CommandRouter`].

pub mod anomaly;
pub mod registry;
pub mod router;
pub mod server;
pub mod state;
pub mod store;
pub mod ws;

pub use {
    registry::AgentRegistry,
    router::{CommandOutcome, CommandRouter},
    server::{build_gateway_app, spawn_background_tasks, start_gateway},
    state::GatewayState,
};

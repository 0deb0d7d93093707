use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        response::{IntoResponse, Json},
        routing::get,
    },
    tower_http::cors::{Any, CorsLayer},
    tracing::info,
};

use {
    fleetgate_config::FleetgateConfig,
    fleetgate_protocol::{LIVENESS_SWEEP_MS, PROTOCOL_VERSION},
};

use crate::{
    state::GatewayState,
    store::{EventSink, FleetStore},
    ws::handle_connection,
};

/// How often expired nonces and anomaly windows are pruned.
const CLEANUP_INTERVAL_MS: u64 = 60_000;

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct AppState {
    gateway: Arc<GatewayState>,
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let app_state = AppState { gateway: state };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .layer(cors)
        .with_state(app_state)
}

/// Spawn the registry liveness sweep and the nonce/anomaly cleanup tasks.
/// They run for the life of the process (tests just drop the runtime).
pub fn spawn_background_tasks(state: &Arc<GatewayState>) {
    let sweep_state = Arc::clone(state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(LIVENESS_SWEEP_MS));
        loop {
            interval.tick().await;
            sweep_state.registry.sweep().await;
        }
    });

    let cleanup_state = Arc::clone(state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(CLEANUP_INTERVAL_MS));
        loop {
            interval.tick().await;
            cleanup_state.nonces().sweep();
            cleanup_state.anomaly.prune();
        }
    });
}

/// Start the gateway HTTP + WebSocket server and run until shutdown.
pub async fn start_gateway(
    config: FleetgateConfig,
    store: Arc<dyn FleetStore>,
    sink: Arc<dyn EventSink>,
) -> anyhow::Result<()> {
    let state = GatewayState::new(&config, store, sink);
    state.anomaly.seed_known_addresses().await;
    spawn_background_tasks(&state);

    let app = build_gateway_app(Arc::clone(&state));
    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Startup banner.
    let lines = [
        format!("fleetgate v{}", state.version),
        format!("protocol v{PROTOCOL_VERSION}, listening on {addr}"),
        format!("server id: {}", state.server_id),
        format!(
            "heartbeat interval {}s, sweep every {}s",
            state.heartbeat_interval.as_secs(),
            LIVENESS_SWEEP_MS / 1000
        ),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    // Run with ConnectInfo so handlers see the agent's remote address.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let count = state.gateway.registry.count().await;
    Json(serde_json::json!({
        "status": "ok",
        "version": state.gateway.version,
        "protocol": PROTOCOL_VERSION,
        "agents_connected": count,
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state.gateway, addr))
}

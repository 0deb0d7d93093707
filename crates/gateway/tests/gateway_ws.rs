//! End-to-end tests driving a real gateway over WebSocket, with
//! tokio-tungstenite standing in for the installed agent.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use {
    futures::{SinkExt, StreamExt},
    tokio::net::TcpStream,
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message},
};

use {
    fleetgate_auth::{AgentCredentials, ApiKey, keys::generate_secret, signature::sign_request},
    fleetgate_config::FleetgateConfig,
    fleetgate_gateway::{
        GatewayState, build_gateway_app,
        store::{AlertSeverity, AuditState, MemorySink, MemoryStore},
    },
    fleetgate_protocol::Scope,
};

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    addr: SocketAddr,
    state: Arc<GatewayState>,
    store: Arc<MemoryStore>,
    sink: Arc<MemorySink>,
    secret: String,
    key_prefix: String,
}

const AGENT: &str = "srv-1";

async fn start_harness() -> Harness {
    let store = MemoryStore::new();
    let sink = MemorySink::new();

    let key = ApiKey::generate();
    let secret = generate_secret();
    store
        .put_credentials(AgentCredentials::new(
            AGENT,
            &key,
            secret.clone(),
            vec![Scope::parse("docker:*")],
        ))
        .await;

    let state = GatewayState::new(&FleetgateConfig::default(), store.clone(), sink.clone());
    state.anomaly.seed_known_addresses().await;
    let app = build_gateway_app(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    Harness {
        addr,
        state,
        store,
        sink,
        secret,
        key_prefix: key.prefix,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

async fn connect(addr: SocketAddr) -> AgentSocket {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn send_json(ws: &mut AgentSocket, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn next_json(ws: &mut AgentSocket) -> serde_json::Value {
    loop {
        match ws.next().await.expect("connection closed").unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Close(_) => panic!("connection closed"),
            _ => continue,
        }
    }
}

/// Auth frame for the harness agent with a fresh nonce.
fn auth_frame(h: &Harness, nonce: &str) -> serde_json::Value {
    let ts = now_ms();
    serde_json::json!({
        "type": "auth",
        "agent_id": AGENT,
        "api_key_prefix": h.key_prefix,
        "signature": sign_request(&h.secret, AGENT, ts, nonce),
        "timestamp": ts,
        "nonce": nonce,
        "agent_version": "1.4.0",
    })
}

/// Connect and authenticate, returning the socket and session token.
async fn authed_agent(h: &Harness, nonce: &str) -> (AgentSocket, String) {
    let mut ws = connect(h.addr).await;
    send_json(&mut ws, auth_frame(h, nonce)).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "auth_ok", "unexpected reply: {reply}");
    let token = reply["session_token"].as_str().unwrap().to_string();
    (ws, token)
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn agent_authenticates_and_dispatch_succeeds() {
    let h = start_harness().await;
    let (mut ws, token) = authed_agent(&h, "nonce-a").await;
    assert!(!token.is_empty());
    assert!(h.store.is_online(AGENT).await);

    // Simulated agent: answer the first command after a short delay.
    let agent_task = tokio::spawn(async move {
        let cmd = next_json(&mut ws).await;
        assert_eq!(cmd["type"], "command");
        assert_eq!(cmd["action"], "docker:ps");
        tokio::time::sleep(Duration::from_millis(100)).await;
        send_json(
            &mut ws,
            serde_json::json!({
                "type": "command_result",
                "command_id": cmd["id"],
                "success": true,
                "data": {"containers": ["web", "db"]},
                "duration_ms": 100,
            }),
        )
        .await;
        ws
    });

    let outcome = h
        .state
        .router
        .dispatch(
            AGENT,
            "docker:ps",
            serde_json::json!({}),
            Duration::from_secs(5),
            Some("user-1"),
        )
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.data.unwrap()["containers"][0], "web");

    let audit = h.store.audit(&outcome.command_id).await.unwrap();
    assert_eq!(audit.state, AuditState::Completed);
    agent_task.await.unwrap();
}

#[tokio::test]
async fn dispatch_times_out_when_agent_stays_silent() {
    let h = start_harness().await;
    let (_ws, _) = authed_agent(&h, "nonce-b").await;

    let started = Instant::now();
    let err = h
        .state
        .router
        .dispatch(
            AGENT,
            "docker:ps",
            serde_json::json!({}),
            Duration::from_secs(1),
            None,
        )
        .await
        .unwrap_err();
    assert!(err.is(fleetgate_protocol::error_codes::TIMEOUT));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "returned too late: {elapsed:?}");

    // Audit row records the timeout.
    let audits = h.store.audits_for_agent(AGENT).await;
    let audit = audits.last().unwrap();
    assert_eq!(audit.state, AuditState::Failed);
    assert_eq!(audit.error.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn disconnect_mid_dispatch_releases_caller_immediately() {
    let h = start_harness().await;
    let (mut ws, _) = authed_agent(&h, "nonce-c").await;

    let state = h.state.clone();
    let call = tokio::spawn(async move {
        state
            .router
            .dispatch(
                AGENT,
                "docker:ps",
                serde_json::json!({}),
                Duration::from_secs(30),
                None,
            )
            .await
    });

    // Wait for the command to reach the agent, then hang up without a reply.
    let cmd = next_json(&mut ws).await;
    assert_eq!(cmd["type"], "command");
    drop(ws);

    // The caller comes back well before the 30s timeout.
    let outcome = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .expect("caller hung past eviction")
        .unwrap()
        .unwrap();
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("connection closed"));
}

#[tokio::test]
async fn replayed_nonce_is_rejected_with_a_critical_alert() {
    let h = start_harness().await;
    let (_ws, _) = authed_agent(&h, "nonce-d").await;

    // Second connection replays the same nonce (fresh signature and all).
    let mut ws2 = connect(h.addr).await;
    send_json(&mut ws2, auth_frame(&h, "nonce-d")).await;
    let reply = next_json(&mut ws2).await;
    assert_eq!(reply["type"], "auth_fail");
    assert_eq!(reply["error"], "auth_fail");

    let alerts = h.store.alerts().await;
    let replay = alerts
        .iter()
        .find(|a| a.alert_type == "replay_attack")
        .expect("no replay alert");
    assert_eq!(replay.severity, AlertSeverity::Critical);
    assert_eq!(replay.agent_id.as_deref(), Some(AGENT));
}

#[tokio::test]
async fn bad_signature_gets_generic_auth_fail() {
    let h = start_harness().await;
    let mut ws = connect(h.addr).await;
    let ts = now_ms();
    send_json(
        &mut ws,
        serde_json::json!({
            "type": "auth",
            "agent_id": AGENT,
            "api_key_prefix": h.key_prefix,
            "signature": "deadbeef",
            "timestamp": ts,
            "nonce": "nonce-x",
        }),
    )
    .await;
    let reply = next_json(&mut ws).await;
    // Same generic shape as every other failure mode.
    assert_eq!(reply["type"], "auth_fail");
    assert_eq!(reply["error"], "auth_fail");
}

#[tokio::test]
async fn auth_fail_frame_always_beats_the_close() {
    let h = start_harness().await;
    // The rejection frame must be delivered every time, not lost to the
    // connection teardown racing the write loop.
    for i in 0..20 {
        let mut ws = connect(h.addr).await;
        let ts = now_ms();
        send_json(
            &mut ws,
            serde_json::json!({
                "type": "auth",
                "agent_id": AGENT,
                "api_key_prefix": h.key_prefix,
                "signature": "deadbeef",
                "timestamp": ts,
                "nonce": format!("nonce-bad-{i}"),
            }),
        )
        .await;
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["type"], "auth_fail", "attempt {i}");
    }
}

#[tokio::test]
async fn frame_before_auth_closes_the_connection() {
    let h = start_harness().await;
    let mut ws = connect(h.addr).await;
    send_json(&mut ws, serde_json::json!({"type": "heartbeat"})).await;
    // Server closes without a heartbeat_ack.
    loop {
        match ws.next().await {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
            Some(Ok(Message::Text(text))) => panic!("unexpected frame: {text}"),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn heartbeat_is_acked_and_recorded() {
    let h = start_harness().await;
    let (mut ws, _) = authed_agent(&h, "nonce-e").await;
    send_json(
        &mut ws,
        serde_json::json!({"type": "heartbeat", "metrics": {"cpu": 12.5}}),
    )
    .await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "heartbeat_ack");
}

#[tokio::test]
async fn second_registration_evicts_the_first_connection() {
    let h = start_harness().await;
    let (_ws1, token1) = authed_agent(&h, "nonce-f1").await;
    let (_ws2, token2) = authed_agent(&h, "nonce-f2").await;
    assert_ne!(token1, token2);

    let info = h.state.registry.lookup(AGENT).await.unwrap();
    assert_eq!(info.session_token, token2);
    assert_eq!(h.state.registry.count().await, 1);
}

#[tokio::test]
async fn stream_frames_route_to_topic_rooms() {
    let h = start_harness().await;
    let (mut ws, _) = authed_agent(&h, "nonce-g").await;

    send_json(
        &mut ws,
        serde_json::json!({"type": "stream", "channel": "metrics", "data": {"cpu": 40}}),
    )
    .await;
    send_json(
        &mut ws,
        serde_json::json!({
            "type": "stream",
            "channel": "container:abc123:logs",
            "data": {"line": "ready"},
        }),
    )
    .await;
    // Heartbeat as a barrier: once acked, the stream frames were handled.
    send_json(&mut ws, serde_json::json!({"type": "heartbeat"})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "heartbeat_ack");

    let events = h.sink.events().await;
    let topics: Vec<&str> = events.iter().map(|(t, _)| t.as_str()).collect();
    assert!(topics.contains(&"server_srv-1_metrics"), "topics: {topics:?}");
    assert!(
        topics.contains(&"server_srv-1_container_abc123_logs"),
        "topics: {topics:?}"
    );
}

#[tokio::test]
async fn health_endpoint_reports_connections() {
    let h = start_harness().await;
    let (_ws, _) = authed_agent(&h, "nonce-h").await;
    let body: serde_json::Value = reqwest::get(format!("http://{}/health", h.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["agents_connected"], 1);
}

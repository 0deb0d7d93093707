//! The message-level protocol handler bound to a WebSocket connection.
//!
//! State machine per connection: Unauthenticated → Authenticated → Closed.
//! An unauthenticated connection gets exactly one shot at an `auth` frame;
//! anything else tears it down. Every auth failure is answered with the
//! same generic `auth_fail` so a probing client learns nothing about which
//! check tripped.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, StreamExt},
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use fleetgate_protocol::{AgentFrame, GatewayFrame, SESSION_TTL_MS, Scope, topic::stream_topic};

use fleetgate_auth::signature::{check_timestamp, verify_signature};

use crate::{
    registry::{CommandReply, REASON_CONNECTION_CLOSED},
    state::GatewayState,
};

/// Why an auth attempt was rejected. Internal only — the agent always sees
/// the same generic frame.
enum AuthReject {
    Replay { agent_id: String },
    AddressBlocked { agent_id: String },
    Invalid { agent_id: Option<String> },
}

pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, addr: SocketAddr) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let source_addr = addr.ip().to_string();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Write loop: everything this connection sends funnels through one task.
    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    debug!(conn_id = %conn_id, source = %source_addr, "connection opened");
    let mut agent_id: Option<String> = None;

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            // Pings are answered by the socket layer; binary is not part of
            // the protocol.
            Ok(_) => continue,
        };

        let frame: AgentFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "unparseable frame");
                if agent_id.is_none() {
                    break;
                }
                continue;
            },
        };

        match agent_id.as_deref() {
            None => match frame {
                AgentFrame::Auth {
                    agent_id: claimed,
                    api_key_prefix,
                    signature,
                    timestamp,
                    nonce,
                    agent_version,
                } => {
                    match authenticate(
                        &state,
                        &source_addr,
                        &claimed,
                        &api_key_prefix,
                        &signature,
                        timestamp,
                        &nonce,
                    )
                    .await
                    {
                        Ok(scopes) => {
                            let token = state
                                .registry
                                .register(
                                    &claimed,
                                    &conn_id,
                                    tx.clone(),
                                    &source_addr,
                                    &agent_version,
                                    scopes,
                                )
                                .await;
                            send(&tx, &GatewayFrame::AuthOk {
                                session_token: token,
                                expires_in_ms: SESSION_TTL_MS,
                                server_id: state.server_id.clone(),
                            });
                            state.anomaly.record_new_address(&claimed, &source_addr).await;
                            info!(agent_id = %claimed, source = %source_addr, "agent authenticated");
                            agent_id = Some(claimed);
                        },
                        Err(reject) => {
                            report_reject(&state, &source_addr, reject).await;
                            send(&tx, &GatewayFrame::auth_fail());
                            break;
                        },
                    }
                },
                _ => {
                    debug!(conn_id = %conn_id, "non-auth frame before authentication");
                    break;
                },
            },
            Some(agent) => {
                // A superseded or evicted connection stops being served the
                // moment its registry record is gone.
                if state.registry.lookup_by_conn(&conn_id).await.is_none() {
                    debug!(conn_id = %conn_id, "record gone, closing connection");
                    break;
                }
                let agent = agent.to_string();
                handle_authenticated(&state, &conn_id, &agent, &tx, frame).await;
            },
        }
    }

    if let Some(agent) = agent_id.as_deref() {
        state.registry.unregister(&conn_id, REASON_CONNECTION_CLOSED).await;
        debug!(agent_id = %agent, conn_id = %conn_id, "connection closed");
    }
    // Drain queued frames (the auth_fail rejection in particular) before the
    // socket goes away. The write loop exits once every sender is dropped;
    // unregister above released the registry's clone.
    drop(tx);
    let _ = write_task.await;
}

async fn handle_authenticated(
    state: &Arc<GatewayState>,
    conn_id: &str,
    agent_id: &str,
    tx: &mpsc::UnboundedSender<String>,
    frame: AgentFrame,
) {
    match frame {
        AgentFrame::Heartbeat { metrics } => {
            state.registry.heartbeat(agent_id, metrics.as_ref()).await;
            send(tx, &GatewayFrame::HeartbeatAck);
        },
        AgentFrame::CommandResult {
            command_id,
            success,
            data,
            error,
            duration_ms,
        } => {
            state
                .router
                .resolve_reply(conn_id, &command_id, CommandReply {
                    success,
                    data,
                    error,
                    duration_ms,
                })
                .await;
        },
        AgentFrame::SystemInfo { info } => {
            if let Err(e) = state.store.record_system_info(agent_id, &info).await {
                debug!(agent_id, error = %e, "system info storage write failed");
            }
        },
        AgentFrame::Stream { channel, data } => {
            let topic = stream_topic(agent_id, &channel);
            state.sink.publish(&topic, data).await;
        },
        AgentFrame::Error { message } => {
            warn!(agent_id, message = %message, "agent reported an error");
        },
        AgentFrame::Auth { .. } => {
            debug!(agent_id, "duplicate auth frame ignored");
        },
    }
}

/// Run the full validation chain for an auth frame. Order matters: the
/// timestamp window rejects stale signatures before any nonce bookkeeping
/// happens, and the nonce is only burned once everything else checks out.
async fn authenticate(
    state: &Arc<GatewayState>,
    source_addr: &str,
    agent_id: &str,
    api_key_prefix: &str,
    signature: &str,
    timestamp: u64,
    nonce: &str,
) -> Result<Vec<Scope>, AuthReject> {
    if agent_id.is_empty() || api_key_prefix.is_empty() || signature.is_empty() || nonce.is_empty()
    {
        return Err(AuthReject::Invalid {
            agent_id: (!agent_id.is_empty()).then(|| agent_id.to_string()),
        });
    }

    if !check_timestamp(now_ms(), timestamp) {
        debug!(agent_id, "auth timestamp outside window");
        return Err(AuthReject::Invalid {
            agent_id: Some(agent_id.to_string()),
        });
    }

    let mut creds = match state.store.load_credentials(agent_id).await {
        Ok(Some(creds)) => creds,
        Ok(None) => {
            debug!(agent_id, "unknown agent identity");
            return Err(AuthReject::Invalid {
                agent_id: Some(agent_id.to_string()),
            });
        },
        Err(e) => {
            warn!(agent_id, error = %e, "credential lookup failed");
            return Err(AuthReject::Invalid {
                agent_id: Some(agent_id.to_string()),
            });
        },
    };

    if !creds.address_allowed(source_addr) {
        return Err(AuthReject::AddressBlocked {
            agent_id: agent_id.to_string(),
        });
    }

    let Some(slot) = creds.slot_for_prefix(api_key_prefix) else {
        debug!(agent_id, "key prefix matches neither active nor pending slot");
        return Err(AuthReject::Invalid {
            agent_id: Some(agent_id.to_string()),
        });
    };

    if !verify_signature(slot.secret, agent_id, timestamp, nonce, signature) {
        debug!(agent_id, "signature verification failed");
        return Err(AuthReject::Invalid {
            agent_id: Some(agent_id.to_string()),
        });
    }

    // Empty nonces were rejected above, so a refusal here is a replay.
    if !state.nonces().check_and_record(agent_id, nonce) {
        return Err(AuthReject::Replay {
            agent_id: agent_id.to_string(),
        });
    }

    Ok(creds.scopes.clone())
}

async fn report_reject(state: &Arc<GatewayState>, source_addr: &str, reject: AuthReject) {
    match reject {
        AuthReject::Replay { agent_id } => {
            warn!(agent_id = %agent_id, source = %source_addr, "nonce replay detected");
            state.anomaly.record_replay(&agent_id, source_addr).await;
            state
                .anomaly
                .record_auth_failure(Some(&agent_id), source_addr)
                .await;
        },
        AuthReject::AddressBlocked { agent_id } => {
            warn!(agent_id = %agent_id, source = %source_addr, "address not in allowlist");
            state
                .anomaly
                .record_address_blocked(&agent_id, source_addr)
                .await;
            state
                .anomaly
                .record_auth_failure(Some(&agent_id), source_addr)
                .await;
        },
        AuthReject::Invalid { agent_id } => {
            state
                .anomaly
                .record_auth_failure(agent_id.as_deref(), source_addr)
                .await;
        },
    }
}

fn send(tx: &mpsc::UnboundedSender<String>, frame: &GatewayFrame) {
    if let Ok(serialized) = serde_json::to_string(frame) {
        let _ = tx.send(serialized);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

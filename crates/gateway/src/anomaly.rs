//! Turns raw security events into deduplicated alerts.
//!
//! Sliding 1-hour windows of timestamped events are kept per agent and per
//! source address. Threshold evaluation happens under a short-held lock;
//! the resulting storage writes happen after it is released, so a slow
//! store can never back up the protocol path.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tracing::{info, warn};

use fleetgate_config::schema::AnomalyConfig;

use crate::store::{AlertSeverity, AlertStatus, FleetStore, SecurityAlert};

/// Events older than this fall out of the windows.
const WINDOW: Duration = Duration::from_secs(3600);
/// A same-keyed alert within this window is updated, not duplicated.
const DEDUP_WINDOW: Duration = Duration::from_secs(300);
const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    AuthFailure,
    Command,
}

struct RecentAlert {
    id: String,
    created_at: Instant,
    count: u64,
}

#[derive(Default)]
struct DetectorInner {
    by_agent: HashMap<String, Vec<(Instant, EventKind)>>,
    by_source: HashMap<String, Vec<(Instant, EventKind)>>,
    /// (type, agent, source) → most recent alert, for dedup.
    recent: HashMap<(String, String, String), RecentAlert>,
    /// (agent, source) pairs already seen this process lifetime.
    known_addresses: HashSet<(String, String)>,
}

enum Decision {
    Create(SecurityAlert),
    Update { id: String, details: serde_json::Value },
}

pub struct AnomalyDetector {
    inner: Mutex<DetectorInner>,
    store: Arc<dyn FleetStore>,
    cfg: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(store: Arc<dyn FleetStore>, cfg: AnomalyConfig) -> Self {
        Self {
            inner: Mutex::new(DetectorInner::default()),
            store,
            cfg,
        }
    }

    /// Seed the first-seen-address set from durable session history so a
    /// gateway restart doesn't re-announce every known agent address.
    pub async fn seed_known_addresses(&self) {
        match self.store.known_addresses().await {
            Ok(pairs) => {
                let mut inner = self.lock();
                inner.known_addresses.extend(pairs);
            },
            Err(e) => warn!(error = %e, "failed to seed known addresses"),
        }
    }

    pub async fn record_auth_failure(&self, agent_id: Option<&str>, source: &str) {
        let decisions = {
            let mut inner = self.lock();
            let now = Instant::now();
            if let Some(agent) = agent_id {
                push_event(&mut inner.by_agent, agent, now, EventKind::AuthFailure);
            }
            push_event(&mut inner.by_source, source, now, EventKind::AuthFailure);

            let last_minute =
                count_events(&inner.by_source, source, EventKind::AuthFailure, MINUTE);
            let last_hour = count_events(&inner.by_source, source, EventKind::AuthFailure, WINDOW);

            let mut decisions = Vec::new();
            if last_hour >= self.cfg.auth_failures_per_hour as usize {
                decisions.push(inner.decide(
                    "auth_failure",
                    AlertSeverity::Critical,
                    agent_id,
                    source,
                    serde_json::json!({
                        "failures_last_hour": last_hour,
                        "window_secs": WINDOW.as_secs(),
                    }),
                ));
            } else if last_minute >= self.cfg.auth_failures_per_minute as usize {
                decisions.push(inner.decide(
                    "auth_failure",
                    AlertSeverity::Warning,
                    agent_id,
                    source,
                    serde_json::json!({
                        "failures_last_minute": last_minute,
                        "window_secs": MINUTE.as_secs(),
                    }),
                ));
            }
            decisions
        };
        self.apply(decisions).await;
    }

    pub async fn record_command(&self, agent_id: &str, source: &str) {
        let decisions = {
            let mut inner = self.lock();
            let now = Instant::now();
            push_event(&mut inner.by_agent, agent_id, now, EventKind::Command);
            let last_minute = count_events(&inner.by_agent, agent_id, EventKind::Command, MINUTE);

            if last_minute >= self.cfg.commands_per_minute as usize {
                vec![inner.decide(
                    "command_flood",
                    AlertSeverity::Warning,
                    Some(agent_id),
                    source,
                    serde_json::json!({
                        "commands_last_minute": last_minute,
                        "window_secs": MINUTE.as_secs(),
                    }),
                )]
            } else {
                Vec::new()
            }
        };
        self.apply(decisions).await;
    }

    /// A nonce replay is an alert on its own, no threshold needed.
    pub async fn record_replay(&self, agent_id: &str, source: &str) {
        let decision = {
            let mut inner = self.lock();
            inner.decide(
                "replay_attack",
                AlertSeverity::Critical,
                Some(agent_id),
                source,
                serde_json::json!({ "nonce_reuse": true }),
            )
        };
        self.apply(vec![decision]).await;
    }

    /// One informational alert per (agent, address) for the process
    /// lifetime; the seeded set suppresses addresses with session history.
    pub async fn record_new_address(&self, agent_id: &str, source: &str) {
        let first_seen = {
            let mut inner = self.lock();
            inner
                .known_addresses
                .insert((agent_id.to_string(), source.to_string()))
        };
        if !first_seen {
            return;
        }
        info!(agent_id, source, "agent connected from a new address");
        let alert = new_alert(
            "new_address",
            AlertSeverity::Info,
            Some(agent_id),
            source,
            serde_json::json!({ "address": source }),
        );
        if let Err(e) = self.store.create_alert(&alert).await {
            warn!(error = %e, "failed to persist new-address alert");
        }
    }

    pub async fn record_address_blocked(&self, agent_id: &str, source: &str) {
        let decision = {
            let mut inner = self.lock();
            inner.decide(
                "address_blocked",
                AlertSeverity::Warning,
                Some(agent_id),
                source,
                serde_json::json!({ "address": source }),
            )
        };
        self.apply(vec![decision]).await;
    }

    /// Drop expired events and dedup entries. Runs from the background
    /// cleanup task.
    pub fn prune(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        for events in inner.by_agent.values_mut() {
            events.retain(|(at, _)| now.duration_since(*at) < WINDOW);
        }
        inner.by_agent.retain(|_, v| !v.is_empty());
        for events in inner.by_source.values_mut() {
            events.retain(|(at, _)| now.duration_since(*at) < WINDOW);
        }
        inner.by_source.retain(|_, v| !v.is_empty());
        inner
            .recent
            .retain(|_, alert| now.duration_since(alert.created_at) < DEDUP_WINDOW);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DetectorInner> {
        // Detector state is plain bookkeeping; a poisoned lock means a
        // panic mid-update, and the windows are safe to keep using.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn apply(&self, decisions: Vec<Decision>) {
        for decision in decisions {
            match decision {
                Decision::Create(alert) => {
                    info!(
                        alert_type = %alert.alert_type,
                        severity = ?alert.severity,
                        source = %alert.source_addr,
                        "security alert raised"
                    );
                    if let Err(e) = self.store.create_alert(&alert).await {
                        warn!(error = %e, "failed to persist security alert");
                    }
                },
                Decision::Update { id, details } => {
                    if let Err(e) = self.store.update_alert(&id, details).await {
                        warn!(alert_id = %id, error = %e, "failed to update security alert");
                    }
                },
            }
        }
    }
}

impl DetectorInner {
    /// Create a fresh alert, or fold into the open one created within the
    /// dedup window for the same (type, agent, source).
    fn decide(
        &mut self,
        alert_type: &str,
        severity: AlertSeverity,
        agent_id: Option<&str>,
        source: &str,
        details: serde_json::Value,
    ) -> Decision {
        let key = (
            alert_type.to_string(),
            agent_id.unwrap_or_default().to_string(),
            source.to_string(),
        );
        let now = Instant::now();
        if let Some(recent) = self.recent.get_mut(&key)
            && now.duration_since(recent.created_at) < DEDUP_WINDOW
        {
            recent.count += 1;
            let mut details = details;
            if let Some(map) = details.as_object_mut() {
                map.insert("occurrences".into(), serde_json::json!(recent.count));
            }
            return Decision::Update {
                id: recent.id.clone(),
                details,
            };
        }

        let alert = new_alert(alert_type, severity, agent_id, source, details);
        self.recent.insert(key, RecentAlert {
            id: alert.id.clone(),
            created_at: now,
            count: 1,
        });
        Decision::Create(alert)
    }
}

fn new_alert(
    alert_type: &str,
    severity: AlertSeverity,
    agent_id: Option<&str>,
    source: &str,
    details: serde_json::Value,
) -> SecurityAlert {
    SecurityAlert {
        id: uuid::Uuid::new_v4().to_string(),
        alert_type: alert_type.to_string(),
        severity,
        source_addr: source.to_string(),
        agent_id: agent_id.map(str::to_string),
        details,
        status: AlertStatus::Open,
    }
}

fn push_event(
    map: &mut HashMap<String, Vec<(Instant, EventKind)>>,
    key: &str,
    at: Instant,
    kind: EventKind,
) {
    map.entry(key.to_string()).or_default().push((at, kind));
}

fn count_events(
    map: &HashMap<String, Vec<(Instant, EventKind)>>,
    key: &str,
    kind: EventKind,
    window: Duration,
) -> usize {
    let now = Instant::now();
    map.get(key)
        .map(|events| {
            events
                .iter()
                .filter(|(at, k)| *k == kind && now.duration_since(*at) < window)
                .count()
        })
        .unwrap_or(0)
}

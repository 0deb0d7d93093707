//! Replay protection: a (agent, nonce) pair is good exactly once per TTL.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tracing::trace;

use fleetgate_protocol::NONCE_TTL_MS;

/// TTL map of recently seen nonces. Callers wrap this in their own lock;
/// every operation is plain bookkeeping with no I/O.
pub struct NonceGuard {
    seen: HashMap<(String, String), Instant>,
    ttl: Duration,
}

impl Default for NonceGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceGuard {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_millis(NONCE_TTL_MS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            ttl,
        }
    }

    /// Accept-and-record. Returns false for an empty nonce (never recorded)
    /// and false for an unexpired repeat — the caller treats that repeat as
    /// a replay and raises an anomaly event.
    pub fn check_and_record(&mut self, agent_id: &str, nonce: &str) -> bool {
        if nonce.is_empty() {
            return false;
        }
        let key = (agent_id.to_string(), nonce.to_string());
        let now = Instant::now();
        if let Some(expires) = self.seen.get(&key)
            && *expires > now
        {
            trace!(agent_id, "nonce replayed");
            return false;
        }
        self.seen.insert(key, now + self.ttl);
        true
    }

    /// Purge expired entries. Expired keys are snapshotted first so the map
    /// is not mutated while being iterated.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        let expired: Vec<(String, String)> = self
            .seen
            .iter()
            .filter(|(_, expires)| **expires <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.seen.remove(&key);
        }
    }

    /// Old nonces are meaningless once an agent's secret changes.
    pub fn clear_for_agent(&mut self, agent_id: &str) {
        self.seen.retain(|(agent, _), _| agent != agent_id);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

//! HMAC-SHA256 request signatures for auth frames.
//!
//! The canonical string is `"{agent_id}\n{timestamp}\n{nonce}"`; the
//! signature is its lowercase hex HMAC under the agent's shared secret.
//! Prefix matching alone is never sufficient — the full signature must
//! verify on every auth attempt.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use fleetgate_protocol::AUTH_WINDOW_MS;

use crate::safe_equal;

type HmacSha256 = Hmac<Sha256>;

/// Sign an auth request. Agents run the same computation client-side.
pub fn sign_request(secret: &str, agent_id: &str, timestamp: u64, nonce: &str) -> String {
    // HMAC-SHA256 accepts any key length; the error branch is unreachable.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(agent_id.as_bytes());
    mac.update(b"\n");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b"\n");
    mac.update(nonce.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a presented signature.
pub fn verify_signature(
    secret: &str,
    agent_id: &str,
    timestamp: u64,
    nonce: &str,
    presented: &str,
) -> bool {
    let expected = sign_request(secret, agent_id, timestamp, nonce);
    safe_equal(&expected, &presented.to_ascii_lowercase())
}

/// Whether a presented timestamp (ms since epoch) falls within the accepted
/// window around server time. Rejects stale signatures before any nonce
/// bookkeeping happens.
pub fn check_timestamp(now_ms: u64, presented_ms: u64) -> bool {
    now_ms.abs_diff(presented_ms) <= AUTH_WINDOW_MS
}

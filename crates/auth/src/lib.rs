//! Agent credential material: API keys hashed at rest, HMAC request
//! signatures, two-slot key rotation, and the replay-blocking nonce guard.
//!
//! Nothing in this crate does I/O; the gateway wires these pieces to its
//! storage and anomaly services.

pub mod keys;
pub mod nonce;
pub mod rotation;
pub mod signature;

pub use {
    keys::{ApiKey, KeyMaterial},
    nonce::NonceGuard,
    rotation::{AgentCredentials, RotationError, RotationGrant},
    signature::{check_timestamp, sign_request, verify_signature},
};

/// Constant-time string comparison (prevents timing attacks).
pub(crate) fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    // XOR each byte and accumulate; any difference makes result non-zero.
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_equal_matches_and_rejects() {
        assert!(safe_equal("abc", "abc"));
        assert!(!safe_equal("abc", "abd"));
        assert!(!safe_equal("abc", "abcd"));
        assert!(safe_equal("", ""));
    }
}

use {
    rand::RngCore,
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
};

use crate::safe_equal;

/// Printable tag prepended to every issued key.
const KEY_TAG: &str = "fg_";

/// Length of the identifying prefix stored alongside the hash.
const PREFIX_LEN: usize = 11; // "fg_" + 8 hex chars

/// A freshly generated plaintext API key. Shown to the operator once at
/// issue time; only its hash and prefix survive.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub plaintext: String,
    pub prefix: String,
}

impl ApiKey {
    pub fn generate() -> Self {
        let mut raw = [0u8; 24];
        rand::rng().fill_bytes(&mut raw);
        let plaintext = format!("{KEY_TAG}{}", hex::encode(raw));
        let prefix = plaintext[..PREFIX_LEN].to_string();
        Self { plaintext, prefix }
    }
}

/// Hash-at-rest form of an API key: SHA-256 hex digest plus the prefix used
/// to pick a credential slot before doing any crypto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub key_hash: String,
    pub key_prefix: String,
}

impl KeyMaterial {
    pub fn from_plaintext(key: &ApiKey) -> Self {
        Self {
            key_hash: hash_key(&key.plaintext),
            key_prefix: key.prefix.clone(),
        }
    }

    /// Constant-time check of a presented plaintext key against the digest.
    pub fn verify(&self, presented: &str) -> bool {
        safe_equal(&hash_key(presented), &self.key_hash)
    }

    pub fn prefix_matches(&self, presented_prefix: &str) -> bool {
        safe_equal(presented_prefix, &self.key_prefix)
    }
}

fn hash_key(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// Random shared secret used for request signing.
pub fn generate_secret() -> String {
    let mut raw = [0u8; 32];
    rand::rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

/// Random session token issued on successful registration.
pub fn generate_session_token() -> String {
    let mut raw = [0u8; 32];
    rand::rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_carry_tag_and_prefix() {
        let key = ApiKey::generate();
        assert!(key.plaintext.starts_with(KEY_TAG));
        assert_eq!(key.prefix.len(), PREFIX_LEN);
        assert!(key.plaintext.starts_with(&key.prefix));
    }

    #[test]
    fn material_verifies_only_the_original_key() {
        let key = ApiKey::generate();
        let material = KeyMaterial::from_plaintext(&key);
        assert!(material.verify(&key.plaintext));
        assert!(!material.verify("fg_not_the_key"));
        assert!(material.prefix_matches(&key.prefix));
        assert!(!material.prefix_matches("fg_00000000"));
    }

    #[test]
    fn material_never_stores_plaintext() {
        let key = ApiKey::generate();
        let material = KeyMaterial::from_plaintext(&key);
        assert_ne!(material.key_hash, key.plaintext);
        assert_eq!(material.key_hash.len(), 64);
    }

    #[test]
    fn session_tokens_are_unique() {
        assert_ne!(generate_session_token(), generate_session_token());
    }
}

//! Two-slot credential rotation: active material stays valid while a
//! pending slot waits for the agent to confirm. Rotation can never lock an
//! agent out — an expired or mismatched completion leaves the active slot
//! untouched.

use std::time::{Duration, SystemTime};

use {
    serde::{Deserialize, Serialize},
    tracing::debug,
};

use fleetgate_protocol::{ROTATION_WINDOW_MS, Scope};

use crate::keys::{ApiKey, KeyMaterial, generate_secret};

/// Returned by `begin_rotation`; the plaintext halves go to the agent over
/// the already-authenticated channel and are never stored.
#[derive(Debug, Clone)]
pub struct RotationGrant {
    pub new_key: String,
    pub new_secret: String,
    pub rotation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RotationError {
    #[error("a rotation is already pending")]
    AlreadyPending,
    #[error("no rotation is pending")]
    NotPending,
    #[error("rotation id mismatch")]
    IdMismatch,
    #[error("rotation window expired")]
    Expired,
}

/// The pending half of a rotation. Durable alongside the active slot so an
/// agent mid-rotation survives a gateway restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRotation {
    pub material: KeyMaterial,
    pub secret: String,
    pub rotation_id: String,
    pub expires_at: SystemTime,
}

/// Everything the gateway knows about one agent's credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCredentials {
    pub agent_id: String,
    pub active: KeyMaterial,
    /// Shared secret for request signing (stored encrypted by the backing
    /// store; plaintext only in memory).
    pub secret: String,
    pub scopes: Vec<Scope>,
    /// Empty list means any source address is allowed.
    #[serde(default)]
    pub allowed_addresses: Vec<String>,
    /// At most one pending rotation at a time.
    #[serde(default)]
    pub pending: Option<PendingRotation>,
}

impl AgentCredentials {
    pub fn new(agent_id: impl Into<String>, key: &ApiKey, secret: String, scopes: Vec<Scope>) -> Self {
        Self {
            agent_id: agent_id.into(),
            active: KeyMaterial::from_plaintext(key),
            secret,
            scopes,
            allowed_addresses: Vec::new(),
            pending: None,
        }
    }

    /// Which slot, if any, the presented prefix selects. Expired pending
    /// slots are discarded on the way through.
    pub fn slot_for_prefix(&mut self, presented_prefix: &str) -> Option<CredentialSlot<'_>> {
        self.expire_pending();
        if self.active.prefix_matches(presented_prefix) {
            return Some(CredentialSlot {
                material: &self.active,
                secret: &self.secret,
                is_pending: false,
            });
        }
        if let Some(p) = self.pending.as_ref()
            && p.material.prefix_matches(presented_prefix)
        {
            return Some(CredentialSlot {
                material: &p.material,
                secret: &p.secret,
                is_pending: true,
            });
        }
        None
    }

    pub fn address_allowed(&self, addr: &str) -> bool {
        self.allowed_addresses.is_empty() || self.allowed_addresses.iter().any(|a| a == addr)
    }

    /// Mint new credentials into the pending slot. The active slot remains
    /// valid for the whole window.
    pub fn begin_rotation(&mut self) -> Result<RotationGrant, RotationError> {
        self.expire_pending();
        if self.pending.is_some() {
            return Err(RotationError::AlreadyPending);
        }
        let key = ApiKey::generate();
        let secret = generate_secret();
        let rotation_id = uuid::Uuid::new_v4().to_string();
        self.pending = Some(PendingRotation {
            material: KeyMaterial::from_plaintext(&key),
            secret: secret.clone(),
            rotation_id: rotation_id.clone(),
            expires_at: SystemTime::now() + Duration::from_millis(ROTATION_WINDOW_MS),
        });
        debug!(agent_id = %self.agent_id, rotation_id = %rotation_id, "rotation started");
        Ok(RotationGrant {
            new_key: key.plaintext,
            new_secret: secret,
            rotation_id,
        })
    }

    /// Promote pending → active. Only a matching, unexpired rotation id
    /// succeeds; every failure leaves the active slot untouched.
    pub fn complete_rotation(&mut self, rotation_id: &str) -> Result<(), RotationError> {
        if let Some(p) = self.pending.as_ref()
            && p.expires_at <= SystemTime::now()
        {
            debug!(agent_id = %self.agent_id, "pending rotation expired, discarding");
            self.pending = None;
            return Err(RotationError::Expired);
        }
        let pending = self.pending.as_ref().ok_or(RotationError::NotPending)?;
        if pending.rotation_id != rotation_id {
            return Err(RotationError::IdMismatch);
        }
        let pending = self.pending.take().ok_or(RotationError::NotPending)?;
        self.active = pending.material;
        self.secret = pending.secret;
        debug!(agent_id = %self.agent_id, "rotation completed");
        Ok(())
    }

    /// Drop an in-flight rotation, keeping the active slot.
    pub fn cancel_rotation(&mut self) {
        self.pending = None;
    }

    fn expire_pending(&mut self) {
        if let Some(p) = self.pending.as_ref()
            && p.expires_at <= SystemTime::now()
        {
            debug!(agent_id = %self.agent_id, "pending rotation expired, discarding");
            self.pending = None;
        }
    }
}

/// A borrowed view of whichever slot matched the presented key prefix.
pub struct CredentialSlot<'a> {
    pub material: &'a KeyMaterial,
    pub secret: &'a str,
    pub is_pending: bool,
}

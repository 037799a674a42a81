//! API keys binding gateway callers to exactly one sandbox.
//!
//! - Secrets are 32 random bytes from `OsRng`, hex-encoded
//! - One key per sandbox; issuing again replaces the previous key
//! - Comparison is constant-time
//! - Keys live in memory only and are never logged

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

use crate::error::GatewayError;
use crate::sandbox::SandboxId;

/// A stored key.
#[derive(Clone)]
pub struct ApiKeyRecord {
    pub secret: String,
    pub sandbox_id: SandboxId,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn matches(&self, secret: &str) -> bool {
        self.secret.as_bytes().ct_eq(secret.as_bytes()).into()
    }
}

impl std::fmt::Debug for ApiKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyRecord")
            .field("secret", &"<redacted>")
            .field("sandbox_id", &self.sandbox_id)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// In-memory key store shared by the control API and the gateway.
#[derive(Clone, Default)]
pub struct ApiKeyStore {
    /// sandbox_id -> record.
    keys: Arc<RwLock<HashMap<SandboxId, ApiKeyRecord>>>,
}

impl ApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate and store a key for `sandbox_id`, optionally time-limited.
    pub async fn issue(&self, sandbox_id: &SandboxId, ttl: Option<Duration>) -> String {
        let now = Utc::now();
        let secret = generate_secret();
        let expires_at = ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok().map(|d| now + d));
        self.insert_record(ApiKeyRecord {
            secret: secret.clone(),
            sandbox_id: sandbox_id.clone(),
            created_at: now,
            expires_at,
        })
        .await;
        tracing::debug!(sandbox_id = %sandbox_id, expires_at = ?expires_at, "Issued API key");
        secret
    }

    /// Store a prepared record, replacing any key the sandbox already had.
    pub async fn insert_record(&self, record: ApiKeyRecord) {
        self.keys
            .write()
            .await
            .insert(record.sandbox_id.clone(), record);
    }

    /// Check that `secret` is the key bound to `sandbox_id`.
    pub async fn authorize(&self, sandbox_id: &SandboxId, secret: &str) -> Result<(), GatewayError> {
        let keys = self.keys.read().await;
        let record = keys
            .get(sandbox_id)
            .filter(|record| record.matches(secret))
            .ok_or_else(|| GatewayError::Unauthorized {
                reason: "invalid API key for this sandbox".to_string(),
            })?;
        if record.is_expired(Utc::now()) {
            return Err(GatewayError::Expired {
                sandbox_id: sandbox_id.clone(),
            });
        }
        Ok(())
    }

    /// Resolve the sandbox a key belongs to.
    pub async fn authenticate(&self, secret: &str) -> Result<SandboxId, GatewayError> {
        let keys = self.keys.read().await;
        // Compare against every record so timing does not reveal the match position.
        let mut found: Option<&ApiKeyRecord> = None;
        for record in keys.values() {
            if record.matches(secret) {
                found = Some(record);
            }
        }
        let record = found.ok_or_else(|| GatewayError::Unauthorized {
            reason: "unknown API key".to_string(),
        })?;
        if record.is_expired(Utc::now()) {
            return Err(GatewayError::Expired {
                sandbox_id: record.sandbox_id.clone(),
            });
        }
        Ok(record.sandbox_id.clone())
    }

    /// Remove the key for a sandbox. Returns whether one existed.
    pub async fn revoke(&self, sandbox_id: &SandboxId) -> bool {
        let removed = self.keys.write().await.remove(sandbox_id).is_some();
        if removed {
            tracing::debug!(sandbox_id = %sandbox_id, "Revoked API key");
        }
        removed
    }

    pub async fn active_count(&self) -> usize {
        self.keys.read().await.len()
    }

    /// Drop every expired key, returning how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut keys = self.keys.write().await;
        let before = keys.len();
        keys.retain(|_, record| !record.is_expired(now));
        before - keys.len()
    }
}

pub(crate) fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

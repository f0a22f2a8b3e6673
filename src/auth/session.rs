//! Session tokens: HS256-signed claims with stateful JTI revocation.
//!
//! The signing key is HKDF-SHA-256 over the vault master key with info
//! `clauth-session-v1`; it is cached in memory and zeroized when the vault
//! locks. Verification requires the `clauth` issuer, an unexpired `exp`,
//! and a JTI absent from the revocation store. Revocations are visible
//! in memory immediately and persisted by a single serialized writer.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hkdf::Hkdf;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::storage::atomic_write_json;
use crate::vault::Vault;
use crate::{Error, Result};

/// Issuer claim on every session token.
pub const SESSION_ISSUER: &str = "clauth";
/// HKDF info string for the session-signing subkey.
const SESSION_KEY_INFO: &[u8] = b"clauth-session-v1";

/// Claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Skill id the session asserts.
    pub sub: String,
    /// Always [`SESSION_ISSUER`].
    pub iss: String,
    /// Issued-at (Unix seconds).
    pub iat: i64,
    /// Expiry (Unix seconds).
    pub exp: i64,
    /// Token id, the revocation handle.
    pub jti: String,
    /// Optional scope restriction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// A revoked session, kept until the claim itself would have expired.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRevocation {
    /// Revoked token id.
    pub jti: String,
    /// When the revocation happened.
    pub revoked_at: DateTime<Utc>,
    /// The claim's expiry; the entry is pruned after this.
    pub expires_at: DateTime<Utc>,
    /// Optional operator-supplied reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RevocationFile {
    revoked: Vec<SessionRevocation>,
}

/// Issues, verifies, and revokes session tokens.
pub struct SessionEngine {
    vault: Arc<Vault>,
    path: PathBuf,
    signing_key: Mutex<Option<Zeroizing<Vec<u8>>>>,
    revoked: DashMap<String, SessionRevocation>,
    persist_gate: tokio::sync::Mutex<()>,
}

impl SessionEngine {
    /// Load the engine, pruning revocations whose claims have expired.
    ///
    /// # Errors
    ///
    /// Fails when an existing revocation file cannot be parsed.
    pub fn load(path: PathBuf, vault: Arc<Vault>) -> Result<Self> {
        let revoked = DashMap::new();
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let file: RevocationFile = serde_json::from_str(&raw)
                .map_err(|e| Error::Validation(format!("Malformed revocation file: {e}")))?;
            let now = Utc::now();
            for entry in file.revoked {
                if entry.expires_at > now {
                    revoked.insert(entry.jti.clone(), entry);
                }
            }
        }
        debug!(revoked = revoked.len(), "Session engine loaded");
        Ok(Self {
            vault,
            path,
            signing_key: Mutex::new(None),
            revoked,
            persist_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Issue a session token for `skill_id` valid for `ttl`.
    ///
    /// # Errors
    ///
    /// `ACCESS_DENIED` when the vault is locked.
    pub fn issue(&self, skill_id: &str, scope: Option<String>, ttl: Duration) -> Result<String> {
        let skill_id = skill_id.trim();
        if skill_id.is_empty() {
            return Err(Error::Validation("Skill id must not be empty".into()));
        }
        let key = self.signing_key()?;
        let now = Utc::now();
        let claims = SessionClaims {
            sub: skill_id.to_string(),
            iss: SESSION_ISSUER.to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + ttl.as_secs() as i64,
            jti: uuid::Uuid::new_v4().to_string(),
            scope,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&key),
        )
        .map_err(|e| Error::Internal(format!("Failed to sign session token: {e}")))?;
        info!(skill_id = %skill_id, jti = %claims.jti, "Session token issued");
        Ok(token)
    }

    /// Verify a session token: signature, issuer, expiry, and revocation.
    /// Any failure yields no claims.
    #[must_use]
    pub fn verify(&self, token: &str) -> Option<SessionClaims> {
        let claims = self.parse(token, false)?;
        if self.revoked.contains_key(&claims.jti) {
            debug!(jti = %claims.jti, "Rejected revoked session token");
            return None;
        }
        Some(claims)
    }

    /// Revoke a session token. The claim is parsed ignoring expiry so that
    /// an already-expired token can still be listed explicitly; the revoked
    /// JTI is visible to verifiers before the flush completes.
    ///
    /// # Errors
    ///
    /// `UNAUTHORIZED` when the token's signature does not check out.
    pub async fn revoke_token(&self, token: &str, reason: Option<String>) -> Result<String> {
        let claims = self
            .parse(token, true)
            .ok_or_else(|| Error::Unauthorized("Invalid session token".into()))?;
        let expires_at = DateTime::<Utc>::from_timestamp(claims.exp, 0)
            .unwrap_or_else(Utc::now);

        self.revoked.insert(
            claims.jti.clone(),
            SessionRevocation {
                jti: claims.jti.clone(),
                revoked_at: Utc::now(),
                expires_at,
                reason,
            },
        );
        self.persist().await?;
        info!(jti = %claims.jti, "Session token revoked");
        Ok(claims.jti)
    }

    /// Whether a JTI is currently revoked.
    #[must_use]
    pub fn is_revoked(&self, jti: &str) -> bool {
        self.revoked.contains_key(jti)
    }

    /// Zero the cached signing key. Called when the vault locks.
    pub fn invalidate_cache(&self) {
        *self.signing_key.lock() = None;
        debug!("Session signing key cache invalidated");
    }

    /// Parse and signature-check a token, optionally accepting expired
    /// claims (revocation path only).
    fn parse(&self, token: &str, allow_expired: bool) -> Option<SessionClaims> {
        let key = self.signing_key().ok()?;
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[SESSION_ISSUER]);
        validation.validate_exp = !allow_expired;
        // `exp > now` exactly; no clock-skew grace for revocable tokens.
        validation.leeway = 0;
        jsonwebtoken::decode::<SessionClaims>(token, &DecodingKey::from_secret(&key), &validation)
            .map(|data| data.claims)
            .ok()
    }

    /// HKDF-SHA-256(master, info=`clauth-session-v1`), cached.
    fn signing_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        let mut cache = self.signing_key.lock();
        if let Some(key) = cache.as_ref() {
            return Ok(key.clone());
        }
        let master = self.vault.master_key()?;
        let hkdf = Hkdf::<Sha256>::new(None, master.as_ref());
        let mut okm = Zeroizing::new(vec![0u8; 32]);
        hkdf.expand(SESSION_KEY_INFO, okm.as_mut())
            .map_err(|e| Error::Internal(format!("Session key derivation failed: {e}")))?;
        *cache = Some(okm.clone());
        Ok(okm)
    }

    /// Persist the revocation store. A single writer holds the gate; the
    /// in-memory index is already current before anyone waits here.
    async fn persist(&self) -> Result<()> {
        let _gate = self.persist_gate.lock().await;
        let now = Utc::now();
        // Prune on persist: spent revocations are dead weight.
        self.revoked.retain(|_, entry| entry.expires_at > now);
        let file = RevocationFile {
            revoked: self
                .revoked
                .iter()
                .map(|entry| entry.value().clone())
                .collect(),
        };
        atomic_write_json(&self.path, &file)
    }
}

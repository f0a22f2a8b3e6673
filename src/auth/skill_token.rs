//! Skill bearer tokens.
//!
//! A token is 32 random bytes, URL-safe base64. The plaintext is returned
//! exactly once at issue time; the store keeps only a peppered SHA-256
//! hash, so a leaked `skill-auth.json` is not a credential leak. Hash
//! comparisons are constant-time over equal-length digests.

use std::fs;
use std::path::PathBuf;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::storage::atomic_write_json;
use crate::{Error, Result};

/// Stored record for one skill's token. Only the hash survives issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillTokenRecord {
    /// Owning skill.
    pub skill_id: String,
    /// Hex-encoded peppered SHA-256 of the token.
    pub token_hash: String,
    /// Revoked tokens stay on disk, inactive.
    pub active: bool,
    /// Issue time.
    pub created_at: DateTime<Utc>,
    /// Last rotation or revocation.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    tokens: Vec<SkillTokenRecord>,
}

/// Issues and verifies skill bearer tokens.
pub struct SkillTokenEngine {
    path: PathBuf,
    pepper: Vec<u8>,
    records: Mutex<Vec<SkillTokenRecord>>,
}

impl SkillTokenEngine {
    /// Load the engine from `skill-auth.json` with the deployment pepper.
    ///
    /// # Errors
    ///
    /// Fails when an existing file cannot be parsed.
    pub fn load(path: PathBuf, pepper: Vec<u8>) -> Result<Self> {
        let records = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let file: TokenFile = serde_json::from_str(&raw)
                .map_err(|e| Error::Validation(format!("Malformed skill-auth file: {e}")))?;
            file.tokens
        } else {
            Vec::new()
        };
        debug!(tokens = records.len(), "Skill token engine loaded");
        Ok(Self {
            path,
            pepper,
            records: Mutex::new(records),
        })
    }

    /// Issue (or rotate) the token for `skill_id`, returning the plaintext.
    /// This is the only moment the plaintext exists outside the caller.
    ///
    /// # Errors
    ///
    /// `VALIDATION_ERROR` on an empty skill id.
    pub fn issue(&self, skill_id: &str) -> Result<String> {
        let skill_id = skill_id.trim();
        if skill_id.is_empty() {
            return Err(Error::Validation("Skill id must not be empty".into()));
        }

        let raw: [u8; 32] = rand::rng().random();
        let token = URL_SAFE_NO_PAD.encode(raw);
        let token_hash = self.hash(&token);
        let now = Utc::now();

        let mut records = self.records.lock();
        if let Some(existing) = records.iter_mut().find(|r| r.skill_id == skill_id) {
            existing.token_hash = token_hash;
            existing.active = true;
            existing.updated_at = now;
        } else {
            records.push(SkillTokenRecord {
                skill_id: skill_id.to_string(),
                token_hash,
                active: true,
                created_at: now,
                updated_at: now,
            });
        }
        self.persist(&records)?;
        info!(skill_id = %skill_id, "Skill token issued");
        Ok(token)
    }

    /// Verify `token` against the record for `skill_id`.
    #[must_use]
    pub fn verify(&self, skill_id: &str, token: &str) -> bool {
        let expected = self.hash(token);
        let records = self.records.lock();
        records
            .iter()
            .filter(|r| r.active && r.skill_id == skill_id)
            .any(|r| hashes_match(&r.token_hash, &expected))
    }

    /// Identify which skill presented `token`, scanning active records.
    #[must_use]
    pub fn identify(&self, token: &str) -> Option<String> {
        let presented = self.hash(token);
        let records = self.records.lock();
        records
            .iter()
            .filter(|r| r.active)
            .find(|r| hashes_match(&r.token_hash, &presented))
            .map(|r| r.skill_id.clone())
    }

    /// Deactivate the skill's token.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` when the skill has no active token.
    pub fn revoke(&self, skill_id: &str) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.active && r.skill_id == skill_id)
            .ok_or_else(|| Error::NotFound(format!("No active token for skill {skill_id}")))?;
        record.active = false;
        record.updated_at = Utc::now();
        self.persist(&records)?;
        info!(skill_id = %skill_id, "Skill token revoked");
        Ok(())
    }

    /// Token records without any secret material (hashes included — they
    /// are already one-way and peppered).
    #[must_use]
    pub fn list(&self) -> Vec<SkillTokenRecord> {
        self.records.lock().clone()
    }

    /// `SHA-256(pepper ∥ ":" ∥ token)`, hex.
    fn hash(&self, token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.pepper);
        hasher.update(b":");
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn persist(&self, records: &[SkillTokenRecord]) -> Result<()> {
        let file = TokenFile {
            tokens: records.to_vec(),
        };
        atomic_write_json(&self.path, &file)
    }
}

/// Constant-time comparison of two hex digests. Unequal lengths are
/// rejected up front.
fn hashes_match(stored: &str, presented: &str) -> bool {
    let (Ok(stored), Ok(presented)) = (hex::decode(stored), hex::decode(presented)) else {
        return false;
    };
    if stored.len() != presented.len() {
        return false;
    }
    stored.ct_eq(&presented).into()
}

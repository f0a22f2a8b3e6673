//! Encrypted credential vault.
//!
//! Credentials live in a single AEAD envelope on disk (`vault.enc`). The
//! 32-byte master key is derived from the operator passphrase and exists
//! only in memory while the vault is unlocked; `lock()` zeroizes it. Every
//! write re-encrypts the full record and lands atomically.
//!
//! The envelope's KDF descriptor is authoritative: an unlock always derives
//! with the algorithm, parameters, and salt recorded on disk, so process
//! configuration drift can never silently re-derive a different key and
//! lock the operator out.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::{derive_key, generate_salt, Envelope, KdfAlgorithm, KdfDescriptor, KdfParams, KEY_LEN};
use crate::storage::atomic_write;
use crate::{Error, Result};

/// Metadata keys the core interprets; everything else is preserved opaquely.
pub mod metadata_keys {
    /// `bearer`, `api-key`, or `basic`.
    pub const AUTH_TYPE: &str = "authType";
    /// Header name for `api-key` credentials.
    pub const HEADER_NAME: &str = "headerName";
    /// Comma-separated host patterns overriding the provider default list.
    pub const ALLOWED_HOSTS: &str = "allowedHosts";
}

/// A stored credential. The secret is only ever held in memory while the
/// vault is unlocked and is never serialized unencrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    /// Unique opaque identifier (trimmed).
    pub handle: String,
    /// Normalized lowercase provider name.
    pub provider: String,
    /// Opaque secret material.
    pub secret: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Absolute expiry; pruned lazily on read and list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Free-form string metadata; recognized keys in [`metadata_keys`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl Credential {
    /// Whether the credential has passed its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// Look up a recognized metadata key.
    #[must_use]
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key).map(String::as_str)
    }
}

/// A credential record without its secret, for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialMetadata {
    /// Credential handle.
    pub handle: String,
    /// Provider name.
    pub provider: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Metadata map.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl From<&Credential> for CredentialMetadata {
    fn from(c: &Credential) -> Self {
        Self {
            handle: c.handle.clone(),
            provider: c.provider.clone(),
            created_at: c.created_at,
            expires_at: c.expires_at,
            metadata: c.metadata.clone(),
        }
    }
}

/// In-memory unlocked state: the master key plus the envelope's KDF identity.
struct Unlocked {
    key: Zeroizing<[u8; KEY_LEN]>,
    algorithm: KdfAlgorithm,
    params: KdfParams,
    salt: Vec<u8>,
    record: HashMap<String, Credential>,
}

/// Encrypted credential store.
pub struct Vault {
    path: PathBuf,
    initial_params: KdfParams,
    initial_salt: Option<Vec<u8>>,
    requested_algorithm: Option<KdfAlgorithm>,
    state: Mutex<Option<Unlocked>>,
}

impl Vault {
    /// Create a vault handle over `path`. `initial_params` and
    /// `initial_salt` only apply to a fresh vault; an existing envelope's
    /// KDF descriptor always wins.
    #[must_use]
    pub fn new(
        path: PathBuf,
        initial_params: KdfParams,
        initial_salt: Option<Vec<u8>>,
        requested_algorithm: Option<KdfAlgorithm>,
    ) -> Self {
        Self {
            path,
            initial_params,
            initial_salt,
            requested_algorithm,
            state: Mutex::new(None),
        }
    }

    /// Whether the master key is currently in memory.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Derive the master key and load the credential record.
    ///
    /// On a tampered or malformed envelope this fails closed with
    /// `VALIDATION_ERROR` and never modifies the file.
    ///
    /// # Errors
    ///
    /// `VALIDATION_ERROR` on short passphrases, malformed envelopes, or
    /// decryption failure.
    pub fn unlock(&self, passphrase: &str) -> Result<()> {
        let unlocked = if self.path.exists() {
            let raw = fs::read(&self.path)?;
            let envelope: Envelope = serde_json::from_slice(&raw)
                .map_err(|e| Error::Validation(format!("Malformed vault envelope: {e}")))?;
            let descriptor = envelope
                .kdf
                .clone()
                .ok_or_else(|| Error::Validation("Vault envelope missing KDF descriptor".into()))?;

            // The on-disk descriptor overrides process configuration.
            let salt = descriptor.salt_bytes()?;
            let (key, algorithm) = derive_key(
                passphrase,
                &salt,
                &descriptor.params,
                Some(descriptor.algorithm),
            )?;
            let plaintext = envelope.open(&key)?;
            let record: HashMap<String, Credential> = serde_json::from_slice(&plaintext)
                .map_err(|e| Error::Validation(format!("Malformed vault record: {e}")))?;

            debug!(credentials = record.len(), kdf = %algorithm, "Vault unlocked");
            Unlocked {
                key,
                algorithm,
                params: descriptor.params,
                salt,
                record,
            }
        } else {
            let salt = self
                .initial_salt
                .clone()
                .unwrap_or_else(|| generate_salt().to_vec());
            let (key, algorithm) = derive_key(
                passphrase,
                &salt,
                &self.initial_params,
                self.requested_algorithm,
            )?;
            let unlocked = Unlocked {
                key,
                algorithm,
                params: self.initial_params.clone(),
                salt,
                record: HashMap::new(),
            };
            self.persist(&unlocked)?;
            info!(path = %self.path.display(), kdf = %algorithm, "Initialized fresh vault");
            unlocked
        };

        *self.state.lock() = Some(unlocked);
        Ok(())
    }

    /// Drop the master key and in-memory record. The key buffer is zeroized.
    pub fn lock(&self) {
        *self.state.lock() = None;
        debug!("Vault locked");
    }

    /// Store (or overwrite) a credential.
    ///
    /// # Errors
    ///
    /// `ACCESS_DENIED` when locked; `VALIDATION_ERROR` on empty fields.
    pub fn store_credential(
        &self,
        handle: &str,
        provider: &str,
        secret: &str,
        ttl: Option<Duration>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<CredentialMetadata> {
        let handle = handle.trim();
        let provider = provider.trim().to_lowercase();
        if handle.is_empty() {
            return Err(Error::Validation("Credential handle must not be empty".into()));
        }
        if provider.is_empty() {
            return Err(Error::Validation("Credential provider must not be empty".into()));
        }
        if secret.is_empty() {
            return Err(Error::Validation("Credential secret must not be empty".into()));
        }

        let now = Utc::now();
        let credential = Credential {
            handle: handle.to_string(),
            provider,
            secret: secret.to_string(),
            created_at: now,
            expires_at: ttl.and_then(|d| chrono::TimeDelta::from_std(d).ok().map(|d| now + d)),
            metadata,
        };
        let meta = CredentialMetadata::from(&credential);

        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(Self::locked)?;
        state.record.insert(credential.handle.clone(), credential);
        self.persist(state)?;
        Ok(meta)
    }

    /// Fetch a credential by handle, optionally asserting its provider.
    ///
    /// Lazily prunes an expired credential before reporting `NOT_FOUND`.
    ///
    /// # Errors
    ///
    /// `ACCESS_DENIED` when locked or on provider mismatch; `NOT_FOUND` for
    /// unknown or expired handles.
    pub fn get_credential(&self, handle: &str, provider: Option<&str>) -> Result<Credential> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(Self::locked)?;

        let now = Utc::now();
        let Some(credential) = state.record.get(handle) else {
            return Err(Error::NotFound(format!("Unknown credential handle: {handle}")));
        };

        if credential.is_expired(now) {
            state.record.remove(handle);
            self.persist(state)?;
            debug!(handle = %handle, "Pruned expired credential");
            return Err(Error::NotFound(format!("Credential expired: {handle}")));
        }

        if let Some(expected) = provider {
            let expected = expected.trim().to_lowercase();
            if credential.provider != expected {
                return Err(Error::AccessDenied(format!(
                    "Credential {handle} belongs to provider {}, not {expected}",
                    credential.provider
                )));
            }
        }

        Ok(credential.clone())
    }

    /// Replace a credential's secret (used by the OAuth refresher).
    ///
    /// # Errors
    ///
    /// `ACCESS_DENIED` when locked; `NOT_FOUND` for unknown handles.
    pub fn update_credential_secret(&self, handle: &str, new_secret: &str) -> Result<()> {
        if new_secret.is_empty() {
            return Err(Error::Validation("New secret must not be empty".into()));
        }
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(Self::locked)?;
        let credential = state
            .record
            .get_mut(handle)
            .ok_or_else(|| Error::NotFound(format!("Unknown credential handle: {handle}")))?;
        credential.secret = new_secret.to_string();
        self.persist(state)?;
        Ok(())
    }

    /// Remove a credential.
    ///
    /// # Errors
    ///
    /// `ACCESS_DENIED` when locked; `NOT_FOUND` for unknown handles.
    pub fn delete_credential(&self, handle: &str) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(Self::locked)?;
        if state.record.remove(handle).is_none() {
            return Err(Error::NotFound(format!("Unknown credential handle: {handle}")));
        }
        self.persist(state)?;
        Ok(())
    }

    /// List all credential metadata (secrets omitted), pruning expired
    /// entries along the way.
    ///
    /// # Errors
    ///
    /// `ACCESS_DENIED` when locked.
    pub fn list_credential_metadata(&self) -> Result<Vec<CredentialMetadata>> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(Self::locked)?;

        let now = Utc::now();
        let expired: Vec<String> = state
            .record
            .values()
            .filter(|c| c.is_expired(now))
            .map(|c| c.handle.clone())
            .collect();
        if !expired.is_empty() {
            for handle in &expired {
                state.record.remove(handle);
            }
            self.persist(state)?;
            debug!(count = expired.len(), "Pruned expired credentials on list");
        }

        let mut out: Vec<CredentialMetadata> =
            state.record.values().map(CredentialMetadata::from).collect();
        out.sort_by(|a, b| a.handle.cmp(&b.handle));
        Ok(out)
    }

    /// Copy of the in-memory master key, for subsystems deriving subkeys.
    /// The returned buffer zeroizes on drop.
    ///
    /// # Errors
    ///
    /// `ACCESS_DENIED` when locked.
    pub fn master_key(&self) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let guard = self.state.lock();
        let state = guard.as_ref().ok_or_else(Self::locked)?;
        Ok(Zeroizing::new(*state.key))
    }

    /// Re-read the envelope from disk with the in-memory key, replacing the
    /// record atomically.
    ///
    /// # Errors
    ///
    /// `ACCESS_DENIED` when locked; `VALIDATION_ERROR` on a damaged file.
    pub fn reload(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(Self::locked)?;

        let raw = fs::read(&self.path)?;
        let envelope: Envelope = serde_json::from_slice(&raw)
            .map_err(|e| Error::Validation(format!("Malformed vault envelope: {e}")))?;
        let plaintext = envelope.open(&state.key)?;
        let record: HashMap<String, Credential> = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Validation(format!("Malformed vault record: {e}")))?;
        state.record = record;
        Ok(())
    }

    fn locked() -> Error {
        Error::AccessDenied("Vault is locked".into())
    }

    /// Re-encrypt the full record and write atomically, carrying the KDF
    /// descriptor of the key currently in memory.
    fn persist(&self, state: &Unlocked) -> Result<()> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&state.record)
                .map_err(|e| Error::Internal(format!("Failed to serialize vault record: {e}")))?,
        );
        let descriptor =
            KdfDescriptor::new(state.algorithm, state.params.clone(), &state.salt);
        let envelope = Envelope::seal(&state.key, &plaintext, Some(descriptor))?;
        let contents = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| Error::Internal(format!("Failed to serialize vault envelope: {e}")))?;
        atomic_write(&self.path, &contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSPHRASE: &str = "correct horse battery staple";

    fn fast_params() -> KdfParams {
        KdfParams {
            memory: 8 * 1024,
            iterations: 1,
            parallelism: 1,
            tag_length: 32,
        }
    }

    fn open_vault(dir: &std::path::Path) -> Vault {
        Vault::new(dir.join("vault.enc"), fast_params(), None, None)
    }

    #[test]
    fn operations_fail_when_locked() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(dir.path());

        let err = vault.get_credential("any", None).unwrap_err();
        assert_eq!(err.code(), "ACCESS_DENIED");
        assert_eq!(
            vault.store_credential("h", "p", "s", None, None).unwrap_err().code(),
            "ACCESS_DENIED"
        );
        assert_eq!(vault.master_key().unwrap_err().code(), "ACCESS_DENIED");
    }

    #[test]
    fn store_and_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(dir.path());
        vault.unlock(PASSPHRASE).unwrap();

        let mut metadata = HashMap::new();
        metadata.insert("authType".to_string(), "bearer".to_string());
        vault
            .store_credential("github-main", "GitHub", "ghp_x", None, Some(metadata))
            .unwrap();

        let credential = vault.get_credential("github-main", None).unwrap();
        assert_eq!(credential.secret, "ghp_x");
        // Provider normalized to lowercase
        assert_eq!(credential.provider, "github");
        assert_eq!(credential.meta(metadata_keys::AUTH_TYPE), Some("bearer"));
    }

    #[test]
    fn unknown_handle_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(dir.path());
        vault.unlock(PASSPHRASE).unwrap();
        assert_eq!(vault.get_credential("nope", None).unwrap_err().code(), "NOT_FOUND");
    }

    #[test]
    fn provider_mismatch_is_access_denied() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(dir.path());
        vault.unlock(PASSPHRASE).unwrap();
        vault.store_credential("h", "github", "s", None, None).unwrap();

        let err = vault.get_credential("h", Some("openai")).unwrap_err();
        assert_eq!(err.code(), "ACCESS_DENIED");
    }

    #[test]
    fn expired_credential_is_pruned_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(dir.path());
        vault.unlock(PASSPHRASE).unwrap();
        vault
            .store_credential("ephemeral", "github", "s", Some(Duration::ZERO), None)
            .unwrap();

        let err = vault.get_credential("ephemeral", None).unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        // Gone for good, not just hidden
        assert_eq!(vault.list_credential_metadata().unwrap().len(), 0);
    }

    #[test]
    fn list_omits_secrets_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(dir.path());
        vault.unlock(PASSPHRASE).unwrap();
        vault.store_credential("keep", "github", "s1", None, None).unwrap();
        vault
            .store_credential("drop", "github", "s2", Some(Duration::ZERO), None)
            .unwrap();

        let listed = vault.list_credential_metadata().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].handle, "keep");
        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains("s1"));
    }

    #[test]
    fn persists_across_unlock_cycles() {
        let dir = tempfile::tempdir().unwrap();
        {
            let vault = open_vault(dir.path());
            vault.unlock(PASSPHRASE).unwrap();
            vault.store_credential("h", "github", "secret", None, None).unwrap();
            vault.lock();
        }
        let vault = open_vault(dir.path());
        vault.unlock(PASSPHRASE).unwrap();
        assert_eq!(vault.get_credential("h", None).unwrap().secret, "secret");
    }

    #[test]
    fn envelope_kdf_survives_config_drift() {
        let dir = tempfile::tempdir().unwrap();
        {
            let vault = open_vault(dir.path());
            vault.unlock(PASSPHRASE).unwrap();
            vault.store_credential("h", "github", "s", None, None).unwrap();
        }

        // Reopen with drifted process configuration; the stored descriptor
        // must still decrypt the vault and be preserved on the next write.
        let drifted = KdfParams {
            memory: 32 * 1024,
            iterations: 2,
            parallelism: 2,
            tag_length: 32,
        };
        let vault = Vault::new(dir.path().join("vault.enc"), drifted, None, None);
        vault.unlock(PASSPHRASE).unwrap();
        vault.store_credential("h2", "github", "s2", None, None).unwrap();

        let raw = fs::read(dir.path().join("vault.enc")).unwrap();
        let envelope: Envelope = serde_json::from_slice(&raw).unwrap();
        let descriptor = envelope.kdf.unwrap();
        assert_eq!(descriptor.params, fast_params());
    }

    #[test]
    fn malformed_envelope_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        fs::write(&path, b"{ not json").unwrap();
        let before = fs::read(&path).unwrap();

        let vault = Vault::new(path.clone(), fast_params(), None, None);
        let err = vault.unlock(PASSPHRASE).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(!vault.is_unlocked());
        // File left byte-identical
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn wrong_passphrase_fails_and_preserves_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let vault = open_vault(dir.path());
            vault.unlock(PASSPHRASE).unwrap();
        }
        let path = dir.path().join("vault.enc");
        let before = fs::read(&path).unwrap();

        let vault = open_vault(dir.path());
        let err = vault.unlock("a completely different phrase").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn update_secret_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(dir.path());
        vault.unlock(PASSPHRASE).unwrap();
        vault.store_credential("h", "github", "old", None, None).unwrap();
        vault.update_credential_secret("h", "new").unwrap();
        assert_eq!(vault.get_credential("h", None).unwrap().secret, "new");

        assert_eq!(
            vault.update_credential_secret("missing", "x").unwrap_err().code(),
            "NOT_FOUND"
        );
    }

    #[test]
    fn delete_removes_and_errors_on_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(dir.path());
        vault.unlock(PASSPHRASE).unwrap();
        vault.store_credential("h", "github", "s", None, None).unwrap();

        vault.delete_credential("h").unwrap();
        assert_eq!(vault.delete_credential("h").unwrap_err().code(), "NOT_FOUND");
    }

    #[test]
    fn reload_picks_up_external_writes() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(dir.path());
        vault.unlock(PASSPHRASE).unwrap();
        vault.store_credential("h", "github", "s", None, None).unwrap();

        // A second handle over the same file writes a new credential
        let other = open_vault(dir.path());
        other.unlock(PASSPHRASE).unwrap();
        other.store_credential("h2", "github", "s2", None, None).unwrap();

        // Not visible until reload replaces the in-memory record
        assert_eq!(vault.get_credential("h2", None).unwrap_err().code(), "NOT_FOUND");
        vault.reload().unwrap();
        assert_eq!(vault.get_credential("h2", None).unwrap().secret, "s2");
    }

    #[test]
    fn secret_never_on_disk_in_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(dir.path());
        vault.unlock(PASSPHRASE).unwrap();
        vault
            .store_credential("h", "github", "super-secret-value", None, None)
            .unwrap();

        let raw = fs::read(dir.path().join("vault.enc")).unwrap();
        let raw_str = String::from_utf8_lossy(&raw);
        assert!(!raw_str.contains("super-secret-value"));
    }
}

//! Authenticated-encryption envelope for at-rest secrets.
//!
//! On-disk JSON shape:
//! - `version`: 1
//! - `cipher`: "AES-256-GCM"
//! - `iv`: base64, 12 bytes
//! - `tag`: base64, 16 bytes
//! - `ciphertext`: base64
//! - `kdf`: { algorithm, params, salt } — present on the vault envelope,
//!   absent on envelopes keyed by a derived subkey
//! - `updatedAt`: RFC 3339
//!
//! The KDF descriptor in a stored envelope is the source of truth for key
//! derivation: once written it must be preserved across reloads even when
//! process configuration drifts.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{KdfAlgorithm, KdfParams, IV_LEN, KEY_LEN, TAG_LEN};
use crate::{Error, Result};

/// Envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;
/// The only supported cipher.
pub const ENVELOPE_CIPHER: &str = "AES-256-GCM";

/// Describes how the envelope key was derived from the passphrase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfDescriptor {
    /// Algorithm actually used for derivation.
    pub algorithm: KdfAlgorithm,
    /// Cost parameters.
    pub params: KdfParams,
    /// Base64-encoded 16-byte salt.
    pub salt: String,
}

impl KdfDescriptor {
    /// Build a descriptor from raw salt bytes.
    #[must_use]
    pub fn new(algorithm: KdfAlgorithm, params: KdfParams, salt: &[u8]) -> Self {
        Self {
            algorithm,
            params,
            salt: B64.encode(salt),
        }
    }

    /// Decode the salt bytes.
    ///
    /// # Errors
    ///
    /// Fails with `VALIDATION_ERROR` on malformed base64.
    pub fn salt_bytes(&self) -> Result<Vec<u8>> {
        B64.decode(&self.salt)
            .map_err(|e| Error::Validation(format!("Invalid KDF salt encoding: {e}")))
    }
}

/// On-disk AEAD envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Format version (always 1).
    pub version: u8,
    /// Cipher name (always "AES-256-GCM").
    pub cipher: String,
    /// Base64-encoded 12-byte nonce.
    pub iv: String,
    /// Base64-encoded 16-byte authentication tag.
    pub tag: String,
    /// Base64-encoded ciphertext.
    pub ciphertext: String,
    /// KDF descriptor; absent when the key is a derived subkey.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kdf: Option<KdfDescriptor>,
    /// Last write time, RFC 3339.
    pub updated_at: String,
}

impl Envelope {
    /// Encrypt `plaintext` under `key` into a fresh envelope.
    ///
    /// # Errors
    ///
    /// Fails on cipher initialization or encryption failure.
    pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], kdf: Option<KdfDescriptor>) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::Internal(format!("Invalid key material: {e}")))?;

        let iv: [u8; IV_LEN] = rand::rng().random();
        let nonce = Nonce::from_slice(&iv);

        let mut sealed = cipher
            .encrypt(nonce, Payload::from(plaintext))
            .map_err(|e| Error::Internal(format!("Encryption failed: {e}")))?;

        // aes-gcm appends the 16-byte tag; the envelope stores it separately.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(Self {
            version: ENVELOPE_VERSION,
            cipher: ENVELOPE_CIPHER.to_string(),
            iv: B64.encode(iv),
            tag: B64.encode(&tag),
            ciphertext: B64.encode(&sealed),
            kdf,
            updated_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Decrypt the envelope under `key`.
    ///
    /// # Errors
    ///
    /// Fails with `VALIDATION_ERROR` on any structural defect or
    /// authentication failure — the caller must treat this as fail-closed
    /// and leave the stored file untouched.
    pub fn open(&self, key: &[u8; KEY_LEN]) -> Result<Zeroizing<Vec<u8>>> {
        if self.version != ENVELOPE_VERSION {
            return Err(Error::Validation(format!(
                "Unsupported envelope version: {}",
                self.version
            )));
        }
        if self.cipher != ENVELOPE_CIPHER {
            return Err(Error::Validation(format!(
                "Unsupported envelope cipher: {}",
                self.cipher
            )));
        }

        let iv = B64
            .decode(&self.iv)
            .map_err(|e| Error::Validation(format!("Invalid envelope IV: {e}")))?;
        if iv.len() != IV_LEN {
            return Err(Error::Validation(format!(
                "Envelope IV must be {IV_LEN} bytes, got {}",
                iv.len()
            )));
        }
        let tag = B64
            .decode(&self.tag)
            .map_err(|e| Error::Validation(format!("Invalid envelope tag: {e}")))?;
        if tag.len() != TAG_LEN {
            return Err(Error::Validation(format!(
                "Envelope tag must be {TAG_LEN} bytes, got {}",
                tag.len()
            )));
        }
        let mut ciphertext = B64
            .decode(&self.ciphertext)
            .map_err(|e| Error::Validation(format!("Invalid envelope ciphertext: {e}")))?;
        ciphertext.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::Internal(format!("Invalid key material: {e}")))?;
        let nonce = Nonce::from_slice(&iv);

        let plaintext = cipher
            .decrypt(nonce, Payload::from(ciphertext.as_slice()))
            .map_err(|_| {
                Error::Validation(
                    "Envelope authentication failed (wrong passphrase or tampered data)"
                        .to_string(),
                )
            })?;

        Ok(Zeroizing::new(plaintext))
    }
}

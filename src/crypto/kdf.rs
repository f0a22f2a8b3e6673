//! Passphrase key derivation.
//!
//! Argon2id is the default; scrypt (N=2^18, r=8, p≥1) is the fallback for
//! envelopes written by deployments that requested it. The algorithm that
//! actually ran is returned alongside the key and must be recorded in the
//! envelope so unlock derives with the same parameters forever after.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{KEY_LEN, SALT_LEN};
use crate::{Error, Result};

/// Minimum accepted passphrase length.
pub const MIN_PASSPHRASE_LEN: usize = 12;

/// scrypt fallback cost: N = 2^18.
const SCRYPT_LOG_N: u8 = 18;
/// scrypt fallback block size.
const SCRYPT_R: u32 = 8;

/// Supported key-derivation algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfAlgorithm {
    /// Argon2id (preferred).
    Argon2id,
    /// scrypt fallback.
    Scrypt,
}

impl std::fmt::Display for KdfAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Argon2id => write!(f, "argon2id"),
            Self::Scrypt => write!(f, "scrypt"),
        }
    }
}

/// Tunable KDF parameters.
///
/// `memory` is in KiB (Argon2 m-cost). For scrypt the cost is fixed by the
/// fallback contract and only `parallelism` carries over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory: u32,
    /// Iteration count (time cost).
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
    /// Derived-key length in bytes. Always 32 for the vault key.
    pub tag_length: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory: 64 * 1024,
            iterations: 3,
            parallelism: 1,
            tag_length: KEY_LEN as u32,
        }
    }
}

/// Generate a fresh random 16-byte KDF salt.
#[must_use]
pub fn generate_salt() -> [u8; SALT_LEN] {
    rand::rng().random()
}

/// Derive a 256-bit key from `passphrase`.
///
/// Returns the key and the algorithm that was actually used; the caller must
/// record that algorithm in the envelope. When `requested` is `None` the
/// runtime default (Argon2id) applies.
///
/// # Errors
///
/// Fails with `VALIDATION_ERROR` when the passphrase is shorter than
/// [`MIN_PASSPHRASE_LEN`] characters or the parameters are rejected by the
/// underlying KDF.
pub fn derive_key(
    passphrase: &str,
    salt: &[u8],
    params: &KdfParams,
    requested: Option<KdfAlgorithm>,
) -> Result<(Zeroizing<[u8; KEY_LEN]>, KdfAlgorithm)> {
    if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
        return Err(Error::Validation(format!(
            "Passphrase must be at least {MIN_PASSPHRASE_LEN} characters"
        )));
    }

    let algorithm = requested.unwrap_or(KdfAlgorithm::Argon2id);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);

    match algorithm {
        KdfAlgorithm::Argon2id => {
            let argon_params =
                Params::new(params.memory, params.iterations, params.parallelism, Some(KEY_LEN))
                    .map_err(|e| Error::Validation(format!("Invalid Argon2 parameters: {e}")))?;
            let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
            argon
                .hash_password_into(passphrase.as_bytes(), salt, key.as_mut())
                .map_err(|e| Error::Internal(format!("Key derivation failed: {e}")))?;
        }
        KdfAlgorithm::Scrypt => {
            let p = params.parallelism.max(1);
            let scrypt_params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, p, KEY_LEN)
                .map_err(|e| Error::Validation(format!("Invalid scrypt parameters: {e}")))?;
            scrypt::scrypt(passphrase.as_bytes(), salt, &scrypt_params, key.as_mut())
                .map_err(|e| Error::Internal(format!("Key derivation failed: {e}")))?;
        }
    }

    Ok((key, algorithm))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Cheap parameters so the test suite stays fast.
    fn fast_params() -> KdfParams {
        KdfParams {
            memory: 8 * 1024,
            iterations: 1,
            parallelism: 1,
            tag_length: 32,
        }
    }

    #[test]
    fn short_passphrase_is_rejected() {
        let salt = generate_salt();
        let err = derive_key("tooshort", &salt, &fast_params(), None).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn twelve_chars_is_accepted() {
        let salt = generate_salt();
        let (_, algorithm) = derive_key("exactly12chr", &salt, &fast_params(), None).unwrap();
        assert_eq!(algorithm, KdfAlgorithm::Argon2id);
    }

    #[test]
    fn derivation_is_deterministic() {
        let salt = generate_salt();
        let (k1, _) = derive_key("correct horse battery", &salt, &fast_params(), None).unwrap();
        let (k2, _) = derive_key("correct horse battery", &salt, &fast_params(), None).unwrap();
        assert_eq!(*k1, *k2);
    }

    #[test]
    fn different_salts_produce_different_keys() {
        let (k1, _) =
            derive_key("correct horse battery", &generate_salt(), &fast_params(), None).unwrap();
        let (k2, _) =
            derive_key("correct horse battery", &generate_salt(), &fast_params(), None).unwrap();
        assert_ne!(*k1, *k2);
    }

    #[test]
    fn requested_algorithm_is_honored_and_reported() {
        let salt = generate_salt();
        let (k_scrypt, algorithm) = derive_key(
            "correct horse battery",
            &salt,
            &fast_params(),
            Some(KdfAlgorithm::Scrypt),
        )
        .unwrap();
        assert_eq!(algorithm, KdfAlgorithm::Scrypt);

        let (k_argon, _) = derive_key("correct horse battery", &salt, &fast_params(), None).unwrap();
        assert_ne!(*k_scrypt, *k_argon);
    }

    #[test]
    fn algorithm_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&KdfAlgorithm::Argon2id).unwrap(),
            "\"argon2id\""
        );
        assert_eq!(serde_json::to_string(&KdfAlgorithm::Scrypt).unwrap(), "\"scrypt\"");
    }
}

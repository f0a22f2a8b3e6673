//! Cryptographic primitives: passphrase key derivation and the
//! authenticated-encryption envelope used for at-rest secrets.

pub mod envelope;
pub mod kdf;

pub use envelope::{Envelope, KdfDescriptor};
pub use kdf::{derive_key, generate_salt, KdfAlgorithm, KdfParams};

/// Key length for AES-256-GCM.
pub const KEY_LEN: usize = 32;
/// Recommended nonce size for AES-GCM.
pub const IV_LEN: usize = 12;
/// GCM authentication tag size.
pub const TAG_LEN: usize = 16;
/// Salt length for passphrase KDFs.
pub const SALT_LEN: usize = 16;

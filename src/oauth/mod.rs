//! OAuth token storage and the refresh collaborator.
//!
//! Token sets persist in `oauth-tokens.json`, an envelope shaped like the
//! vault's but keyed by an HKDF subkey of the master key (info
//! `clauth-oauth-v1`) — the subkey is derived on demand and never stored.
//! Legacy plaintext token files are migrated to envelope form on load.
//!
//! The refresher is the pipeline's 401 fallback: one opportunistic
//! refresh-token exchange, after which the refreshed access token replaces
//! the vault credential's secret.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hkdf::Hkdf;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{Envelope, KEY_LEN};
use crate::storage::atomic_write;
use crate::vault::Vault;
use crate::{Error, Result};

/// HKDF info string for the oauth-envelope subkey.
const OAUTH_KEY_INFO: &[u8] = b"clauth-oauth-v1";
/// Tokens are treated as expired this many seconds early.
const EXPIRY_BUFFER_SECS: u64 = 60;

/// A stored OAuth token set for one credential handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthTokenSet {
    /// Current access token.
    pub access_token: String,
    /// Usually `Bearer`.
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Refresh token, when the provider issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absolute expiry (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Granted scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthTokenSet {
    /// Expired (with a 60-second buffer)? Token sets without an expiry
    /// never expire.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expires_at| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            now + EXPIRY_BUFFER_SECS >= expires_at
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    tokens: HashMap<String, OAuthTokenSet>,
}

/// Encrypted on-disk store of `{handle → OAuthTokenSet}`.
pub struct OAuthTokenStore {
    path: PathBuf,
    vault: Arc<Vault>,
    tokens: Mutex<HashMap<String, OAuthTokenSet>>,
}

impl OAuthTokenStore {
    /// Load the store. Requires the vault to be unlocked (the subkey comes
    /// from the master key). A legacy plaintext file is re-persisted in
    /// envelope form immediately.
    ///
    /// # Errors
    ///
    /// Fails when the file is unreadable or fails authentication.
    pub fn load(path: PathBuf, vault: Arc<Vault>) -> Result<Self> {
        let store = Self {
            path,
            vault,
            tokens: Mutex::new(HashMap::new()),
        };
        if store.path.exists() {
            let raw = fs::read(&store.path)?;
            let value: serde_json::Value = serde_json::from_slice(&raw)
                .map_err(|e| Error::Validation(format!("Malformed oauth token file: {e}")))?;

            let file: TokenFile = if value.get("ciphertext").is_some() {
                let envelope: Envelope = serde_json::from_value(value)
                    .map_err(|e| Error::Validation(format!("Malformed oauth envelope: {e}")))?;
                let key = store.subkey()?;
                let plaintext = envelope.open(&key)?;
                serde_json::from_slice(&plaintext)
                    .map_err(|e| Error::Validation(format!("Malformed oauth token record: {e}")))?
            } else {
                // Legacy plaintext: migrate to envelope form.
                let file: TokenFile = serde_json::from_value(value)
                    .map_err(|e| Error::Validation(format!("Malformed oauth token file: {e}")))?;
                info!("Migrating plaintext oauth tokens to encrypted envelope");
                *store.tokens.lock() = file.tokens;
                store.persist()?;
                return Ok(store);
            };
            *store.tokens.lock() = file.tokens;
        }
        debug!("OAuth token store loaded");
        Ok(store)
    }

    /// Token set for a handle.
    #[must_use]
    pub fn get(&self, handle: &str) -> Option<OAuthTokenSet> {
        self.tokens.lock().get(handle).cloned()
    }

    /// Insert or replace a handle's token set and re-encrypt the store.
    ///
    /// # Errors
    ///
    /// Fails when the vault is locked or the write fails.
    pub fn put(&self, handle: &str, set: OAuthTokenSet) -> Result<()> {
        self.tokens.lock().insert(handle.to_string(), set);
        self.persist()
    }

    /// Remove a handle's token set.
    ///
    /// # Errors
    ///
    /// Fails when the write fails.
    pub fn remove(&self, handle: &str) -> Result<()> {
        if self.tokens.lock().remove(handle).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    fn subkey(&self) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let master = self.vault.master_key()?;
        let hkdf = Hkdf::<Sha256>::new(None, master.as_ref());
        let mut okm = Zeroizing::new([0u8; KEY_LEN]);
        hkdf.expand(OAUTH_KEY_INFO, okm.as_mut())
            .map_err(|e| Error::Internal(format!("OAuth subkey derivation failed: {e}")))?;
        Ok(okm)
    }

    fn persist(&self) -> Result<()> {
        let file = TokenFile {
            tokens: self.tokens.lock().clone(),
        };
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&file)
                .map_err(|e| Error::Internal(format!("Failed to serialize oauth tokens: {e}")))?,
        );
        let key = self.subkey()?;
        let envelope = Envelope::seal(&key, &plaintext, None)?;
        let contents = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| Error::Internal(format!("Failed to serialize oauth envelope: {e}")))?;
        atomic_write(&self.path, &contents)
    }
}

/// Per-provider token endpoint configuration for refresh grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthProviderConfig {
    /// Token endpoint URL.
    pub token_url: String,
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret, when the provider requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// The refresh collaborator the pipeline calls on upstream 401s.
#[async_trait]
pub trait OAuthRefresher: Send + Sync + 'static {
    /// Refresh the handle's tokens if they look expired. Returns whether a
    /// refresh happened.
    async fn refresh_if_needed(&self, handle: &str) -> Result<bool>;

    /// Refresh unconditionally (when a refresh token exists).
    async fn force_refresh(&self, handle: &str) -> Result<bool>;

    /// Current token set, if any.
    async fn get_token_set(&self, handle: &str) -> Option<OAuthTokenSet>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Default refresher: refresh-token grants against configured provider
/// token endpoints, with the fresh access token written back into the
/// vault credential.
pub struct OAuthManager {
    store: OAuthTokenStore,
    vault: Arc<Vault>,
    client: reqwest::Client,
    providers: HashMap<String, OAuthProviderConfig>,
}

impl OAuthManager {
    /// Wire the manager over the encrypted store.
    #[must_use]
    pub fn new(
        store: OAuthTokenStore,
        vault: Arc<Vault>,
        providers: HashMap<String, OAuthProviderConfig>,
    ) -> Self {
        Self {
            store,
            vault,
            client: reqwest::Client::new(),
            providers,
        }
    }

    /// Record a token set for a handle (e.g. after an interactive flow).
    ///
    /// # Errors
    ///
    /// Fails when persistence fails.
    pub fn store_token_set(&self, handle: &str, set: OAuthTokenSet) -> Result<()> {
        self.store.put(handle, set)
    }

    async fn refresh(&self, handle: &str, set: OAuthTokenSet) -> Result<bool> {
        let Some(refresh_token) = set.refresh_token.clone() else {
            debug!(handle = %handle, "No refresh token; cannot refresh");
            return Ok(false);
        };
        let credential = self.vault.get_credential(handle, None)?;
        let Some(provider) = self.providers.get(&credential.provider) else {
            debug!(handle = %handle, provider = %credential.provider, "No oauth provider config");
            return Ok(false);
        };

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.clone()),
            ("client_id", provider.client_id.clone()),
        ];
        if let Some(secret) = &provider.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = self
            .client
            .post(&provider.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("Token endpoint unreachable: {e}")))?;
        if !response.status().is_success() {
            warn!(handle = %handle, status = %response.status(), "Token refresh rejected");
            return Ok(false);
        }
        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("Malformed token response: {e}")))?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let refreshed = OAuthTokenSet {
            access_token: parsed.access_token.clone(),
            token_type: parsed.token_type.unwrap_or_else(default_token_type),
            // Providers may rotate the refresh token or keep it.
            refresh_token: parsed.refresh_token.or(Some(refresh_token)),
            expires_at: parsed.expires_in.map(|secs| now + secs),
            scope: parsed.scope.or(set.scope),
        };
        self.store.put(handle, refreshed)?;
        self.vault.update_credential_secret(handle, &parsed.access_token)?;
        info!(handle = %handle, "OAuth tokens refreshed");
        Ok(true)
    }
}

#[async_trait]
impl OAuthRefresher for OAuthManager {
    async fn refresh_if_needed(&self, handle: &str) -> Result<bool> {
        let Some(set) = self.store.get(handle) else {
            return Ok(false);
        };
        if !set.is_expired() {
            return Ok(false);
        }
        self.refresh(handle, set).await
    }

    async fn force_refresh(&self, handle: &str) -> Result<bool> {
        let Some(set) = self.store.get(handle) else {
            return Ok(false);
        };
        self.refresh(handle, set).await
    }

    async fn get_token_set(&self, handle: &str) -> Option<OAuthTokenSet> {
        self.store.get(handle)
    }
}

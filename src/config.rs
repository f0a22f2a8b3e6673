//! Configuration management.
//!
//! Layered: YAML file (when given) merged with `CLAUTH_`-prefixed
//! environment variables (`__` separates nesting). Every section has
//! serde defaults so a bare daemon starts with nothing but a passphrase.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::alerts::AlertChannel;
use crate::crypto::KdfParams;
use crate::firewall::FirewallConfig;
use crate::identity::{IdentityConfig, IdentityEndpoint, IdentityOAuthProviderConfig};
use crate::oauth::OAuthProviderConfig;
use crate::{Error, Result};

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Listener configuration.
    pub server: ServerConfig,
    /// State directory; defaults to `~/.clauth`.
    pub state_dir: Option<PathBuf>,
    /// Operator admin token for the management surface.
    pub admin_token: Option<String>,
    /// Initial KDF parameters (an existing vault envelope wins).
    pub kdf: KdfParams,
    /// base64url-encoded 16-byte vault KDF salt for fresh vaults.
    pub vault_salt: Option<String>,
    /// base64url-encoded 16-byte pepper for skill-token hashing.
    pub skill_token_salt: Option<String>,
    /// Behavioral firewall tunables.
    pub firewall: FirewallConfig,
    /// Alert webhook channels.
    pub alert_channels: Vec<AlertChannel>,
    /// Security hardening knobs.
    pub hardening: HardeningConfig,
    /// OAuth refresh endpoints per provider.
    pub oauth_providers: HashMap<String, OAuthProviderConfig>,
    /// Identity broker provider configuration.
    pub identity: IdentityProvidersConfig,
    /// Advisory feed polling.
    pub advisory: AdvisoryConfig,
}

/// Listener transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// TCP listener on host:port.
    Tcp,
    /// Unix domain socket (chmod 0600).
    Unix,
}

/// Server listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener style.
    pub transport: Transport,
    /// Bind host (tcp).
    pub host: String,
    /// Bind port (tcp).
    pub port: u16,
    /// Socket path (unix).
    pub socket_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Tcp,
            host: "127.0.0.1".to_string(),
            port: 7700,
            socket_path: None,
        }
    }
}

/// Hardening knobs (`hardening.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HardeningConfig {
    /// Refuse non-HTTPS brokered endpoints.
    pub enforce_https: bool,
    /// Inbound body size cap.
    pub max_request_body_bytes: usize,
    /// Session token lifetime.
    pub session_ttl_seconds: u64,
    /// Identity challenge lifetime.
    pub challenge_ttl_seconds: u64,
    /// Verify attempts before a challenge fails.
    pub identity_max_verify_attempts: u32,
    /// Identity-verify quota per skill per minute (0 = unlimited).
    pub identity_verify_per_skill_per_minute: u32,
    /// Identity-verify quota per client IP per minute (0 = unlimited).
    pub identity_verify_per_ip_per_minute: u32,
    /// Require the admin token for identity administration routes.
    pub require_admin_token_for_identity: bool,
}

impl Default for HardeningConfig {
    fn default() -> Self {
        Self {
            enforce_https: true,
            max_request_body_bytes: 1024 * 1024,
            session_ttl_seconds: 3600,
            challenge_ttl_seconds: 600,
            identity_max_verify_attempts: 3,
            identity_verify_per_skill_per_minute: 10,
            identity_verify_per_ip_per_minute: 30,
            require_admin_token_for_identity: true,
        }
    }
}

/// Identity broker provider wiring.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IdentityProvidersConfig {
    /// OAuth settings per provider for the oauth challenge method.
    pub oauth: HashMap<String, IdentityOAuthProviderConfig>,
    /// Extra identity endpoints (override the built-ins).
    pub endpoints: HashMap<String, IdentityEndpoint>,
    /// Webhook that delivers email challenge codes out-of-band.
    pub email_webhook: Option<String>,
}

/// Advisory feed polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisoryConfig {
    /// Feed URLs returning advisory JSON arrays.
    pub feeds: Vec<String>,
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            feeds: Vec::new(),
            poll_interval_ms: 15 * 60 * 1000,
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be
    /// parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Validation(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }
        figment = figment.merge(Env::prefixed("CLAUTH_").split("__"));

        figment
            .extract()
            .map_err(|e| Error::Validation(format!("Invalid configuration: {e}")))
    }

    /// The effective state directory.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".clauth")
        })
    }

    /// Decoded vault salt, when configured.
    ///
    /// # Errors
    ///
    /// `VALIDATION_ERROR` unless the value is base64url for exactly 16 bytes.
    pub fn vault_salt_bytes(&self) -> Result<Option<Vec<u8>>> {
        self.vault_salt
            .as_deref()
            .map(|raw| decode_salt("vault_salt", raw))
            .transpose()
    }

    /// Decoded skill-token pepper, when configured.
    ///
    /// # Errors
    ///
    /// `VALIDATION_ERROR` unless the value is base64url for exactly 16 bytes.
    pub fn skill_token_salt_bytes(&self) -> Result<Option<Vec<u8>>> {
        self.skill_token_salt
            .as_deref()
            .map(|raw| decode_salt("skill_token_salt", raw))
            .transpose()
    }

    /// Identity broker tunables assembled from the hardening section.
    #[must_use]
    pub fn identity_config(&self) -> IdentityConfig {
        IdentityConfig {
            challenge_ttl_secs: self.hardening.challenge_ttl_seconds,
            max_verify_attempts: self.hardening.identity_max_verify_attempts,
            verify_per_skill_per_minute: self.hardening.identity_verify_per_skill_per_minute,
            verify_per_ip_per_minute: self.hardening.identity_verify_per_ip_per_minute,
        }
    }
}

fn decode_salt(field: &str, raw: &str) -> Result<Vec<u8>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(raw.trim_end_matches('='))
        .map_err(|e| Error::Validation(format!("{field} is not valid base64url: {e}")))?;
    if bytes.len() != 16 {
        return Err(Error::Validation(format!(
            "{field} must decode to 16 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.transport, Transport::Tcp);
        assert_eq!(config.server.port, 7700);
        assert!(config.hardening.enforce_https);
        assert_eq!(config.hardening.identity_max_verify_attempts, 3);
        assert!(config.state_dir().ends_with(".clauth"));
    }

    #[test]
    fn loads_yaml_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clauth.yaml");
        std::fs::write(
            &path,
            r"
server:
  transport: unix
  socket_path: /tmp/clauth.sock
hardening:
  enforceHttps: false
  sessionTtlSeconds: 120
firewall:
  burstLimit: 5
",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.transport, Transport::Unix);
        assert!(!config.hardening.enforce_https);
        assert_eq!(config.hardening.session_ttl_seconds, 120);
        assert_eq!(config.firewall.burst_limit, 5);
        // Untouched sections keep their defaults
        assert_eq!(config.hardening.challenge_ttl_seconds, 600);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/clauth.yaml"))).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn salts_must_be_16_bytes_base64url() {
        let mut config = Config {
            vault_salt: Some(URL_SAFE_NO_PAD.encode([7u8; 16])),
            ..Config::default()
        };
        assert_eq!(config.vault_salt_bytes().unwrap().unwrap().len(), 16);

        config.vault_salt = Some("too-short".to_string());
        assert!(config.vault_salt_bytes().is_err());

        config.vault_salt = Some("!!!not-base64!!!".to_string());
        assert!(config.vault_salt_bytes().is_err());

        config.vault_salt = None;
        assert!(config.vault_salt_bytes().unwrap().is_none());
    }
}

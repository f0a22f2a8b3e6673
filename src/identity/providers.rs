//! Provider identity endpoints.
//!
//! One HTTP call per provider: fetch the authenticated account and compare
//! its identifier to the claimed one, case-insensitively. Built-in
//! endpoints cover the common providers; deployments can extend the table
//! through configuration.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Where a provider exposes "who am I" and which response field names the
/// account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityEndpoint {
    /// Endpoint URL returning the authenticated account as JSON.
    pub url: String,
    /// Response field holding the account identifier.
    pub account_field: String,
}

/// Built-in identity endpoints.
fn builtin_endpoints() -> HashMap<String, IdentityEndpoint> {
    let mut map = HashMap::new();
    map.insert(
        "github".to_string(),
        IdentityEndpoint {
            url: "https://api.github.com/user".to_string(),
            account_field: "login".to_string(),
        },
    );
    map.insert(
        "gitlab".to_string(),
        IdentityEndpoint {
            url: "https://gitlab.com/api/v4/user".to_string(),
            account_field: "username".to_string(),
        },
    );
    map.insert(
        "google".to_string(),
        IdentityEndpoint {
            url: "https://www.googleapis.com/oauth2/v2/userinfo".to_string(),
            account_field: "email".to_string(),
        },
    );
    map
}

/// Proves (or refutes) that a secret controls a provider account.
#[async_trait]
pub trait IdentityVerifier: Send + Sync + 'static {
    /// Call the provider's identity endpoint with `secret` and compare the
    /// returned account to `account_id` case-insensitively.
    async fn verify_ownership(&self, provider: &str, secret: &str, account_id: &str)
        -> Result<bool>;
}

/// HTTP-backed verifier over the endpoint table.
pub struct HttpIdentityVerifier {
    client: reqwest::Client,
    endpoints: HashMap<String, IdentityEndpoint>,
}

impl HttpIdentityVerifier {
    /// Build with the built-in endpoints plus deployment extras (extras
    /// win on conflicts).
    #[must_use]
    pub fn new(extra: HashMap<String, IdentityEndpoint>) -> Self {
        let mut endpoints = builtin_endpoints();
        endpoints.extend(extra);
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }
}

#[async_trait]
impl IdentityVerifier for HttpIdentityVerifier {
    async fn verify_ownership(
        &self,
        provider: &str,
        secret: &str,
        account_id: &str,
    ) -> Result<bool> {
        let Some(endpoint) = self.endpoints.get(provider) else {
            return Err(Error::Validation(format!(
                "No identity endpoint known for provider {provider}"
            )));
        };

        let response = self
            .client
            .get(&endpoint.url)
            .bearer_auth(secret)
            .header("user-agent", concat!("clauth/", env!("CARGO_PKG_VERSION")))
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("Identity endpoint unreachable: {e}")))?;

        if !response.status().is_success() {
            debug!(provider = %provider, status = %response.status(), "Identity endpoint rejected credential");
            return Ok(false);
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("Malformed identity response: {e}")))?;
        let Some(returned) = body.get(&endpoint.account_field).and_then(|v| v.as_str()) else {
            warn!(provider = %provider, field = %endpoint.account_field, "Identity response missing account field");
            return Ok(false);
        };

        Ok(returned.eq_ignore_ascii_case(account_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_common_providers() {
        let verifier = HttpIdentityVerifier::new(HashMap::new());
        assert!(verifier.endpoints.contains_key("github"));
        assert!(verifier.endpoints.contains_key("gitlab"));
        assert!(verifier.endpoints.contains_key("google"));
    }

    #[test]
    fn extras_override_builtins() {
        let mut extra = HashMap::new();
        extra.insert(
            "github".to_string(),
            IdentityEndpoint {
                url: "https://ghe.internal.corp/api/v3/user".to_string(),
                account_field: "login".to_string(),
            },
        );
        let verifier = HttpIdentityVerifier::new(extra);
        assert_eq!(
            verifier.endpoints.get("github").unwrap().url,
            "https://ghe.internal.corp/api/v3/user"
        );
    }

    #[tokio::test]
    async fn unknown_provider_is_a_validation_error() {
        let verifier = HttpIdentityVerifier::new(HashMap::new());
        let err = verifier
            .verify_ownership("nowhere", "secret", "account")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}

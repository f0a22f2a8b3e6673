//! Auth-header composition for brokered requests.
//!
//! The auth scheme comes from the credential's `authType` metadata when
//! present, otherwise from the provider default: a fixed set of providers
//! speak `Bearer`, everything else gets an `x-api-key` header. Unknown
//! `authType` values fall back to bearer.

use crate::vault::{metadata_keys, Credential};

/// Header names a caller may never supply; they are silently dropped
/// before the injected auth headers are merged.
pub const PROTECTED_HEADERS: &[&str] = &["authorization", "proxy-authorization"];

/// Providers whose APIs expect `Authorization: Bearer`.
const BEARER_PROVIDERS: &[&str] = &[
    "github", "gitlab", "openai", "slack", "twitter", "stripe", "sendgrid", "notion", "google",
];

/// Recognized auth schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// `Authorization: Bearer <secret>`
    Bearer,
    /// `<headerName or x-api-key>: <secret>`
    ApiKey,
    /// `Authorization: Basic <secret>` (secret pre-encoded)
    Basic,
}

impl AuthType {
    /// Parse a metadata value; unknown strings fall back to bearer.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "api-key" => Self::ApiKey,
            "basic" => Self::Basic,
            _ => Self::Bearer,
        }
    }
}

/// The provider's default scheme when the credential carries none.
#[must_use]
pub fn default_auth_type(provider: &str) -> AuthType {
    if BEARER_PROVIDERS.contains(&provider) {
        AuthType::Bearer
    } else {
        AuthType::ApiKey
    }
}

/// Compose the auth headers the daemon injects for `credential`.
#[must_use]
pub fn build_auth_headers(credential: &Credential) -> Vec<(String, String)> {
    let auth_type = credential
        .meta(metadata_keys::AUTH_TYPE)
        .map_or_else(|| default_auth_type(&credential.provider), AuthType::parse);

    match auth_type {
        AuthType::Bearer => vec![(
            "authorization".to_string(),
            format!("Bearer {}", credential.secret),
        )],
        AuthType::ApiKey => {
            let header = credential
                .meta(metadata_keys::HEADER_NAME)
                .unwrap_or("x-api-key")
                .to_lowercase();
            vec![(header, credential.secret.clone())]
        }
        AuthType::Basic => vec![(
            "authorization".to_string(),
            format!("Basic {}", credential.secret),
        )],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn credential(provider: &str, metadata: Option<HashMap<String, String>>) -> Credential {
        Credential {
            handle: "h".into(),
            provider: provider.into(),
            secret: "s3cr3t".into(),
            created_at: Utc::now(),
            expires_at: None,
            metadata,
        }
    }

    fn meta(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        )
    }

    #[test]
    fn bearer_providers_default_to_bearer() {
        let headers = build_auth_headers(&credential("github", None));
        assert_eq!(
            headers,
            vec![("authorization".to_string(), "Bearer s3cr3t".to_string())]
        );
    }

    #[test]
    fn unknown_providers_default_to_api_key() {
        let headers = build_auth_headers(&credential("anthropic", None));
        assert_eq!(headers, vec![("x-api-key".to_string(), "s3cr3t".to_string())]);
    }

    #[test]
    fn metadata_auth_type_wins_over_provider_default() {
        let headers = build_auth_headers(&credential("github", meta(&[("authType", "api-key")])));
        assert_eq!(headers[0].0, "x-api-key");
    }

    #[test]
    fn api_key_honors_header_name() {
        let headers = build_auth_headers(&credential(
            "anthropic",
            meta(&[("authType", "api-key"), ("headerName", "X-Custom-Key")]),
        ));
        assert_eq!(headers, vec![("x-custom-key".to_string(), "s3cr3t".to_string())]);
    }

    #[test]
    fn basic_passes_pre_encoded_secret() {
        let headers = build_auth_headers(&credential("github", meta(&[("authType", "basic")])));
        assert_eq!(
            headers,
            vec![("authorization".to_string(), "Basic s3cr3t".to_string())]
        );
    }

    #[test]
    fn unrecognized_auth_type_falls_back_to_bearer() {
        let headers = build_auth_headers(&credential("anthropic", meta(&[("authType", "oauth2")])));
        assert_eq!(
            headers,
            vec![("authorization".to_string(), "Bearer s3cr3t".to_string())]
        );
    }
}

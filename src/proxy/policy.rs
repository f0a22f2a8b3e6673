//! Endpoint policy: which hosts a provider's credentials may be sent to.
//!
//! Each known provider carries a default allow-list; credential metadata
//! can override it with `allowedHosts` (comma-separated). A `*.example.com`
//! pattern matches `example.com` itself or any subdomain — nothing more
//! exotic, so the matcher stays auditable. Requests to hosts outside the
//! list fail before any network I/O.

use url::Url;

use crate::{Error, Result};

/// Environment override permitting providers without a default host list.
pub const ALLOW_UNKNOWN_PROVIDERS_ENV: &str = "CLAUTH_ALLOW_UNKNOWN_PROVIDERS";

/// Default allowed hosts per provider.
#[must_use]
pub fn default_hosts(provider: &str) -> Option<&'static [&'static str]> {
    Some(match provider {
        "github" => &["api.github.com"],
        "gitlab" => &["gitlab.com"],
        "openai" => &["api.openai.com"],
        "anthropic" => &["api.anthropic.com"],
        "slack" => &["slack.com", "api.slack.com"],
        "twitter" => &["api.twitter.com", "api.x.com"],
        "stripe" => &["api.stripe.com"],
        "sendgrid" => &["api.sendgrid.com"],
        "notion" => &["api.notion.com"],
        "google" => &["www.googleapis.com", "oauth2.googleapis.com"],
        _ => return None,
    })
}

/// Case-insensitive host match. `*.example.com` matches the bare domain
/// or any strict subdomain; any other pattern must match exactly.
#[must_use]
pub fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim().to_lowercase();
    let host = host.to_lowercase();
    if let Some(base) = pattern.strip_prefix("*.") {
        host == base || host.ends_with(&format!(".{base}"))
    } else {
        host == pattern
    }
}

/// Host allow-listing for brokered requests.
pub struct EndpointPolicy {
    allow_unknown_providers: bool,
}

impl EndpointPolicy {
    /// Build the policy; unknown providers are allowed only via the
    /// explicit environment override.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            allow_unknown_providers: std::env::var(ALLOW_UNKNOWN_PROVIDERS_ENV)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// Build with the unknown-provider gate set explicitly (tests, embedding).
    #[must_use]
    pub fn new(allow_unknown_providers: bool) -> Self {
        Self {
            allow_unknown_providers,
        }
    }

    /// Check `endpoint` against the credential's `allowedHosts` override
    /// or the provider default list.
    ///
    /// # Errors
    ///
    /// `VALIDATION_ERROR` when the URL has no host, the host is outside
    /// the allow-list, or the provider is unknown without an override.
    pub fn check(
        &self,
        provider: &str,
        endpoint: &Url,
        allowed_hosts_override: Option<&str>,
    ) -> Result<()> {
        let Some(host) = endpoint.host_str() else {
            return Err(Error::Validation(format!("Endpoint has no host: {endpoint}")));
        };

        if let Some(patterns) = allowed_hosts_override {
            let allowed = patterns
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .any(|p| host_matches(p, host));
            return if allowed {
                Ok(())
            } else {
                Err(Error::Validation(format!(
                    "Host {host} is outside the credential's allowed hosts"
                )))
            };
        }

        match default_hosts(provider) {
            Some(defaults) => {
                if defaults.iter().any(|p| host_matches(p, host)) {
                    Ok(())
                } else {
                    Err(Error::Validation(format!(
                        "Host {host} is not in the default allow-list for provider {provider}"
                    )))
                }
            }
            None if self.allow_unknown_providers => Ok(()),
            None => Err(Error::Validation(format!(
                "Provider {provider} has no default host list; set {ALLOW_UNKNOWN_PROVIDERS_ENV}=1 \
                 or an allowedHosts credential override"
            ))),
        }
    }
}

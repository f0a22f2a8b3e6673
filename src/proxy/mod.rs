//! The brokered-request pipeline.
//!
//! Order of operations for every proxied call: validate → scope authorize
//! (rate-limited) → firewall evaluate → credential fetch → endpoint policy
//! → auth-header injection → upstream execution (with one opportunistic
//! OAuth refresh retry on 401) → audit → response shaping.
//!
//! Every failure path writes exactly one audit entry at its point of
//! origin and surfaces the error unchanged; the caller can never override
//! the injected `authorization` headers.

pub mod headers;
pub mod policy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::audit::{AuditContext, AuditEvent, AuditLog};
use crate::firewall::{Firewall, FirewallRequest};
use crate::oauth::OAuthRefresher;
use crate::scopes::ScopeEngine;
use crate::vault::{metadata_keys, Vault};
use crate::{Error, Result};
pub use headers::{build_auth_headers, AuthType, PROTECTED_HEADERS};
pub use policy::EndpointPolicy;

/// A skill's request for a brokered upstream call.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokeredRequest {
    /// Acting skill (resolved by the caller's principal, echoed here).
    pub skill_id: String,
    /// Target provider.
    pub provider: String,
    /// Vault credential to inject.
    pub credential_handle: String,
    /// Scope to authorize under (`provider:action`).
    pub scope: String,
    /// HTTP method.
    pub method: String,
    /// Target URL.
    pub endpoint: String,
    /// Caller-supplied headers; auth headers are stripped.
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    /// Optional body; non-strings are serialized as JSON.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

/// The upstream response as returned to the skill.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokeredResponse {
    /// Upstream status code.
    pub status: u16,
    /// Lowercased response headers.
    pub headers: HashMap<String, String>,
    /// JSON when the content type is JSON, text when textual, else null.
    pub body: serde_json::Value,
}

/// Pipeline tunables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Refuse non-HTTPS endpoints.
    pub enforce_https: bool,
    /// Upstream call timeout.
    pub upstream_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enforce_https: true,
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

/// Composes authorization, firewalling, credential injection, upstream
/// execution, and auditing. Collaborators are injected; none hold a
/// reference back.
pub struct Pipeline {
    vault: Arc<Vault>,
    scopes: Arc<ScopeEngine>,
    firewall: Arc<Firewall>,
    audit: Arc<AuditLog>,
    policy: EndpointPolicy,
    refresher: Option<Arc<dyn OAuthRefresher>>,
    client: reqwest::Client,
    config: PipelineConfig,
}

impl Pipeline {
    /// Wire the pipeline.
    #[must_use]
    pub fn new(
        vault: Arc<Vault>,
        scopes: Arc<ScopeEngine>,
        firewall: Arc<Firewall>,
        audit: Arc<AuditLog>,
        policy: EndpointPolicy,
        refresher: Option<Arc<dyn OAuthRefresher>>,
        config: PipelineConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()
            .unwrap_or_default();
        Self {
            vault,
            scopes,
            firewall,
            audit,
            policy,
            refresher,
            client,
            config,
        }
    }

    /// Execute one brokered request end to end.
    ///
    /// # Errors
    ///
    /// The full taxonomy: `VALIDATION_ERROR` for malformed requests and
    /// policy blocks, `ACCESS_DENIED` for scope/firewall/rate decisions,
    /// `NOT_FOUND` for unknown credentials, `UPSTREAM_ERROR` for transport
    /// failures.
    pub async fn execute(&self, request: BrokeredRequest) -> Result<BrokeredResponse> {
        // 1. Normalize + validate.
        let provider = request.provider.trim().to_lowercase();
        let now = Utc::now();

        if let Err(e) = validate_shape(&request, &provider) {
            self.audit_deny(&request, &provider, "invalid_request", &e).await?;
            return Err(e);
        }
        let endpoint = match Url::parse(&request.endpoint) {
            Ok(url) => url,
            Err(e) => {
                let err = Error::Validation(format!("Endpoint is not a valid URL: {e}"));
                self.audit_deny(&request, &provider, "invalid_request", &err).await?;
                return Err(err);
            }
        };
        if self.config.enforce_https && endpoint.scheme() != "https" {
            let err = Error::Validation("Endpoint must use https".into());
            self.audit_deny(&request, &provider, "invalid_request", &err).await?;
            return Err(err);
        }

        // 2. Scope authorization; a denial still feeds the firewall so the
        // attempt lands in the skill's baseline.
        let authorization =
            match self.scopes.authorize(&request.skill_id, &provider, &request.scope, now) {
                Ok(authorization) => authorization,
                Err(e) => {
                    let _ = self.firewall.evaluate(&FirewallRequest {
                        skill_id: &request.skill_id,
                        provider: &provider,
                        scope: &request.scope,
                        endpoint: &request.endpoint,
                        method: &request.method,
                        timestamp: now,
                        scope_denied: true,
                    });
                    self.audit_deny(&request, &provider, "scope_denied", &e).await?;
                    return Err(e);
                }
            };
        debug!(
            skill_id = %request.skill_id,
            scope = %authorization.grant.scope,
            remaining = authorization.remaining,
            "Scope authorized"
        );

        // 3. Behavioral firewall.
        let decision = self.firewall.evaluate(&FirewallRequest {
            skill_id: &request.skill_id,
            provider: &provider,
            scope: &request.scope,
            endpoint: &request.endpoint,
            method: &request.method,
            timestamp: now,
            scope_denied: false,
        });
        if !decision.allowed {
            let reasons = decision.reasons.join("; ");
            self.audit
                .append(
                    AuditEvent::FirewallAlert,
                    AuditContext {
                        skill_id: Some(request.skill_id.clone()),
                        provider: Some(provider.clone()),
                        scope: Some(request.scope.clone()),
                        endpoint: Some(request.endpoint.clone()),
                        method: Some(request.method.clone()),
                        outcome: Some("blocked".into()),
                        details: Some(reasons.clone()),
                        ..AuditContext::default()
                    },
                )
                .await?;
            return Err(Error::AccessDenied(reasons));
        }

        // 4. Credential + endpoint policy.
        let credential = match self.vault.get_credential(&request.credential_handle, Some(&provider))
        {
            Ok(credential) => credential,
            Err(e) => {
                self.audit_deny(&request, &provider, "credential_error", &e).await?;
                return Err(e);
            }
        };
        if let Err(e) = self.policy.check(
            &provider,
            &endpoint,
            credential.meta(metadata_keys::ALLOWED_HOSTS),
        ) {
            self.audit_deny(&request, &provider, "endpoint_blocked", &e).await?;
            return Err(e);
        }

        // 5-6. Headers + body.
        let method = match Method::from_bytes(request.method.to_uppercase().as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                let err = Error::Validation(format!("Unsupported HTTP method: {}", request.method));
                self.audit_deny(&request, &provider, "invalid_request", &err).await?;
                return Err(err);
            }
        };
        let mut header_map = merge_headers(request.headers.as_ref(), &build_auth_headers(&credential));
        let body = request.body.as_ref().map(render_body);
        if body.is_some() && !header_map.contains_key("content-type") {
            header_map.insert("content-type".to_string(), "application/json".to_string());
        }

        // 7. Upstream execution, with one refresh-and-retry on 401.
        let mut response = self
            .send_upstream(method.clone(), &endpoint, &header_map, body.as_deref())
            .await;
        let unauthorized = matches!(
            &response,
            Ok(upstream) if upstream.status() == reqwest::StatusCode::UNAUTHORIZED
        );
        if unauthorized {
            if let Some(refresher) = &self.refresher {
                let refreshed = refresher
                    .force_refresh(&request.credential_handle)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "Opportunistic token refresh failed");
                        false
                    });
                if refreshed {
                    let credential = self
                        .vault
                        .get_credential(&request.credential_handle, Some(&provider))?;
                    header_map =
                        merge_headers(request.headers.as_ref(), &build_auth_headers(&credential));
                    if body.is_some() && !header_map.contains_key("content-type") {
                        header_map
                            .insert("content-type".to_string(), "application/json".to_string());
                    }
                    debug!(handle = %request.credential_handle, "Retrying with refreshed credential");
                    response = self
                        .send_upstream(method, &endpoint, &header_map, body.as_deref())
                        .await;
                }
            }
        }

        let upstream = match response {
            Ok(upstream) => upstream,
            Err(e) => {
                self.audit
                    .append(
                        AuditEvent::ProxyError,
                        AuditContext {
                            skill_id: Some(request.skill_id.clone()),
                            provider: Some(provider.clone()),
                            scope: Some(request.scope.clone()),
                            endpoint: Some(request.endpoint.clone()),
                            method: Some(request.method.clone()),
                            outcome: Some("network".into()),
                            details: Some(e.to_string()),
                            ..AuditContext::default()
                        },
                    )
                    .await?;
                return Err(e);
            }
        };

        // 8. Audit + response shaping.
        let status = upstream.status().as_u16();
        let mut response_headers = HashMap::new();
        for (name, value) in upstream.headers() {
            if let Ok(value) = value.to_str() {
                response_headers.insert(name.as_str().to_lowercase(), value.to_string());
            }
        }
        let content_type = response_headers.get("content-type").cloned();
        let raw = upstream
            .text()
            .await
            .map_err(|e| Error::Upstream(format!("Failed to read upstream body: {e}")))?;
        let body = shape_body(content_type.as_deref(), &raw);

        self.audit
            .append(
                AuditEvent::ProxyAllow,
                AuditContext {
                    skill_id: Some(request.skill_id.clone()),
                    provider: Some(provider),
                    scope: Some(request.scope.clone()),
                    endpoint: Some(request.endpoint.clone()),
                    method: Some(request.method.clone()),
                    outcome: Some("ok".into()),
                    status_code: Some(status),
                    ..AuditContext::default()
                },
            )
            .await?;

        Ok(BrokeredResponse {
            status,
            headers: response_headers,
            body,
        })
    }

    async fn send_upstream(
        &self,
        method: Method,
        endpoint: &Url,
        headers: &HashMap<String, String>,
        body: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut builder = self.client.request(method, endpoint.clone());
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body(body.to_string());
        }
        builder
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("Upstream request failed: {e}")))
    }

    async fn audit_deny(
        &self,
        request: &BrokeredRequest,
        provider: &str,
        outcome: &str,
        error: &Error,
    ) -> Result<()> {
        self.audit
            .append(
                AuditEvent::ProxyDeny,
                AuditContext {
                    skill_id: Some(request.skill_id.clone()),
                    provider: Some(provider.to_string()),
                    scope: Some(request.scope.clone()),
                    endpoint: Some(request.endpoint.clone()),
                    method: Some(request.method.clone()),
                    outcome: Some(outcome.to_string()),
                    details: Some(error.to_string()),
                    ..AuditContext::default()
                },
            )
            .await?;
        Ok(())
    }
}

fn validate_shape(request: &BrokeredRequest, provider: &str) -> Result<()> {
    let required = [
        ("skillId", request.skill_id.trim()),
        ("provider", provider),
        ("credentialHandle", request.credential_handle.trim()),
        ("scope", request.scope.trim()),
        ("method", request.method.trim()),
        ("endpoint", request.endpoint.trim()),
    ];
    for (field, value) in required {
        if value.is_empty() {
            return Err(Error::Validation(format!("{field} is required")));
        }
    }
    Ok(())
}

/// Caller headers (lowercased, auth headers silently dropped) with the
/// injected auth headers layered on top.
fn merge_headers(
    caller: Option<&HashMap<String, String>>,
    auth: &[(String, String)],
) -> HashMap<String, String> {
    let mut merged = HashMap::new();
    if let Some(caller) = caller {
        for (name, value) in caller {
            let name = name.to_lowercase();
            if PROTECTED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            merged.insert(name, value.clone());
        }
    }
    for (name, value) in auth {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

/// Strings pass through; anything else goes upstream as JSON.
fn render_body(body: &serde_json::Value) -> String {
    match body {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON content types parse; textual ones come back as strings; anything
/// else is null.
fn shape_body(content_type: Option<&str>, raw: &str) -> serde_json::Value {
    match content_type {
        Some(ct) if ct.contains("json") => {
            serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
        }
        Some(ct) if ct.starts_with("text/") => serde_json::Value::String(raw.to_string()),
        _ => serde_json::Value::Null,
    }
}

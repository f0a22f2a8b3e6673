//! HTTP surface.
//!
//! Thin glue over the core: axum routes bound to the [`Runtime`], served
//! on TCP or a unix socket (chmod 0600). Skills authenticate with bearer
//! credentials resolved by the principal resolver; management routes take
//! the operator admin token in `x-clauth-admin-token`.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::audit::{AuditContext, AuditEvent};
use crate::auth::check_admin_token;
use crate::config::Transport;
use crate::identity::ChallengeMethod;
use crate::proxy::BrokeredRequest;
use crate::runtime::Runtime;
use crate::{Error, Result};

/// Admin token header name.
pub const ADMIN_TOKEN_HEADER: &str = "x-clauth-admin-token";

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = axum::http::StatusCode::from_u16(self.http_status())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

/// Build the router over a started runtime.
#[must_use]
pub fn build_router(runtime: Arc<Runtime>) -> Router {
    let body_limit = runtime.config.hardening.max_request_body_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/proxy", post(proxy))
        .route("/admin/credentials", post(store_credential).get(list_credentials))
        .route("/admin/credentials/{handle}", delete(delete_credential))
        .route("/admin/grants", post(create_grant).get(list_grants).delete(revoke_grant))
        .route("/admin/grants/emergency-revoke", post(emergency_revoke))
        .route("/admin/skills/{skill_id}/token", post(issue_skill_token).delete(revoke_skill_token))
        .route("/admin/sessions", post(issue_session).delete(revoke_session))
        .route("/admin/audit/verify", get(verify_audit))
        .route("/identity/challenges", post(create_challenge))
        .route("/identity/challenges/{id}", get(get_challenge))
        .route("/identity/challenges/{id}/verify", post(verify_challenge))
        .route("/identity/proofs", get(list_proofs))
        .route("/identity/proofs/{challenge_id}", delete(revoke_proof))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(runtime)
}

/// Serve the router until `shutdown` resolves, then lock the vault.
///
/// # Errors
///
/// Fails on bind errors or a listener failure.
pub async fn serve(
    runtime: Arc<Runtime>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(Arc::clone(&runtime));
    let server = &runtime.config.server;

    match server.transport {
        Transport::Tcp => {
            let addr = format!("{}:{}", server.host, server.port);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .map_err(|e| Error::Internal(format!("Failed to bind {addr}: {e}")))?;
            info!(addr = %addr, "Listening (tcp)");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
                .map_err(|e| Error::Internal(format!("Server error: {e}")))?;
        }
        Transport::Unix => {
            let path = server
                .socket_path
                .clone()
                .ok_or_else(|| Error::Validation("unix transport requires socket_path".into()))?;
            if path.exists() {
                let _ = std::fs::remove_file(&path);
            }
            let listener = tokio::net::UnixListener::bind(&path)
                .map_err(|e| Error::Internal(format!("Failed to bind {}: {e}", path.display())))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
            }
            info!(path = %path.display(), "Listening (unix)");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
                .map_err(|e| Error::Internal(format!("Server error: {e}")))?;
        }
    }

    runtime.shutdown();
    Ok(())
}

// ── auth helpers ─────────────────────────────────────────────────────

fn bearer(headers: &HeaderMap) -> Result<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .ok_or_else(|| Error::Unauthorized("Missing bearer credential".into()))
}

/// Enforce the operator admin token when one is configured. A daemon
/// without an admin token trusts its (loopback/unix) listener.
fn require_admin(runtime: &Runtime, headers: &HeaderMap) -> Result<()> {
    let Some(expected) = runtime.config.admin_token.as_deref() else {
        return Ok(());
    };
    let presented = headers.get(ADMIN_TOKEN_HEADER).and_then(|v| v.to_str().ok());
    check_admin_token(expected, presented)
}

/// True when a configured admin token was presented and checks out.
fn is_admin(runtime: &Runtime, headers: &HeaderMap) -> bool {
    runtime
        .config
        .admin_token
        .as_deref()
        .is_some_and(|expected| {
            check_admin_token(
                expected,
                headers.get(ADMIN_TOKEN_HEADER).and_then(|v| v.to_str().ok()),
            )
            .is_ok()
        })
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
}

// ── handlers ─────────────────────────────────────────────────────────

async fn health(State(runtime): State<Arc<Runtime>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "vaultUnlocked": runtime.vault.is_unlocked(),
        "auditEntries": runtime.audit.entry_count().unwrap_or(0),
    }))
}

async fn proxy(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Json(mut request): Json<BrokeredRequest>,
) -> Result<Json<crate::proxy::BrokeredResponse>> {
    let principal = runtime.resolver.resolve(bearer(&headers)?)?;
    // The authenticated principal is authoritative over the request body.
    request.skill_id = principal.skill_id;
    let response = runtime.pipeline.execute(request).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreCredentialRequest {
    handle: String,
    provider: String,
    secret: String,
    #[serde(default)]
    ttl_seconds: Option<u64>,
    #[serde(default)]
    metadata: Option<std::collections::HashMap<String, String>>,
}

async fn store_credential(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Json(request): Json<StoreCredentialRequest>,
) -> Result<Json<serde_json::Value>> {
    require_admin(&runtime, &headers)?;
    let metadata = runtime.vault.store_credential(
        &request.handle,
        &request.provider,
        &request.secret,
        request.ttl_seconds.map(std::time::Duration::from_secs),
        request.metadata,
    )?;
    runtime
        .audit
        .append(
            AuditEvent::CredentialStore,
            AuditContext {
                provider: Some(metadata.provider.clone()),
                outcome: Some("ok".into()),
                details: Some(format!("handle={}", metadata.handle)),
                ..AuditContext::default()
            },
        )
        .await?;
    Ok(Json(json!({ "credential": metadata })))
}

async fn list_credentials(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    require_admin(&runtime, &headers)?;
    let credentials = runtime.vault.list_credential_metadata()?;
    Ok(Json(json!({ "credentials": credentials })))
}

async fn delete_credential(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Path(handle): Path<String>,
) -> Result<Json<serde_json::Value>> {
    require_admin(&runtime, &headers)?;
    runtime.vault.delete_credential(&handle)?;
    runtime
        .audit
        .append(
            AuditEvent::CredentialDelete,
            AuditContext {
                outcome: Some("ok".into()),
                details: Some(format!("handle={handle}")),
                ..AuditContext::default()
            },
        )
        .await?;
    Ok(Json(json!({ "deleted": handle })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantRequest {
    skill_id: String,
    provider: String,
    scope: String,
    #[serde(default)]
    rate_limit_per_minute: Option<u32>,
}

async fn create_grant(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Json(request): Json<GrantRequest>,
) -> Result<Json<serde_json::Value>> {
    require_admin(&runtime, &headers)?;
    let grant = runtime.scopes.grant(
        &request.skill_id,
        &request.provider,
        &request.scope,
        request.rate_limit_per_minute,
    )?;
    runtime
        .audit
        .append(
            AuditEvent::GrantCreate,
            AuditContext {
                skill_id: Some(grant.skill_id.clone()),
                provider: Some(grant.provider.clone()),
                scope: Some(grant.scope.clone()),
                outcome: Some("ok".into()),
                ..AuditContext::default()
            },
        )
        .await?;
    Ok(Json(json!({ "grant": grant })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevokeGrantRequest {
    skill_id: String,
    provider: String,
    #[serde(default)]
    scope: Option<String>,
}

async fn revoke_grant(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Json(request): Json<RevokeGrantRequest>,
) -> Result<Json<serde_json::Value>> {
    require_admin(&runtime, &headers)?;
    let revoked = runtime
        .scopes
        .revoke(&request.skill_id, &request.provider, request.scope.as_deref())?;
    runtime
        .audit
        .append(
            AuditEvent::GrantRevoke,
            AuditContext {
                skill_id: Some(request.skill_id.clone()),
                provider: Some(request.provider.clone()),
                scope: request.scope.clone(),
                outcome: Some("ok".into()),
                ..AuditContext::default()
            },
        )
        .await?;
    Ok(Json(json!({ "revoked": revoked })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmergencyRevokeRequest {
    #[serde(default)]
    skill_id: Option<String>,
}

async fn emergency_revoke(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Json(request): Json<EmergencyRevokeRequest>,
) -> Result<Json<serde_json::Value>> {
    require_admin(&runtime, &headers)?;
    let revoked = runtime.scopes.emergency_revoke_all(request.skill_id.as_deref())?;
    runtime
        .audit
        .append(
            AuditEvent::GrantEmergencyRevoke,
            AuditContext {
                skill_id: request.skill_id.clone(),
                outcome: Some("ok".into()),
                details: Some(format!("revoked={revoked}")),
                ..AuditContext::default()
            },
        )
        .await?;
    Ok(Json(json!({ "revoked": revoked })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListGrantsQuery {
    #[serde(default)]
    skill_id: Option<String>,
}

async fn list_grants(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Query(query): Query<ListGrantsQuery>,
) -> Result<Json<serde_json::Value>> {
    require_admin(&runtime, &headers)?;
    let grants = runtime.scopes.list_grants(query.skill_id.as_deref());
    Ok(Json(json!({ "grants": grants })))
}

async fn issue_skill_token(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Path(skill_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    require_admin(&runtime, &headers)?;
    let token = runtime.skill_tokens.issue(&skill_id)?;
    runtime
        .audit
        .append(
            AuditEvent::SkillTokenIssue,
            AuditContext {
                skill_id: Some(skill_id.clone()),
                outcome: Some("ok".into()),
                ..AuditContext::default()
            },
        )
        .await?;
    // One-time disclosure: the plaintext exists only in this response.
    Ok(Json(json!({ "skillId": skill_id, "token": token })))
}

async fn revoke_skill_token(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Path(skill_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    require_admin(&runtime, &headers)?;
    runtime.skill_tokens.revoke(&skill_id)?;
    runtime
        .audit
        .append(
            AuditEvent::SkillTokenRevoke,
            AuditContext {
                skill_id: Some(skill_id.clone()),
                outcome: Some("ok".into()),
                ..AuditContext::default()
            },
        )
        .await?;
    Ok(Json(json!({ "revoked": skill_id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueSessionRequest {
    skill_id: String,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

async fn issue_session(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Json(request): Json<IssueSessionRequest>,
) -> Result<Json<serde_json::Value>> {
    require_admin(&runtime, &headers)?;
    let ttl = std::time::Duration::from_secs(
        request
            .ttl_seconds
            .unwrap_or(runtime.config.hardening.session_ttl_seconds),
    );
    let token = runtime.sessions.issue(&request.skill_id, request.scope, ttl)?;
    runtime
        .audit
        .append(
            AuditEvent::SessionTokenIssue,
            AuditContext {
                skill_id: Some(request.skill_id.clone()),
                outcome: Some("ok".into()),
                ..AuditContext::default()
            },
        )
        .await?;
    Ok(Json(json!({ "token": token })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevokeSessionRequest {
    token: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn revoke_session(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Json(request): Json<RevokeSessionRequest>,
) -> Result<Json<serde_json::Value>> {
    require_admin(&runtime, &headers)?;
    let jti = runtime.sessions.revoke_token(&request.token, request.reason).await?;
    runtime
        .audit
        .append(
            AuditEvent::SessionTokenRevoke,
            AuditContext {
                outcome: Some("ok".into()),
                details: Some(format!("jti={jti}")),
                ..AuditContext::default()
            },
        )
        .await?;
    Ok(Json(json!({ "revokedJti": jti })))
}

async fn verify_audit(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
) -> Result<Json<crate::audit::IntegrityReport>> {
    require_admin(&runtime, &headers)?;
    Ok(Json(runtime.audit.verify_integrity()?))
}

// ── identity routes ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChallengeRequest {
    skill_id: String,
    provider: String,
    account_id: String,
    method: ChallengeMethod,
}

async fn create_challenge(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Json(request): Json<CreateChallengeRequest>,
) -> Result<Json<crate::identity::CreatedChallenge>> {
    if runtime.config.hardening.require_admin_token_for_identity {
        require_admin(&runtime, &headers)?;
    }
    let created = runtime
        .identity
        .create_challenge(&request.skill_id, &request.provider, &request.account_id, request.method)
        .await?;
    Ok(Json(created))
}

async fn get_challenge(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let (requester, allow_any) = identity_caller(&runtime, &headers)?;
    let challenge = runtime
        .identity
        .get_challenge_for_skill(&id, requester.as_deref(), allow_any)
        .ok_or_else(|| Error::NotFound(format!("Unknown challenge: {id}")))?;
    Ok(Json(json!({ "challenge": challenge })))
}

async fn verify_challenge(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(proof): Json<serde_json::Value>,
) -> Result<Json<crate::identity::VerifyOutcome>> {
    let (requester, allow_any) = identity_caller(&runtime, &headers)?;
    if let Some(skill_id) = requester.as_deref() {
        runtime
            .identity
            .check_verify_quota(skill_id, client_ip(&headers).as_deref())?;
    }
    let outcome = runtime
        .identity
        .verify(&id, requester.as_deref(), allow_any, &proof)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListProofsQuery {
    #[serde(default)]
    skill_id: Option<String>,
}

async fn list_proofs(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Query(query): Query<ListProofsQuery>,
) -> Result<Json<serde_json::Value>> {
    let (requester, allow_any) = identity_caller(&runtime, &headers)?;
    // Skills only see their own proofs; the admin may filter freely.
    let filter = if allow_any {
        query.skill_id
    } else {
        requester
    };
    let proofs = runtime.identity.list_proofs(filter.as_deref());
    Ok(Json(json!({ "proofs": proofs })))
}

async fn revoke_proof(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Path(challenge_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    require_admin(&runtime, &headers)?;
    runtime.identity.revoke_proof(&challenge_id).await?;
    Ok(Json(json!({ "revoked": challenge_id })))
}

/// Who is calling an identity route: an admin (sees everything) or a
/// skill principal (confined to its own challenges).
fn identity_caller(runtime: &Runtime, headers: &HeaderMap) -> Result<(Option<String>, bool)> {
    if is_admin(runtime, headers) {
        return Ok((None, true));
    }
    let principal = runtime.resolver.resolve(bearer(headers)?)?;
    Ok((Some(principal.skill_id), false))
}

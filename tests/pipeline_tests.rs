//! End-to-end brokered-request pipeline tests
//!
//! Exercises the composed pipeline against a local stub upstream:
//! - per-grant rate limiting across consecutive calls
//! - credential injection (the upstream sees the real bearer header)
//! - endpoint-policy blocks before any network I/O
//! - firewall burst blocking
//! - the audit trail each path leaves behind

use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::Arc;

use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use pretty_assertions::assert_eq;
use serde_json::json;

use clauth::audit::AuditLog;
use clauth::crypto::KdfParams;
use clauth::firewall::{Firewall, FirewallConfig};
use clauth::proxy::{BrokeredRequest, EndpointPolicy, Pipeline, PipelineConfig};
use clauth::scopes::ScopeEngine;
use clauth::vault::Vault;

const PASSPHRASE: &str = "correct horse battery staple";

fn fast_kdf() -> KdfParams {
    KdfParams {
        memory: 8 * 1024,
        iterations: 1,
        parallelism: 1,
        tag_length: 32,
    }
}

struct Harness {
    vault: Arc<Vault>,
    scopes: Arc<ScopeEngine>,
    audit: Arc<AuditLog>,
    pipeline: Pipeline,
    _dir: tempfile::TempDir,
}

fn harness(firewall_config: FirewallConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let vault = Arc::new(Vault::new(dir.path().join("vault.enc"), fast_kdf(), None, None));
    vault.unlock(PASSPHRASE).unwrap();
    let scopes = Arc::new(ScopeEngine::load(dir.path().join("scopes.json")).unwrap());
    let firewall = Arc::new(
        Firewall::load(dir.path().join("firewall.json"), firewall_config, None).unwrap(),
    );
    let audit = Arc::new(AuditLog::new(dir.path().join("audit.ndjson")));

    let pipeline = Pipeline::new(
        Arc::clone(&vault),
        Arc::clone(&scopes),
        firewall,
        Arc::clone(&audit),
        EndpointPolicy::new(false),
        None,
        PipelineConfig {
            enforce_https: false,
            ..PipelineConfig::default()
        },
    );
    Harness {
        vault,
        scopes,
        audit,
        pipeline,
        _dir: dir,
    }
}

/// Stub upstream echoing the auth headers it receives.
async fn spawn_upstream() -> String {
    let app = Router::new()
        .route(
            "/user",
            get(|headers: HeaderMap| async move {
                Json(json!({
                    "login": "octocat",
                    "receivedAuthorization": headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default(),
                }))
            }),
        )
        .route(
            "/tweets",
            post(|| async { Json(json!({ "posted": true })) }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, app).into_future());
    format!("http://{addr}")
}

fn local_metadata() -> Option<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    metadata.insert("allowedHosts".to_string(), "127.0.0.1".to_string());
    Some(metadata)
}

fn request(skill: &str, provider: &str, handle: &str, scope: &str, method: &str, endpoint: String) -> BrokeredRequest {
    BrokeredRequest {
        skill_id: skill.to_string(),
        provider: provider.to_string(),
        credential_handle: handle.to_string(),
        scope: scope.to_string(),
        method: method.to_string(),
        endpoint,
        headers: None,
        body: None,
    }
}

fn audit_events(dir: &std::path::Path) -> Vec<String> {
    let raw = std::fs::read_to_string(dir.join("audit.ndjson")).unwrap_or_default();
    raw.lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter_map(|v| v.get("event").and_then(|e| e.as_str()).map(ToString::to_string))
        .collect()
}

#[tokio::test]
async fn rate_limited_grant_denies_the_third_call() {
    let h = harness(FirewallConfig::default());
    let upstream = spawn_upstream().await;

    h.vault
        .store_credential("twitter-main", "twitter", "tw_secret", None, local_metadata())
        .unwrap();
    h.scopes
        .grant("skill.alpha", "twitter", "twitter:*", Some(2))
        .unwrap();

    let endpoint = format!("{upstream}/tweets");
    for _ in 0..2 {
        let response = h
            .pipeline
            .execute(request(
                "skill.alpha",
                "twitter",
                "twitter-main",
                "twitter:post",
                "POST",
                endpoint.clone(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    let err = h
        .pipeline
        .execute(request(
            "skill.alpha",
            "twitter",
            "twitter-main",
            "twitter:post",
            "POST",
            endpoint,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ACCESS_DENIED");

    let events = audit_events(h._dir.path());
    assert_eq!(events.iter().filter(|e| *e == "proxy.allow").count(), 2);
    assert!(events.contains(&"proxy.deny".to_string()));
    assert!(h.audit.verify_integrity().unwrap().valid);
}

#[tokio::test]
async fn upstream_call_carries_the_injected_bearer() {
    let h = harness(FirewallConfig::default());
    let upstream = spawn_upstream().await;

    let mut metadata = local_metadata().unwrap();
    metadata.insert("authType".to_string(), "bearer".to_string());
    h.vault
        .store_credential("github-main", "github", "ghp_x", None, Some(metadata))
        .unwrap();
    h.scopes
        .grant("skill.alpha", "github", "github:read", None)
        .unwrap();

    let response = h
        .pipeline
        .execute(request(
            "skill.alpha",
            "github",
            "github-main",
            "github:read",
            "GET",
            format!("{upstream}/user"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body["receivedAuthorization"], "Bearer ghp_x");

    let events = audit_events(h._dir.path());
    assert!(events.contains(&"proxy.allow".to_string()));
    assert!(h.audit.verify_integrity().unwrap().valid);
}

#[tokio::test]
async fn caller_cannot_override_the_authorization_header() {
    let h = harness(FirewallConfig::default());
    let upstream = spawn_upstream().await;

    h.vault
        .store_credential("github-main", "github", "ghp_x", None, local_metadata())
        .unwrap();
    h.scopes
        .grant("skill.alpha", "github", "github:*", None)
        .unwrap();

    let mut headers = HashMap::new();
    headers.insert("Authorization".to_string(), "Bearer forged".to_string());
    let mut req = request(
        "skill.alpha",
        "github",
        "github-main",
        "github:read",
        "GET",
        format!("{upstream}/user"),
    );
    req.headers = Some(headers);

    let response = h.pipeline.execute(req).await.unwrap();
    assert_eq!(response.body["receivedAuthorization"], "Bearer ghp_x");
}

#[tokio::test]
async fn off_list_endpoint_is_blocked_before_network() {
    let h = harness(FirewallConfig::default());

    h.vault
        .store_credential("github-main", "github", "ghp_x", None, None)
        .unwrap();
    h.scopes
        .grant("skill.alpha", "github", "github:*", None)
        .unwrap();

    // evil.example.com resolves nowhere; if the pipeline tried the network
    // this would be an UPSTREAM_ERROR, not a VALIDATION_ERROR.
    let err = h
        .pipeline
        .execute(request(
            "skill.alpha",
            "github",
            "github-main",
            "github:read",
            "GET",
            "https://evil.example.com/steal".to_string(),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    let events = audit_events(h._dir.path());
    assert!(events.contains(&"proxy.deny".to_string()));
    assert!(h.audit.verify_integrity().unwrap().valid);
}

#[tokio::test]
async fn burst_blocks_the_fourth_rapid_call() {
    let h = harness(FirewallConfig {
        burst_limit: 3,
        burst_window_ms: 60_000,
        ..FirewallConfig::default()
    });
    let upstream = spawn_upstream().await;

    h.vault
        .store_credential("github-main", "github", "ghp_x", None, local_metadata())
        .unwrap();
    h.scopes
        .grant("skill.alpha", "github", "github:*", Some(100))
        .unwrap();

    let endpoint = format!("{upstream}/user");
    for i in 0..3 {
        let response = h
            .pipeline
            .execute(request(
                "skill.alpha",
                "github",
                "github-main",
                "github:read",
                "GET",
                endpoint.clone(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status, 200, "request {i} should pass");
    }

    let err = h
        .pipeline
        .execute(request(
            "skill.alpha",
            "github",
            "github-main",
            "github:read",
            "GET",
            endpoint,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ACCESS_DENIED");
    assert!(err.to_string().contains("Burst threshold exceeded"));

    let events = audit_events(h._dir.path());
    assert!(events.contains(&"firewall.alert".to_string()));
    assert!(h.audit.verify_integrity().unwrap().valid);
}

#[tokio::test]
async fn scope_denial_feeds_the_firewall_baseline() {
    let h = harness(FirewallConfig::default());

    h.vault
        .store_credential("github-main", "github", "ghp_x", None, None)
        .unwrap();
    // No grant at all for this skill

    let err = h
        .pipeline
        .execute(request(
            "skill.rogue",
            "github",
            "github-main",
            "github:admin",
            "GET",
            "https://api.github.com/user".to_string(),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ACCESS_DENIED");

    // The denial still registered in the skill's baseline
    let events = audit_events(h._dir.path());
    assert!(events.contains(&"proxy.deny".to_string()));
    let raw = std::fs::read_to_string(h._dir.path().join("firewall.json")).unwrap();
    assert!(raw.contains("skill.rogue"));
}

#[tokio::test]
async fn unreachable_upstream_is_an_upstream_error() {
    let h = harness(FirewallConfig::default());

    let mut metadata = HashMap::new();
    metadata.insert("allowedHosts".to_string(), "127.0.0.1".to_string());
    h.vault
        .store_credential("github-main", "github", "ghp_x", None, Some(metadata))
        .unwrap();
    h.scopes
        .grant("skill.alpha", "github", "github:*", None)
        .unwrap();

    // Port 1 refuses connections
    let err = h
        .pipeline
        .execute(request(
            "skill.alpha",
            "github",
            "github-main",
            "github:read",
            "GET",
            "http://127.0.0.1:1/user".to_string(),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UPSTREAM_ERROR");

    let events = audit_events(h._dir.path());
    assert!(events.contains(&"proxy.error".to_string()));
    assert!(h.audit.verify_integrity().unwrap().valid);
}

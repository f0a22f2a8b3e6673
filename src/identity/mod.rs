//! Identity broker: challenge/verify state machine for proving that a
//! skill's principal controls an account with an external provider.
//!
//! A challenge is created `pending` with a TTL and walks a one-way
//! machine: `pending → verified | failed | expired`. Verification methods:
//!
//! - `signed-challenge` — the caller echoes the random challenge and names
//!   a vault credential; the daemon asks the provider who that credential
//!   belongs to.
//! - `oauth` — authorization-code flow whose `state` is HMAC-bound to the
//!   challenge id.
//! - `email` — a 6-digit code delivered out-of-band; only
//!   `HMAC(master, id:account:code)` is stored.
//!
//! Successful verification atomically emits a proof record signed by the
//! master key. All comparisons of challenge material are constant-time.

pub mod providers;

use std::collections::HashMap;
use std::fs;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use url::Url;

use crate::alerts::{AlertEvent, AlertSeverity, AlertSink};
use crate::audit::{AuditContext, AuditEvent, AuditLog};
use crate::storage::atomic_write_json;
use crate::vault::Vault;
use crate::{Error, Result};
pub use providers::{HttpIdentityVerifier, IdentityEndpoint, IdentityVerifier};

type HmacSha256 = Hmac<Sha256>;

/// How ownership is proven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeMethod {
    /// Echo the challenge plus a vault credential the provider recognizes.
    SignedChallenge,
    /// OAuth authorization-code flow with an HMAC-bound state.
    Oauth,
    /// Out-of-band 6-digit code.
    Email,
}

impl std::fmt::Display for ChallengeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SignedChallenge => write!(f, "signed-challenge"),
            Self::Oauth => write!(f, "oauth"),
            Self::Email => write!(f, "email"),
        }
    }
}

/// Challenge lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    /// Awaiting verification.
    Pending,
    /// Proven; a proof record exists.
    Verified,
    /// TTL elapsed before verification.
    Expired,
    /// Attempts exhausted or terminal failure.
    Failed,
}

/// One ownership challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityChallenge {
    /// Challenge id (UUID).
    pub id: String,
    /// Skill that requested the challenge.
    pub skill_id: String,
    /// External provider.
    pub provider: String,
    /// Claimed account identifier.
    pub account_id: String,
    /// Verification method.
    pub method: ChallengeMethod,
    /// Random 256-bit value (signed/oauth) or HMAC code envelope (email).
    pub challenge: String,
    /// Current state.
    pub status: ChallengeStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// Set when verified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    /// Verify attempts so far; monotonically increasing.
    pub attempts: u32,
    /// Last verify attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Proof that a challenge verified, signed by the master key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityProof {
    /// Originating challenge.
    pub challenge_id: String,
    /// Provider the account lives at.
    pub provider: String,
    /// Proven account.
    pub account_id: String,
    /// Method that proved it.
    pub method: ChallengeMethod,
    /// When verification happened.
    pub verified_at: DateTime<Utc>,
    /// `HMAC(master, id:provider:account:method)`, hex.
    pub signature: String,
}

/// Outcome of a verify attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    /// Resulting challenge status.
    pub status: ChallengeStatus,
    /// Attempts consumed so far.
    pub attempts: u32,
    /// Present exactly when this attempt verified the challenge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<IdentityProof>,
}

impl VerifyOutcome {
    fn failed() -> Self {
        Self {
            status: ChallengeStatus::Failed,
            attempts: 0,
            proof: None,
        }
    }
}

/// Result of challenge creation; oauth challenges also carry the
/// authorization URL the operator sends the user to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedChallenge {
    /// The stored challenge (pending).
    pub challenge: IdentityChallenge,
    /// Authorization URL for the oauth method.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_url: Option<String>,
}

/// OAuth provider settings for the oauth challenge method.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityOAuthProviderConfig {
    /// Authorization endpoint.
    pub authorize_url: String,
    /// Token endpoint for the code exchange.
    pub token_url: String,
    /// OAuth client id.
    pub client_id: String,
    /// Client secret, when required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Redirect URI registered with the provider.
    pub redirect_uri: String,
    /// Scopes to request.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Broker tunables (from `hardening.*`).
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Challenge TTL in seconds.
    pub challenge_ttl_secs: u64,
    /// Attempts before a challenge fails terminally.
    pub max_verify_attempts: u32,
    /// Verify-call quota per skill per minute (0 = unlimited).
    pub verify_per_skill_per_minute: u32,
    /// Verify-call quota per client IP per minute (0 = unlimited).
    pub verify_per_ip_per_minute: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            challenge_ttl_secs: 600,
            max_verify_attempts: 3,
            verify_per_skill_per_minute: 10,
            verify_per_ip_per_minute: 30,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IdentityStateFile {
    challenges: HashMap<String, IdentityChallenge>,
    proofs: Vec<IdentityProof>,
}

/// The identity broker.
pub struct IdentityBroker {
    path: PathBuf,
    vault: Arc<Vault>,
    audit: Arc<AuditLog>,
    alerts: Option<Arc<dyn AlertSink>>,
    verifier: Arc<dyn IdentityVerifier>,
    oauth_providers: HashMap<String, IdentityOAuthProviderConfig>,
    email_webhook: Option<String>,
    config: IdentityConfig,
    client: reqwest::Client,
    state: Mutex<IdentityStateFile>,
    skill_quota: Option<DefaultKeyedRateLimiter<String>>,
    ip_quota: Option<DefaultKeyedRateLimiter<String>>,
}

impl IdentityBroker {
    /// Load broker state from `identity-state.json`.
    ///
    /// # Errors
    ///
    /// Fails when an existing file cannot be parsed.
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        path: PathBuf,
        vault: Arc<Vault>,
        audit: Arc<AuditLog>,
        alerts: Option<Arc<dyn AlertSink>>,
        verifier: Arc<dyn IdentityVerifier>,
        oauth_providers: HashMap<String, IdentityOAuthProviderConfig>,
        email_webhook: Option<String>,
        config: IdentityConfig,
    ) -> Result<Self> {
        let state = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)
                .map_err(|e| Error::Validation(format!("Malformed identity state: {e}")))?
        } else {
            IdentityStateFile::default()
        };

        let keyed = |per_minute: u32| {
            NonZeroU32::new(per_minute).map(|n| RateLimiter::keyed(Quota::per_minute(n)))
        };
        let skill_quota = keyed(config.verify_per_skill_per_minute);
        let ip_quota = keyed(config.verify_per_ip_per_minute);

        debug!(
            challenges = state.challenges.len(),
            proofs = state.proofs.len(),
            "Identity broker loaded"
        );
        Ok(Self {
            path,
            vault,
            audit,
            alerts,
            verifier,
            oauth_providers,
            email_webhook,
            config,
            client: reqwest::Client::new(),
            state: Mutex::new(state),
            skill_quota,
            ip_quota,
        })
    }

    /// Charge the per-skill / per-IP verify quotas.
    ///
    /// # Errors
    ///
    /// `RATE_LIMITED` when either limiter refuses.
    pub fn check_verify_quota(&self, skill_id: &str, client_ip: Option<&str>) -> Result<()> {
        if let Some(quota) = &self.skill_quota {
            if quota.check_key(&skill_id.to_string()).is_err() {
                return Err(Error::RateLimited(format!(
                    "Identity verify quota exceeded for skill {skill_id}"
                )));
            }
        }
        if let (Some(quota), Some(ip)) = (&self.ip_quota, client_ip) {
            if quota.check_key(&ip.to_string()).is_err() {
                return Err(Error::RateLimited(format!(
                    "Identity verify quota exceeded for {ip}"
                )));
            }
        }
        Ok(())
    }

    /// Create a pending challenge.
    ///
    /// # Errors
    ///
    /// `VALIDATION_ERROR` on empty fields, an oauth method without provider
    /// config, or an email method without a delivery webhook.
    pub async fn create_challenge(
        &self,
        skill_id: &str,
        provider: &str,
        account_id: &str,
        method: ChallengeMethod,
    ) -> Result<CreatedChallenge> {
        let skill_id = skill_id.trim();
        let provider = provider.trim().to_lowercase();
        let account_id = account_id.trim();
        if skill_id.is_empty() || provider.is_empty() || account_id.is_empty() {
            return Err(Error::Validation(
                "skillId, provider, and accountId are required".into(),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = now + TimeDelta::seconds(self.config.challenge_ttl_secs as i64);

        let mut authorization_url = None;
        let challenge_value = match method {
            ChallengeMethod::SignedChallenge => random_challenge(),
            ChallengeMethod::Oauth => {
                let oauth = self.oauth_providers.get(&provider).ok_or_else(|| {
                    Error::Validation(format!("No oauth configuration for provider {provider}"))
                })?;
                let state = format!("{id}:{}", &self.hmac_hex(id.as_bytes())?[..16]);
                authorization_url = Some(build_authorize_url(oauth, &state)?);
                random_challenge()
            }
            ChallengeMethod::Email => {
                let Some(webhook) = self.email_webhook.clone() else {
                    return Err(Error::Validation(
                        "Email challenges require a configured delivery webhook".into(),
                    ));
                };
                let code = format!("{:06}", rand::rng().random_range(0..1_000_000u32));
                let envelope = self.email_code_hmac(&id, account_id, &code)?;
                self.deliver_email_code(&webhook, skill_id, &provider, account_id, &code);
                envelope
            }
        };

        let challenge = IdentityChallenge {
            id: id.clone(),
            skill_id: skill_id.to_string(),
            provider: provider.clone(),
            account_id: account_id.to_string(),
            method,
            challenge: challenge_value,
            status: ChallengeStatus::Pending,
            created_at: now,
            expires_at,
            verified_at: None,
            attempts: 0,
            last_attempt_at: None,
        };

        {
            let mut state = self.state.lock();
            state.challenges.insert(id.clone(), challenge.clone());
            self.persist(&state)?;
        }

        self.audit
            .append(
                AuditEvent::IdentityChallenge,
                AuditContext {
                    skill_id: Some(skill_id.to_string()),
                    provider: Some(provider),
                    outcome: Some("created".into()),
                    details: Some(format!("method={method} id={id}")),
                    ..AuditContext::default()
                },
            )
            .await?;

        info!(id = %id, method = %method, "Identity challenge created");
        Ok(CreatedChallenge {
            challenge,
            authorization_url,
        })
    }

    /// Run one verify attempt against a challenge.
    ///
    /// An unknown challenge or a cross-skill access (without
    /// `allow_any_skill`) reports `failed` without touching any state.
    ///
    /// # Errors
    ///
    /// Only infrastructure failures (persistence, audit); protocol
    /// failures are reported in the outcome.
    pub async fn verify(
        &self,
        challenge_id: &str,
        requester_skill_id: Option<&str>,
        allow_any_skill: bool,
        proof: &serde_json::Value,
    ) -> Result<VerifyOutcome> {
        let now = Utc::now();

        // Phase 1 (synchronous, under the state lock): walk the state
        // machine up to the method-specific check.
        enum Gate {
            Done(VerifyOutcome),
            RunCheck(IdentityChallenge),
        }

        let gate = {
            let mut state = self.state.lock();
            let Some(challenge) = state.challenges.get_mut(challenge_id) else {
                return Ok(VerifyOutcome::failed());
            };

            if !allow_any_skill
                && requester_skill_id.is_none_or(|requester| requester != challenge.skill_id)
            {
                warn!(id = %challenge_id, "Cross-skill identity verify refused");
                return Ok(VerifyOutcome::failed());
            }

            if challenge.status != ChallengeStatus::Pending {
                return Ok(VerifyOutcome {
                    status: challenge.status,
                    attempts: challenge.attempts,
                    proof: None,
                });
            }

            if now >= challenge.expires_at {
                challenge.status = ChallengeStatus::Expired;
                let outcome = VerifyOutcome {
                    status: ChallengeStatus::Expired,
                    attempts: challenge.attempts,
                    proof: None,
                };
                self.persist(&state)?;
                Gate::Done(outcome)
            } else if challenge.attempts >= self.config.max_verify_attempts {
                challenge.status = ChallengeStatus::Failed;
                let outcome = VerifyOutcome {
                    status: ChallengeStatus::Failed,
                    attempts: challenge.attempts,
                    proof: None,
                };
                self.persist(&state)?;
                Gate::Done(outcome)
            } else {
                challenge.attempts += 1;
                challenge.last_attempt_at = Some(now);
                let snapshot = challenge.clone();
                self.persist(&state)?;
                Gate::RunCheck(snapshot)
            }
        };

        let challenge = match gate {
            Gate::Done(outcome) => {
                self.audit_verify(challenge_id, &outcome).await?;
                return Ok(outcome);
            }
            Gate::RunCheck(challenge) => challenge,
        };

        // Phase 2: the method-specific proof check (may call out).
        let proven = match challenge.method {
            ChallengeMethod::SignedChallenge => self.check_signed(&challenge, proof).await,
            ChallengeMethod::Oauth => self.check_oauth(&challenge, proof).await,
            ChallengeMethod::Email => self.check_email(&challenge, proof),
        };
        let proven = match proven {
            Ok(result) => result,
            Err(e) => {
                debug!(id = %challenge.id, error = %e, "Proof check errored; treating as failure");
                false
            }
        };

        // Phase 3: apply the transition.
        let outcome = {
            let mut state = self.state.lock();
            let Some(stored) = state.challenges.get_mut(&challenge.id) else {
                return Ok(VerifyOutcome::failed());
            };

            if proven {
                stored.status = ChallengeStatus::Verified;
                stored.verified_at = Some(now);
                let proof_record = IdentityProof {
                    challenge_id: stored.id.clone(),
                    provider: stored.provider.clone(),
                    account_id: stored.account_id.clone(),
                    method: stored.method,
                    verified_at: now,
                    signature: self.proof_signature(stored)?,
                };
                let attempts = stored.attempts;
                state.proofs.push(proof_record.clone());
                self.persist(&state)?;
                VerifyOutcome {
                    status: ChallengeStatus::Verified,
                    attempts,
                    proof: Some(proof_record),
                }
            } else {
                if stored.attempts >= self.config.max_verify_attempts {
                    stored.status = ChallengeStatus::Failed;
                }
                let outcome = VerifyOutcome {
                    status: stored.status,
                    attempts: stored.attempts,
                    proof: None,
                };
                self.persist(&state)?;
                outcome
            }
        };

        self.audit_verify(&challenge.id, &outcome).await?;
        if outcome.status == ChallengeStatus::Verified {
            if let Some(alerts) = &self.alerts {
                alerts.dispatch(
                    AlertEvent::new(
                        AlertSeverity::Info,
                        "identity",
                        format!(
                            "Account {} at {} verified via {}",
                            challenge.account_id, challenge.provider, challenge.method
                        ),
                    )
                    .with_skill(challenge.skill_id.clone()),
                );
            }
        }
        Ok(outcome)
    }

    /// Fetch a challenge, hiding it from other skills.
    #[must_use]
    pub fn get_challenge_for_skill(
        &self,
        challenge_id: &str,
        requester_skill_id: Option<&str>,
        allow_any_skill: bool,
    ) -> Option<IdentityChallenge> {
        let state = self.state.lock();
        let challenge = state.challenges.get(challenge_id)?;
        if !allow_any_skill
            && requester_skill_id.is_none_or(|requester| requester != challenge.skill_id)
        {
            return None;
        }
        Some(challenge.clone())
    }

    /// Proofs, optionally narrowed to challenges owned by one skill.
    #[must_use]
    pub fn list_proofs(&self, skill_id: Option<&str>) -> Vec<IdentityProof> {
        let state = self.state.lock();
        state
            .proofs
            .iter()
            .filter(|proof| {
                let Some(challenge) = state.challenges.get(&proof.challenge_id) else {
                    return false;
                };
                challenge.status == ChallengeStatus::Verified
                    && skill_id.is_none_or(|s| s == challenge.skill_id)
            })
            .cloned()
            .collect()
    }

    /// Destroy a proof.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` when no proof exists for the challenge.
    pub async fn revoke_proof(&self, challenge_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            let before = state.proofs.len();
            state.proofs.retain(|p| p.challenge_id != challenge_id);
            if state.proofs.len() == before {
                return Err(Error::NotFound(format!(
                    "No proof for challenge {challenge_id}"
                )));
            }
            self.persist(&state)?;
        }
        self.audit
            .append(
                AuditEvent::IdentityRevoke,
                AuditContext {
                    outcome: Some("revoked".into()),
                    details: Some(format!("challenge={challenge_id}")),
                    ..AuditContext::default()
                },
            )
            .await?;
        info!(id = %challenge_id, "Identity proof revoked");
        Ok(())
    }

    // ── method-specific proof checks ─────────────────────────────────

    /// `{credentialHandle, challenge, accountId?}` — echo the challenge and
    /// let the provider confirm whose credential that is.
    async fn check_signed(
        &self,
        challenge: &IdentityChallenge,
        proof: &serde_json::Value,
    ) -> Result<bool> {
        let Some(handle) = proof.get("credentialHandle").and_then(|v| v.as_str()) else {
            return Ok(false);
        };
        let Some(echoed) = proof.get("challenge").and_then(|v| v.as_str()) else {
            return Ok(false);
        };
        if !ct_str_eq(&challenge.challenge, echoed) {
            return Ok(false);
        }
        if let Some(claimed) = proof.get("accountId").and_then(|v| v.as_str()) {
            if !claimed.eq_ignore_ascii_case(&challenge.account_id) {
                return Ok(false);
            }
        }

        let credential = self.vault.get_credential(handle, Some(&challenge.provider))?;
        self.verifier
            .verify_ownership(&challenge.provider, &credential.secret, &challenge.account_id)
            .await
    }

    /// `{state, code}` — validate the HMAC-bound state, exchange the code,
    /// and ask the provider who the access token belongs to.
    async fn check_oauth(
        &self,
        challenge: &IdentityChallenge,
        proof: &serde_json::Value,
    ) -> Result<bool> {
        let Some(state) = proof.get("state").and_then(|v| v.as_str()) else {
            return Ok(false);
        };
        let Some(code) = proof.get("code").and_then(|v| v.as_str()) else {
            return Ok(false);
        };
        let Some((state_id, state_sig)) = state.split_once(':') else {
            return Ok(false);
        };
        if state_id != challenge.id {
            return Ok(false);
        }
        let expected = &self.hmac_hex(challenge.id.as_bytes())?[..16];
        if !ct_str_eq(expected, state_sig) {
            return Ok(false);
        }

        let Some(oauth) = self.oauth_providers.get(&challenge.provider) else {
            return Ok(false);
        };
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("client_id", oauth.client_id.clone()),
            ("redirect_uri", oauth.redirect_uri.clone()),
        ];
        if let Some(secret) = &oauth.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        let response = self
            .client
            .post(&oauth.token_url)
            .header("accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("Token endpoint unreachable: {e}")))?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("Malformed token response: {e}")))?;
        let Some(access_token) = body.get("access_token").and_then(|v| v.as_str()) else {
            return Ok(false);
        };

        self.verifier
            .verify_ownership(&challenge.provider, access_token, &challenge.account_id)
            .await
    }

    /// `{code}` — recompute the HMAC envelope from the submitted code.
    fn check_email(&self, challenge: &IdentityChallenge, proof: &serde_json::Value) -> Result<bool> {
        let Some(code) = proof.get("code").and_then(|v| v.as_str()) else {
            return Ok(false);
        };
        let recomputed = self.email_code_hmac(&challenge.id, &challenge.account_id, code)?;
        Ok(ct_str_eq(&challenge.challenge, &recomputed))
    }

    // ── helpers ──────────────────────────────────────────────────────

    fn deliver_email_code(
        &self,
        webhook: &str,
        skill_id: &str,
        provider: &str,
        account_id: &str,
        code: &str,
    ) {
        let client = self.client.clone();
        let webhook = webhook.to_string();
        let payload = serde_json::json!({
            "skillId": skill_id,
            "provider": provider,
            "accountId": account_id,
            "code": code,
        });
        tokio::spawn(async move {
            if let Err(e) = client.post(&webhook).json(&payload).send().await {
                warn!(error = %e, "Email code delivery failed");
            }
        });
    }

    async fn audit_verify(&self, challenge_id: &str, outcome: &VerifyOutcome) -> Result<()> {
        let ok = outcome.status == ChallengeStatus::Verified;
        self.audit
            .append(
                AuditEvent::IdentityVerify,
                AuditContext {
                    outcome: Some(if ok { "ok".into() } else { "failed".into() }),
                    details: Some(format!(
                        "challenge={challenge_id} status={:?} attempts={}",
                        outcome.status, outcome.attempts
                    )),
                    ..AuditContext::default()
                },
            )
            .await?;
        Ok(())
    }

    fn hmac_hex(&self, data: &[u8]) -> Result<String> {
        let master = self.vault.master_key()?;
        let mut mac = HmacSha256::new_from_slice(master.as_ref())
            .map_err(|e| Error::Internal(format!("HMAC init failed: {e}")))?;
        mac.update(data);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn email_code_hmac(&self, id: &str, account_id: &str, code: &str) -> Result<String> {
        self.hmac_hex(format!("{id}:{}:{code}", account_id.to_lowercase()).as_bytes())
    }

    fn proof_signature(&self, challenge: &IdentityChallenge) -> Result<String> {
        self.hmac_hex(
            format!(
                "{}:{}:{}:{}",
                challenge.id, challenge.provider, challenge.account_id, challenge.method
            )
            .as_bytes(),
        )
    }

    fn persist(&self, state: &IdentityStateFile) -> Result<()> {
        atomic_write_json(&self.path, state)
    }
}

/// 256 bits of challenge material, hex.
fn random_challenge() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

fn build_authorize_url(oauth: &IdentityOAuthProviderConfig, state: &str) -> Result<String> {
    let mut url = Url::parse(&oauth.authorize_url)
        .map_err(|e| Error::Validation(format!("Invalid authorize URL: {e}")))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &oauth.client_id)
        .append_pair("redirect_uri", &oauth.redirect_uri)
        .append_pair("state", state);
    if !oauth.scopes.is_empty() {
        url.query_pairs_mut()
            .append_pair("scope", &oauth.scopes.join(" "));
    }
    Ok(url.into())
}

/// Constant-time string equality; unequal lengths reject up front.
fn ct_str_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

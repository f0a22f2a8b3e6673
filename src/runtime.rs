//! The daemon runtime: one explicit value owning every subsystem.
//!
//! Startup is ordered — the vault unlocks first (everything downstream
//! derives keys from it), then the stores load, the pipeline is wired from
//! injected collaborators, and a `daemon.start` audit entry seals the
//! sequence. Shutdown locks the vault (zeroizing the master key) and
//! drops the cached session-signing key.

use std::sync::Arc;

use hkdf::Hkdf;
use sha2::Sha256;
use tracing::info;

use crate::alerts::{AlertSink, WebhookAlertRouter};
use crate::audit::{AuditContext, AuditEvent, AuditLog};
use crate::auth::{PrincipalResolver, SessionEngine, SkillTokenEngine};
use crate::config::Config;
use crate::firewall::Firewall;
use crate::identity::{HttpIdentityVerifier, IdentityBroker};
use crate::oauth::{OAuthManager, OAuthTokenStore};
use crate::proxy::{EndpointPolicy, Pipeline, PipelineConfig};
use crate::scopes::ScopeEngine;
use crate::storage::StateDir;
use crate::vault::Vault;
use crate::Result;

/// Everything the daemon owns, constructed once at start.
pub struct Runtime {
    /// Effective configuration.
    pub config: Config,
    /// State directory layout.
    pub state: StateDir,
    /// Encrypted credential vault.
    pub vault: Arc<Vault>,
    /// Hash-chained audit log.
    pub audit: Arc<AuditLog>,
    /// Scope grants + authorization.
    pub scopes: Arc<ScopeEngine>,
    /// Behavioral firewall.
    pub firewall: Arc<Firewall>,
    /// Skill bearer tokens.
    pub skill_tokens: Arc<SkillTokenEngine>,
    /// Session claims + revocation.
    pub sessions: Arc<SessionEngine>,
    /// Identity broker.
    pub identity: Arc<IdentityBroker>,
    /// OAuth refresher.
    pub oauth: Arc<OAuthManager>,
    /// Alert router, when channels are configured.
    pub alerts: Option<Arc<dyn AlertSink>>,
    /// Brokered-request pipeline.
    pub pipeline: Arc<Pipeline>,
    /// Skill-principal resolver.
    pub resolver: Arc<PrincipalResolver>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

impl Runtime {
    /// Build and start the runtime: unlock the vault, load every store,
    /// wire the pipeline, and audit `daemon.start`.
    ///
    /// # Errors
    ///
    /// Any subsystem load failure aborts startup.
    pub async fn build(config: Config, passphrase: &str) -> Result<Self> {
        let state = StateDir::open(config.state_dir())?;

        let alerts: Option<Arc<dyn AlertSink>> = if config.alert_channels.is_empty() {
            None
        } else {
            Some(WebhookAlertRouter::new(config.alert_channels.clone()))
        };

        // Vault first: subkeys for sessions, oauth, and identity HMACs all
        // come from the master key.
        let vault = Arc::new(Vault::new(
            state.vault(),
            config.kdf.clone(),
            config.vault_salt_bytes()?,
            None,
        ));
        vault.unlock(passphrase)?;

        let audit = Arc::new(AuditLog::new(state.audit()));
        let scopes = Arc::new(ScopeEngine::load(state.scopes())?);
        let firewall = Arc::new(Firewall::load(
            state.firewall(),
            config.firewall.clone(),
            alerts.clone(),
        )?);

        let pepper = match config.skill_token_salt_bytes()? {
            Some(pepper) => pepper,
            // No configured pepper: derive a per-deployment one from the
            // master key so hashes stay stable across restarts.
            None => {
                let master = vault.master_key()?;
                let hkdf = Hkdf::<Sha256>::new(None, master.as_ref());
                let mut okm = vec![0u8; 16];
                hkdf.expand(b"clauth-skill-token-pepper", &mut okm)
                    .map_err(|e| crate::Error::Internal(format!("Pepper derivation failed: {e}")))?;
                okm
            }
        };
        let skill_tokens = Arc::new(SkillTokenEngine::load(state.skill_auth(), pepper)?);
        let sessions = Arc::new(SessionEngine::load(
            state.session_revocations(),
            Arc::clone(&vault),
        )?);

        let oauth_store = OAuthTokenStore::load(state.oauth_tokens(), Arc::clone(&vault))?;
        let oauth = Arc::new(OAuthManager::new(
            oauth_store,
            Arc::clone(&vault),
            config.oauth_providers.clone(),
        ));

        let verifier = Arc::new(HttpIdentityVerifier::new(config.identity.endpoints.clone()));
        let identity = Arc::new(IdentityBroker::load(
            state.identity_state(),
            Arc::clone(&vault),
            Arc::clone(&audit),
            alerts.clone(),
            verifier,
            config.identity.oauth.clone(),
            config.identity.email_webhook.clone(),
            config.identity_config(),
        )?);

        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&vault),
            Arc::clone(&scopes),
            Arc::clone(&firewall),
            Arc::clone(&audit),
            EndpointPolicy::from_env(),
            Some(Arc::clone(&oauth) as Arc<dyn crate::oauth::OAuthRefresher>),
            PipelineConfig {
                enforce_https: config.hardening.enforce_https,
                ..PipelineConfig::default()
            },
        ));
        let resolver = Arc::new(PrincipalResolver::new(
            Arc::clone(&sessions),
            Arc::clone(&skill_tokens),
        ));

        audit
            .append(
                AuditEvent::DaemonStart,
                AuditContext {
                    outcome: Some("ok".into()),
                    details: Some(format!("clauth {}", env!("CARGO_PKG_VERSION"))),
                    ..AuditContext::default()
                },
            )
            .await?;
        info!(state_dir = %state.root().display(), "Runtime started");

        Ok(Self {
            config,
            state,
            vault,
            audit,
            scopes,
            firewall,
            skill_tokens,
            sessions,
            identity,
            oauth,
            alerts,
            pipeline,
            resolver,
        })
    }

    /// Lock the vault and zeroize derived key material.
    pub fn shutdown(&self) {
        self.sessions.invalidate_cache();
        self.vault.lock();
        info!("Runtime shut down; vault locked");
    }
}

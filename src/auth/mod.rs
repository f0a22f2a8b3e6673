//! Caller authentication: skill tokens, session claims, and the
//! principal resolver the HTTP surface binds to.

pub mod session;
pub mod skill_token;

use std::sync::Arc;

use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::{Error, Result};
pub use session::{SessionClaims, SessionEngine, SessionRevocation};
pub use skill_token::{SkillTokenEngine, SkillTokenRecord};

/// How a caller proved its skill identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    /// A signed session claim.
    Jwt,
    /// An opaque skill token.
    SkillToken,
}

/// The resolved caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Authenticated skill id.
    pub skill_id: String,
    /// Authentication method used.
    pub method: AuthMethod,
}

/// Resolves bearer credentials to a skill principal. Session claims are
/// checked first (cheap signature verification), then the skill-token
/// store is scanned.
pub struct PrincipalResolver {
    sessions: Arc<SessionEngine>,
    skill_tokens: Arc<SkillTokenEngine>,
}

impl PrincipalResolver {
    /// Wire the resolver over both token engines.
    #[must_use]
    pub fn new(sessions: Arc<SessionEngine>, skill_tokens: Arc<SkillTokenEngine>) -> Self {
        Self {
            sessions,
            skill_tokens,
        }
    }

    /// Resolve a bearer value to a principal.
    ///
    /// # Errors
    ///
    /// `UNAUTHORIZED` when neither engine recognizes the credential.
    pub fn resolve(&self, bearer: &str) -> Result<Principal> {
        if let Some(claims) = self.sessions.verify(bearer) {
            return Ok(Principal {
                skill_id: claims.sub,
                method: AuthMethod::Jwt,
            });
        }
        if let Some(skill_id) = self.skill_tokens.identify(bearer) {
            return Ok(Principal {
                skill_id,
                method: AuthMethod::SkillToken,
            });
        }
        Err(Error::Unauthorized("Unrecognized bearer credential".into()))
    }
}

/// Constant-time admin-token check. Unequal lengths are rejected before
/// the comparison.
///
/// # Errors
///
/// `UNAUTHORIZED` on a missing or mismatched token.
pub fn check_admin_token(expected: &str, presented: Option<&str>) -> Result<()> {
    let Some(presented) = presented else {
        return Err(Error::Unauthorized("Missing admin token".into()));
    };
    if expected.len() != presented.len() {
        return Err(Error::Unauthorized("Admin token mismatch".into()));
    }
    if bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) {
        Ok(())
    } else {
        Err(Error::Unauthorized("Admin token mismatch".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KdfParams;
    use crate::vault::Vault;
    use std::time::Duration;

    fn resolver(dir: &std::path::Path) -> (PrincipalResolver, Arc<SessionEngine>, Arc<SkillTokenEngine>) {
        let params = KdfParams {
            memory: 8 * 1024,
            iterations: 1,
            parallelism: 1,
            tag_length: 32,
        };
        let vault = Arc::new(Vault::new(dir.join("vault.enc"), params, None, None));
        vault.unlock("correct horse battery staple").unwrap();
        let sessions = Arc::new(
            SessionEngine::load(dir.join("session-revocations.json"), vault).unwrap(),
        );
        let skill_tokens = Arc::new(
            SkillTokenEngine::load(dir.join("skill-auth.json"), b"pepper".to_vec()).unwrap(),
        );
        (
            PrincipalResolver::new(Arc::clone(&sessions), Arc::clone(&skill_tokens)),
            sessions,
            skill_tokens,
        )
    }

    #[tokio::test]
    async fn resolves_session_claims_as_jwt() {
        let dir = tempfile::tempdir().unwrap();
        let (resolver, sessions, _) = resolver(dir.path());

        let token = sessions
            .issue("skill.alpha", None, Duration::from_secs(60))
            .unwrap();
        let principal = resolver.resolve(&token).unwrap();
        assert_eq!(principal.skill_id, "skill.alpha");
        assert_eq!(principal.method, AuthMethod::Jwt);
    }

    #[tokio::test]
    async fn resolves_skill_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let (resolver, _, skill_tokens) = resolver(dir.path());

        let token = skill_tokens.issue("skill.beta").unwrap();
        let principal = resolver.resolve(&token).unwrap();
        assert_eq!(principal.skill_id, "skill.beta");
        assert_eq!(principal.method, AuthMethod::SkillToken);
    }

    #[tokio::test]
    async fn unknown_bearer_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let (resolver, _, _) = resolver(dir.path());
        assert_eq!(resolver.resolve("garbage").unwrap_err().code(), "UNAUTHORIZED");
    }

    #[test]
    fn admin_token_checks_constant_time() {
        assert!(check_admin_token("secret-token", Some("secret-token")).is_ok());
        assert_eq!(
            check_admin_token("secret-token", Some("wrong-token!")).unwrap_err().code(),
            "UNAUTHORIZED"
        );
        // Unequal lengths rejected up front
        assert_eq!(
            check_admin_token("secret-token", Some("short")).unwrap_err().code(),
            "UNAUTHORIZED"
        );
        assert_eq!(
            check_admin_token("secret-token", None).unwrap_err().code(),
            "UNAUTHORIZED"
        );
    }
}

//! Scope grants and the authorization engine.
//!
//! A grant ties a skill to a `provider:action` scope (either side may be
//! `*`) with a per-minute rate limit. Authorization picks the most specific
//! matching active grant (fewest wildcards) and charges a sliding
//! 60-second window keyed by `(skillId, provider, scope)`.
//!
//! Grants are never hard-deleted; revocation deactivates them so history
//! stays inspectable.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::storage::atomic_write_json;
use crate::{Error, Result};

/// Rate-limit window length.
const WINDOW_MS: i64 = 60_000;
/// Default per-grant rate limit.
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 60;

/// A skill's authorization to use a scope against a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeGrant {
    /// Skill the grant belongs to.
    pub skill_id: String,
    /// Normalized lowercase provider.
    pub provider: String,
    /// Normalized `provider:action` scope; either part may be `*`.
    pub scope: String,
    /// Requests per minute allowed under this grant.
    pub rate_limit_per_minute: u32,
    /// Inactive grants are kept for history but never match.
    pub active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Successful authorization: the matched grant and the requests left in
/// the current window.
#[derive(Debug, Clone)]
pub struct Authorization {
    /// The grant that matched.
    pub grant: ScopeGrant,
    /// Remaining budget in the trailing 60 s window.
    pub remaining: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GrantFile {
    grants: Vec<ScopeGrant>,
}

/// Grant store + authorization engine.
pub struct ScopeEngine {
    path: PathBuf,
    grants: Mutex<Vec<ScopeGrant>>,
    /// `(skillId, provider, scope)` → request timestamps (epoch ms) within
    /// the trailing window.
    buckets: DashMap<(String, String, String), Vec<i64>>,
}

impl ScopeEngine {
    /// Load the engine from `scopes.json` (missing file = empty store).
    ///
    /// # Errors
    ///
    /// Fails when an existing file cannot be parsed.
    pub fn load(path: PathBuf) -> Result<Self> {
        let grants = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let file: GrantFile = serde_json::from_str(&raw)
                .map_err(|e| Error::Validation(format!("Malformed scopes file: {e}")))?;
            file.grants
        } else {
            Vec::new()
        };
        debug!(grants = grants.len(), "Scope engine loaded");
        Ok(Self {
            path,
            grants: Mutex::new(grants),
            buckets: DashMap::new(),
        })
    }

    /// Create or update a grant. Re-granting an existing
    /// `(skill, provider, scope)` reactivates it with the new rate limit.
    ///
    /// # Errors
    ///
    /// `VALIDATION_ERROR` on empty skill id, malformed scope, or a scope
    /// provider part that contradicts the grant provider.
    pub fn grant(
        &self,
        skill_id: &str,
        provider: &str,
        scope: &str,
        rate_limit_per_minute: Option<u32>,
    ) -> Result<ScopeGrant> {
        let skill_id = skill_id.trim();
        if skill_id.is_empty() {
            return Err(Error::Validation("Skill id must not be empty".into()));
        }
        let provider = provider.trim().to_lowercase();
        if provider.is_empty() {
            return Err(Error::Validation("Provider must not be empty".into()));
        }
        let scope = normalize_scope(scope)?;
        let (scope_provider, _) = split_scope(&scope)?;
        if scope_provider != "*" && scope_provider != provider {
            return Err(Error::Validation(format!(
                "Scope provider part {scope_provider} does not match grant provider {provider}"
            )));
        }

        let rate_limit = rate_limit_per_minute.unwrap_or(DEFAULT_RATE_LIMIT_PER_MINUTE);
        let now = Utc::now();

        let mut grants = self.grants.lock();
        let grant = if let Some(existing) = grants
            .iter_mut()
            .find(|g| g.skill_id == skill_id && g.provider == provider && g.scope == scope)
        {
            existing.rate_limit_per_minute = rate_limit;
            existing.active = true;
            existing.updated_at = now;
            existing.clone()
        } else {
            let grant = ScopeGrant {
                skill_id: skill_id.to_string(),
                provider,
                scope,
                rate_limit_per_minute: rate_limit,
                active: true,
                created_at: now,
                updated_at: now,
            };
            grants.push(grant.clone());
            grant
        };

        self.persist(&grants)?;
        info!(skill_id = %grant.skill_id, scope = %grant.scope, rpm = grant.rate_limit_per_minute, "Grant created");
        Ok(grant)
    }

    /// Deactivate grants matching `(skill, provider, scope?)`.
    /// With `scope = None` every active grant for the pair is revoked.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` when nothing matched.
    pub fn revoke(&self, skill_id: &str, provider: &str, scope: Option<&str>) -> Result<usize> {
        let provider = provider.trim().to_lowercase();
        let scope = match scope {
            Some(s) => Some(normalize_scope(s)?),
            None => None,
        };

        let mut grants = self.grants.lock();
        let now = Utc::now();
        let mut revoked = 0usize;
        for grant in grants.iter_mut() {
            if grant.active
                && grant.skill_id == skill_id
                && grant.provider == provider
                && scope.as_deref().is_none_or(|s| s == grant.scope)
            {
                grant.active = false;
                grant.updated_at = now;
                revoked += 1;
            }
        }
        if revoked == 0 {
            return Err(Error::NotFound(format!(
                "No active grant for {skill_id}/{provider} matched"
            )));
        }
        self.persist(&grants)?;
        info!(skill_id = %skill_id, provider = %provider, count = revoked, "Grants revoked");
        Ok(revoked)
    }

    /// Deactivate every grant (optionally only one skill's). Always
    /// succeeds and returns the number of grants deactivated.
    ///
    /// # Errors
    ///
    /// Only on persistence failure.
    pub fn emergency_revoke_all(&self, skill_id: Option<&str>) -> Result<usize> {
        let mut grants = self.grants.lock();
        let now = Utc::now();
        let mut revoked = 0usize;
        for grant in grants.iter_mut() {
            if grant.active && skill_id.is_none_or(|s| s == grant.skill_id) {
                grant.active = false;
                grant.updated_at = now;
                revoked += 1;
            }
        }
        self.persist(&grants)?;
        warn!(count = revoked, "Emergency revoke executed");
        Ok(revoked)
    }

    /// All grants, optionally filtered by skill. Inactive grants included.
    #[must_use]
    pub fn list_grants(&self, skill_id: Option<&str>) -> Vec<ScopeGrant> {
        self.grants
            .lock()
            .iter()
            .filter(|g| skill_id.is_none_or(|s| s == g.skill_id))
            .cloned()
            .collect()
    }

    /// Authorize a request for `(skill, provider, scope)` at `now`.
    ///
    /// Picks the most specific matching active grant, then charges its
    /// rate-limit window.
    ///
    /// # Errors
    ///
    /// `VALIDATION_ERROR` on malformed input; `ACCESS_DENIED` when no
    /// active grant matches or the window is exhausted.
    pub fn authorize(
        &self,
        skill_id: &str,
        provider: &str,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<Authorization> {
        let skill_id = skill_id.trim();
        if skill_id.is_empty() {
            return Err(Error::Validation("Skill id must not be empty".into()));
        }
        let provider = provider.trim().to_lowercase();
        let scope = normalize_scope(scope)?;
        let (_, action) = split_scope(&scope)?;

        let grant = {
            let grants = self.grants.lock();
            grants
                .iter()
                .filter(|g| g.active && g.skill_id == skill_id && g.provider == provider)
                .filter(|g| {
                    let Ok((grant_provider, grant_action)) = split_scope(&g.scope) else {
                        return false;
                    };
                    (grant_provider == "*" || grant_provider == provider)
                        && (grant_action == "*" || grant_action == action)
                })
                // Fewest wildcards wins; ties resolve to the first stored.
                .min_by_key(|g| g.scope.matches('*').count())
                .cloned()
        };

        let Some(grant) = grant else {
            return Err(Error::AccessDenied(format!(
                "No active grant for skill {skill_id} covering {provider} scope {scope}"
            )));
        };

        let key = (
            grant.skill_id.clone(),
            grant.provider.clone(),
            grant.scope.clone(),
        );
        let now_ms = now.timestamp_millis();
        let mut bucket = self.buckets.entry(key).or_default();
        bucket.retain(|&t| t > now_ms - WINDOW_MS);
        if bucket.len() as u32 >= grant.rate_limit_per_minute {
            return Err(Error::AccessDenied(format!(
                "Rate limit exceeded for {} ({} per minute)",
                grant.scope, grant.rate_limit_per_minute
            )));
        }
        bucket.push(now_ms);
        let remaining = grant.rate_limit_per_minute - bucket.len() as u32;
        drop(bucket);

        Ok(Authorization { grant, remaining })
    }

    fn persist(&self, grants: &[ScopeGrant]) -> Result<()> {
        let file = GrantFile {
            grants: grants.to_vec(),
        };
        atomic_write_json(&self.path, &file)
    }
}

/// Trim, lowercase, and shape-check a `provider:action` scope.
fn normalize_scope(scope: &str) -> Result<String> {
    let scope = scope.trim().to_lowercase();
    split_scope(&scope)?;
    Ok(scope)
}

fn split_scope(scope: &str) -> Result<(&str, &str)> {
    scope
        .split_once(':')
        .filter(|(p, a)| !p.is_empty() && !a.is_empty() && !a.contains(':'))
        .ok_or_else(|| Error::Validation(format!("Scope must be provider:action, got {scope}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn engine(dir: &std::path::Path) -> ScopeEngine {
        ScopeEngine::load(dir.join("scopes.json")).unwrap()
    }

    #[test]
    fn grant_requires_well_formed_scope() {
        let dir = tempfile::tempdir().unwrap();
        let scopes = engine(dir.path());

        assert_eq!(
            scopes.grant("skill.alpha", "github", "github", None).unwrap_err().code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(
            scopes.grant("", "github", "github:read", None).unwrap_err().code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(
            scopes
                .grant("skill.alpha", "github", "twitter:read", None)
                .unwrap_err()
                .code(),
            "VALIDATION_ERROR"
        );
    }

    #[test]
    fn authorize_matches_exact_scope() {
        let dir = tempfile::tempdir().unwrap();
        let scopes = engine(dir.path());
        scopes.grant("skill.alpha", "github", "github:read", None).unwrap();

        let auth = scopes
            .authorize("skill.alpha", "github", "github:read", Utc::now())
            .unwrap();
        assert_eq!(auth.grant.scope, "github:read");
    }

    #[test]
    fn authorize_matches_wildcards() {
        let dir = tempfile::tempdir().unwrap();
        let scopes = engine(dir.path());
        scopes.grant("skill.alpha", "github", "github:*", None).unwrap();

        assert!(scopes
            .authorize("skill.alpha", "github", "github:read", Utc::now())
            .is_ok());
        assert!(scopes
            .authorize("skill.alpha", "github", "github:write", Utc::now())
            .is_ok());
    }

    #[test]
    fn more_specific_grant_wins() {
        let dir = tempfile::tempdir().unwrap();
        let scopes = engine(dir.path());
        scopes.grant("skill.alpha", "github", "*:*", Some(100)).unwrap();
        scopes.grant("skill.alpha", "github", "github:read", Some(5)).unwrap();

        let auth = scopes
            .authorize("skill.alpha", "github", "github:read", Utc::now())
            .unwrap();
        assert_eq!(auth.grant.scope, "github:read");
        assert_eq!(auth.grant.rate_limit_per_minute, 5);
    }

    #[test]
    fn no_grant_is_access_denied() {
        let dir = tempfile::tempdir().unwrap();
        let scopes = engine(dir.path());
        scopes.grant("skill.alpha", "github", "github:read", None).unwrap();

        // Different skill
        assert_eq!(
            scopes
                .authorize("skill.beta", "github", "github:read", Utc::now())
                .unwrap_err()
                .code(),
            "ACCESS_DENIED"
        );
        // Different provider
        assert_eq!(
            scopes
                .authorize("skill.alpha", "openai", "openai:read", Utc::now())
                .unwrap_err()
                .code(),
            "ACCESS_DENIED"
        );
        // Different action
        assert_eq!(
            scopes
                .authorize("skill.alpha", "github", "github:write", Utc::now())
                .unwrap_err()
                .code(),
            "ACCESS_DENIED"
        );
    }

    #[test]
    fn rate_limit_charges_a_sliding_window() {
        let dir = tempfile::tempdir().unwrap();
        let scopes = engine(dir.path());
        scopes.grant("skill.alpha", "twitter", "twitter:*", Some(2)).unwrap();

        let t0 = Utc::now();
        let first = scopes
            .authorize("skill.alpha", "twitter", "twitter:post", t0)
            .unwrap();
        assert_eq!(first.remaining, 1);
        let second = scopes
            .authorize("skill.alpha", "twitter", "twitter:post", t0 + TimeDelta::seconds(1))
            .unwrap();
        assert_eq!(second.remaining, 0);
        let err = scopes
            .authorize("skill.alpha", "twitter", "twitter:post", t0 + TimeDelta::seconds(2))
            .unwrap_err();
        assert_eq!(err.code(), "ACCESS_DENIED");

        // Outside the 60 s window the budget refills
        let later = scopes
            .authorize("skill.alpha", "twitter", "twitter:post", t0 + TimeDelta::seconds(62))
            .unwrap();
        assert_eq!(later.remaining, 1);
    }

    #[test]
    fn revoked_grants_stop_matching_but_remain_listed() {
        let dir = tempfile::tempdir().unwrap();
        let scopes = engine(dir.path());
        scopes.grant("skill.alpha", "github", "github:read", None).unwrap();

        let revoked = scopes.revoke("skill.alpha", "github", Some("github:read")).unwrap();
        assert_eq!(revoked, 1);
        assert_eq!(
            scopes
                .authorize("skill.alpha", "github", "github:read", Utc::now())
                .unwrap_err()
                .code(),
            "ACCESS_DENIED"
        );
        let listed = scopes.list_grants(Some("skill.alpha"));
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].active);
    }

    #[test]
    fn revoke_matching_zero_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let scopes = engine(dir.path());
        assert_eq!(
            scopes.revoke("skill.alpha", "github", None).unwrap_err().code(),
            "NOT_FOUND"
        );
    }

    #[test]
    fn emergency_revoke_always_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let scopes = engine(dir.path());
        assert_eq!(scopes.emergency_revoke_all(None).unwrap(), 0);

        scopes.grant("skill.alpha", "github", "github:read", None).unwrap();
        scopes.grant("skill.beta", "openai", "openai:*", None).unwrap();
        assert_eq!(scopes.emergency_revoke_all(None).unwrap(), 2);
        assert!(scopes.list_grants(None).iter().all(|g| !g.active));
    }

    #[test]
    fn regrant_reactivates_with_new_limit() {
        let dir = tempfile::tempdir().unwrap();
        let scopes = engine(dir.path());
        scopes.grant("skill.alpha", "github", "github:read", Some(10)).unwrap();
        scopes.revoke("skill.alpha", "github", None).unwrap();
        scopes.grant("skill.alpha", "github", "github:read", Some(99)).unwrap();

        let listed = scopes.list_grants(Some("skill.alpha"));
        assert_eq!(listed.len(), 1);
        assert!(listed[0].active);
        assert_eq!(listed[0].rate_limit_per_minute, 99);
    }

    #[test]
    fn grants_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let scopes = engine(dir.path());
            scopes.grant("skill.alpha", "github", "github:read", Some(7)).unwrap();
        }
        let scopes = engine(dir.path());
        let listed = scopes.list_grants(None);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].rate_limit_per_minute, 7);
    }

    #[test]
    fn zero_rate_limit_denies_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let scopes = engine(dir.path());
        scopes.grant("skill.alpha", "github", "github:read", Some(0)).unwrap();
        assert_eq!(
            scopes
                .authorize("skill.alpha", "github", "github:read", Utc::now())
                .unwrap_err()
                .code(),
            "ACCESS_DENIED"
        );
    }
}

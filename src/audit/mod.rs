//! Tamper-evident audit log.
//!
//! Append-only NDJSON stream where every entry embeds the previous entry's
//! SHA-256 hash; the first entry chains from the literal string `GENESIS`.
//! Appends are serialized across writers (including other processes) by an
//! exclusive sibling lock file, so the chain stays a total order.
//!
//! Hashing contract: `hash = SHA-256(serialization of the entry minus the
//! hash field)`, where the serialization is the in-order compact JSON that
//! is written to disk. A verifier re-serializes each stored line minus
//! `hash` and recomputes.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Chain seed for the first entry's `prevHash`.
pub const GENESIS: &str = "GENESIS";

const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);
const LOCK_RETRY_ATTEMPTS: usize = 250; // ~5 s deadline

/// The closed set of audit event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    /// A credential was stored.
    CredentialStore,
    /// A credential was deleted.
    CredentialDelete,
    /// A brokered request was executed upstream.
    ProxyAllow,
    /// A brokered request was denied before execution.
    ProxyDeny,
    /// A brokered request failed in transit.
    ProxyError,
    /// A scope grant was created or updated.
    GrantCreate,
    /// A scope grant was revoked.
    GrantRevoke,
    /// All grants were revoked at once.
    GrantEmergencyRevoke,
    /// A skill token was issued or rotated.
    SkillTokenIssue,
    /// A skill token was revoked.
    SkillTokenRevoke,
    /// A session token was issued.
    SessionTokenIssue,
    /// A session token was revoked.
    SessionTokenRevoke,
    /// The behavioral firewall raised an alert.
    FirewallAlert,
    /// The daemon started.
    DaemonStart,
    /// An identity challenge was created.
    IdentityChallenge,
    /// An identity challenge verify attempt ran.
    IdentityVerify,
    /// An identity proof was revoked.
    IdentityRevoke,
    /// A security advisory was processed.
    AdvisoryProcessed,
}

impl AuditEvent {
    /// The canonical dotted event name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CredentialStore => "credential.store",
            Self::CredentialDelete => "credential.delete",
            Self::ProxyAllow => "proxy.allow",
            Self::ProxyDeny => "proxy.deny",
            Self::ProxyError => "proxy.error",
            Self::GrantCreate => "grant.create",
            Self::GrantRevoke => "grant.revoke",
            Self::GrantEmergencyRevoke => "grant.emergency_revoke",
            Self::SkillTokenIssue => "skill_token.issue",
            Self::SkillTokenRevoke => "skill_token.revoke",
            Self::SessionTokenIssue => "session_token.issue",
            Self::SessionTokenRevoke => "session_token.revoke",
            Self::FirewallAlert => "firewall.alert",
            Self::DaemonStart => "daemon.start",
            Self::IdentityChallenge => "identity.challenge",
            Self::IdentityVerify => "identity.verify",
            Self::IdentityRevoke => "identity.revoke",
            Self::AdvisoryProcessed => "advisory.processed",
        }
    }
}

/// Optional context attached to an entry. Absent fields are omitted from
/// the serialized line entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditContext {
    /// Acting skill.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill_id: Option<String>,
    /// Provider involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Scope involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Target endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// HTTP method.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Canonical outcome string (e.g. `ok`, `scope_denied`, `blocked`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// Upstream status code for proxy events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Free-form detail string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// One immutable line of the audit stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// Canonical event name.
    pub event: String,
    /// Context fields, flattened into the entry.
    #[serde(flatten)]
    pub context: AuditContext,
    /// Hash of the previous entry (`GENESIS` for the first).
    pub prev_hash: String,
    /// SHA-256 over the entry minus this field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Result of a full-chain verification scan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    /// Whether the whole chain checks out.
    pub valid: bool,
    /// 1-based line number of the first broken entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at_line: Option<usize>,
    /// `invalid_json`, `prevHash mismatch`, or `hash mismatch`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl IntegrityReport {
    fn valid() -> Self {
        Self {
            valid: true,
            broken_at_line: None,
            reason: None,
        }
    }

    fn broken(line: usize, reason: &str) -> Self {
        Self {
            valid: false,
            broken_at_line: Some(line),
            reason: Some(reason.to_string()),
        }
    }
}

/// Hash-chained append-only audit log.
pub struct AuditLog {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Exclusive advisory lock held for the append critical section.
/// Creating the sibling file with `create_new` is the mutual exclusion;
/// dropping the guard removes it.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn try_acquire(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let _ = write!(file, "{}", std::process::id());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release audit lock");
        }
    }
}

impl AuditLog {
    /// Create a log handle over `path`; the lock file is a sibling.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        let lock_path = path.with_extension("ndjson.lock");
        Self { path, lock_path }
    }

    /// Append one entry, chaining it to the current tail.
    ///
    /// Lock acquisition retries every ~20 ms for up to ~5 s, after which
    /// the append fails. The entry is flushed before the lock is released,
    /// so no append is visible half-written.
    ///
    /// # Errors
    ///
    /// Fails when the lock cannot be acquired in time or the log tail is
    /// unreadable.
    pub async fn append(&self, event: AuditEvent, context: AuditContext) -> Result<AuditEntry> {
        let lock_path = self.lock_path.clone();
        let guard = (move || {
            let path = lock_path.clone();
            async move { LockGuard::try_acquire(&path) }
        })
        .retry(
            ConstantBuilder::default()
                .with_delay(LOCK_RETRY_DELAY)
                .with_max_times(LOCK_RETRY_ATTEMPTS),
        )
        .when(|e| e.kind() == std::io::ErrorKind::AlreadyExists)
        .await
        .map_err(|e| Error::Internal(format!("Failed to acquire audit lock: {e}")))?;

        let result = self.append_locked(event, context);
        drop(guard);
        result
    }

    /// The critical section: read tail, chain, hash, write one line.
    fn append_locked(&self, event: AuditEvent, context: AuditContext) -> Result<AuditEntry> {
        let prev_hash = self.tail_hash()?;

        let mut entry = AuditEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            event: event.as_str().to_string(),
            context,
            prev_hash,
            hash: None,
        };

        let unhashed = serde_json::to_string(&entry)
            .map_err(|e| Error::Internal(format!("Failed to serialize audit entry: {e}")))?;
        entry.hash = Some(hex_sha256(unhashed.as_bytes()));

        let line = serde_json::to_string(&entry)
            .map_err(|e| Error::Internal(format!("Failed to serialize audit entry: {e}")))?;

        let created = !self.path.exists();
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)?;
        if created {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600));
            }
        }
        writeln!(file, "{line}")?;
        file.flush()?;

        debug!(event = entry.event, "Audit entry appended");
        Ok(entry)
    }

    /// Hash of the last entry on disk, or `GENESIS` for an empty log.
    fn tail_hash(&self) -> Result<String> {
        if !self.path.exists() {
            return Ok(GENESIS.to_string());
        }
        let contents = fs::read_to_string(&self.path)?;
        let Some(last) = contents.lines().filter(|l| !l.trim().is_empty()).next_back() else {
            return Ok(GENESIS.to_string());
        };
        let value: serde_json::Value = serde_json::from_str(last)
            .map_err(|e| Error::Internal(format!("Audit log tail is unreadable: {e}")))?;
        value
            .get("hash")
            .and_then(|h| h.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| Error::Internal("Audit log tail has no hash".into()))
    }

    /// Scan the whole log, recomputing every hash and chain link.
    ///
    /// # Errors
    ///
    /// Fails only on I/O problems; chain damage is reported in the result.
    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        if !self.path.exists() {
            return Ok(IntegrityReport::valid());
        }
        let contents = fs::read_to_string(&self.path)?;

        let mut expected_prev = GENESIS.to_string();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let number = index + 1;

            let Ok(mut value) = serde_json::from_str::<serde_json::Value>(line) else {
                return Ok(IntegrityReport::broken(number, "invalid_json"));
            };
            let Some(object) = value.as_object_mut() else {
                return Ok(IntegrityReport::broken(number, "invalid_json"));
            };

            let Some(stored_hash) = object.remove("hash").and_then(|h| match h {
                serde_json::Value::String(s) => Some(s),
                _ => None,
            }) else {
                return Ok(IntegrityReport::broken(number, "hash mismatch"));
            };

            let prev = object.get("prevHash").and_then(|p| p.as_str()).unwrap_or("");
            if prev != expected_prev {
                return Ok(IntegrityReport::broken(number, "prevHash mismatch"));
            }

            let reserialized = serde_json::to_string(&value)
                .map_err(|e| Error::Internal(format!("Failed to re-serialize entry: {e}")))?;
            if hex_sha256(reserialized.as_bytes()) != stored_hash {
                return Ok(IntegrityReport::broken(number, "hash mismatch"));
            }

            expected_prev = stored_hash;
        }

        Ok(IntegrityReport::valid())
    }

    /// Number of entries currently on disk.
    ///
    /// # Errors
    ///
    /// Fails on I/O problems.
    pub fn entry_count(&self) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let contents = fs::read_to_string(&self.path)?;
        Ok(contents.lines().filter(|l| !l.trim().is_empty()).count())
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_in(dir: &std::path::Path) -> AuditLog {
        AuditLog::new(dir.join("audit.ndjson"))
    }

    fn ctx(skill: &str) -> AuditContext {
        AuditContext {
            skill_id: Some(skill.to_string()),
            ..AuditContext::default()
        }
    }

    #[tokio::test]
    async fn first_entry_chains_from_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());

        let entry = log.append(AuditEvent::DaemonStart, AuditContext::default()).await.unwrap();
        assert_eq!(entry.prev_hash, GENESIS);
        assert!(entry.hash.is_some());
    }

    #[tokio::test]
    async fn entries_chain_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());

        let first = log.append(AuditEvent::DaemonStart, AuditContext::default()).await.unwrap();
        let second = log.append(AuditEvent::ProxyAllow, ctx("skill.alpha")).await.unwrap();
        assert_eq!(Some(second.prev_hash), first.hash);
    }

    #[tokio::test]
    async fn verify_accepts_untouched_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        for _ in 0..5 {
            log.append(AuditEvent::ProxyAllow, ctx("skill.alpha")).await.unwrap();
        }

        let report = log.verify_integrity().unwrap();
        assert!(report.valid);
        assert_eq!(log.entry_count().unwrap(), 5);
    }

    #[tokio::test]
    async fn verify_accepts_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        assert!(log.verify_integrity().unwrap().valid);
    }

    #[tokio::test]
    async fn tampered_line_is_pinpointed() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        for _ in 0..4 {
            log.append(AuditEvent::ProxyAllow, ctx("skill.alpha")).await.unwrap();
        }

        let path = dir.path().join("audit.ndjson");
        let contents = fs::read_to_string(&path).unwrap();
        let mut lines: Vec<String> = contents.lines().map(ToString::to_string).collect();
        // Flip a byte in line 3's skillId
        lines[2] = lines[2].replace("skill.alpha", "skill.alphb");
        fs::write(&path, lines.join("\n") + "\n").unwrap();

        let report = log.verify_integrity().unwrap();
        assert!(!report.valid);
        assert_eq!(report.broken_at_line, Some(3));
        assert_eq!(report.reason.as_deref(), Some("hash mismatch"));
    }

    #[tokio::test]
    async fn removed_line_breaks_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        for _ in 0..3 {
            log.append(AuditEvent::ProxyAllow, ctx("skill.alpha")).await.unwrap();
        }

        let path = dir.path().join("audit.ndjson");
        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        fs::write(&path, format!("{}\n{}\n", lines[0], lines[2])).unwrap();

        let report = log.verify_integrity().unwrap();
        assert!(!report.valid);
        assert_eq!(report.broken_at_line, Some(2));
        assert_eq!(report.reason.as_deref(), Some("prevHash mismatch"));
    }

    #[tokio::test]
    async fn garbage_line_is_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        log.append(AuditEvent::DaemonStart, AuditContext::default()).await.unwrap();

        let path = dir.path().join("audit.ndjson");
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("not json at all\n");
        fs::write(&path, contents).unwrap();

        let report = log.verify_integrity().unwrap();
        assert!(!report.valid);
        assert_eq!(report.broken_at_line, Some(2));
        assert_eq!(report.reason.as_deref(), Some("invalid_json"));
    }

    #[tokio::test]
    async fn concurrent_writers_keep_the_chain_intact() {
        let dir = tempfile::tempdir().unwrap();
        let log = std::sync::Arc::new(log_in(dir.path()));

        let mut handles = Vec::new();
        for writer in 0..4 {
            let log = std::sync::Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    log.append(AuditEvent::ProxyAllow, ctx(&format!("skill.{writer}")))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(log.entry_count().unwrap(), 40);
        assert!(log.verify_integrity().unwrap().valid);
    }

    #[tokio::test]
    async fn stuck_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        // Simulate a writer that died without releasing
        fs::write(dir.path().join("audit.ndjson.lock"), "held").unwrap();

        let started = std::time::Instant::now();
        let err = log
            .append(AuditEvent::DaemonStart, AuditContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(started.elapsed() >= Duration::from_secs(4));
    }
}

//! State-directory handling and atomic file writes.
//!
//! Every persisted file lives under a per-deployment state directory
//! (created 0700). Writers never modify a file in place: they write a
//! sibling temp file with mode 0600 and rename it over the target, so a
//! crash mid-write leaves the previous contents intact.

use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Per-deployment state directory and the canonical file names inside it.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Open (creating if necessary) the state directory at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            fs::create_dir_all(&root)
                .map_err(|e| Error::Internal(format!("Failed to create state dir: {e}")))?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&root, fs::Permissions::from_mode(0o700));
        }
        Ok(Self { root })
    }

    /// The state directory root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a file inside the state directory.
    #[must_use]
    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// `vault.enc`
    #[must_use]
    pub fn vault(&self) -> PathBuf {
        self.file("vault.enc")
    }

    /// `scopes.json`
    #[must_use]
    pub fn scopes(&self) -> PathBuf {
        self.file("scopes.json")
    }

    /// `audit.ndjson`
    #[must_use]
    pub fn audit(&self) -> PathBuf {
        self.file("audit.ndjson")
    }

    /// `firewall.json`
    #[must_use]
    pub fn firewall(&self) -> PathBuf {
        self.file("firewall.json")
    }

    /// `skill-auth.json`
    #[must_use]
    pub fn skill_auth(&self) -> PathBuf {
        self.file("skill-auth.json")
    }

    /// `session-revocations.json`
    #[must_use]
    pub fn session_revocations(&self) -> PathBuf {
        self.file("session-revocations.json")
    }

    /// `oauth-tokens.json`
    #[must_use]
    pub fn oauth_tokens(&self) -> PathBuf {
        self.file("oauth-tokens.json")
    }

    /// `identity-state.json`
    #[must_use]
    pub fn identity_state(&self) -> PathBuf {
        self.file("identity-state.json")
    }

    /// `advisory-state.json`
    #[must_use]
    pub fn advisory_state(&self) -> PathBuf {
        self.file("advisory-state.json")
    }
}

/// Write `contents` to `path` atomically: temp file in the same directory,
/// mode 0600, then rename over the target.
///
/// # Errors
///
/// Returns an error if the temp file cannot be written or renamed.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    // Unique per write: two tasks persisting the same file concurrently
    // must not share a temp file.
    static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let dir = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("No parent directory for {}", path.display())))?;
    let tmp = dir.join(format!(
        ".{}.tmp-{}-{seq}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id()
    ));

    fs::write(&tmp, contents)
        .map_err(|e| Error::Internal(format!("Failed to write {}: {e}", tmp.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600));
    }

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::Internal(format!("Failed to rename into {}: {e}", path.display()))
    })?;

    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
///
/// # Errors
///
/// Returns an error on serialization or write failure.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::Internal(format!("Failed to serialize {}: {e}", path.display())))?;
    atomic_write(path, &contents)
}

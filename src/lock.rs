//! On-disk lock serializing indexing passes across processes.
//!
//! The lock file holds JSON `{ "pid": u32, "acquired_at": unix_secs }`. It is
//! published atomically: the content is written to a private temp file which
//! is then hard-linked into place, so no reader ever sees a half-written
//! lock. A lock is stale when its owner process no longer exists or when it
//! is older than the configured maximum age; stale locks are reclaimed.
//!
//! The lock is released when the [`IndexLock`] guard drops.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: i64,
}

impl LockInfo {
    // Our own pid gets no exemption: a file found at acquire time was left
    // by an earlier run that had the same pid.
    fn is_stale(&self, max_age: Duration, now: i64) -> bool {
        let age = now.saturating_sub(self.acquired_at);
        !process_alive(self.pid) || age < 0 || age as u64 > max_age.as_secs()
    }
}

/// Held lock; removes the lock file on drop.
#[derive(Debug)]
pub struct IndexLock {
    path: PathBuf,
    info: LockInfo,
}

impl IndexLock {
    /// Try to take the lock at `path`.
    ///
    /// Returns `Ok(None)` when a live owner holds it.
    pub fn acquire(path: &Path, max_age: Duration) -> Result<Option<IndexLock>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create lock directory: {}", parent.display())
                })?;
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: chrono::Utc::now().timestamp(),
        };

        if publish(path, &info)? {
            return Ok(Some(IndexLock {
                path: path.to_path_buf(),
                info,
            }));
        }

        let now = chrono::Utc::now().timestamp();
        match read_lock(path)? {
            Some(existing) if !existing.is_stale(max_age, now) => {
                tracing::debug!(pid = existing.pid, "index lock held by another process");
                return Ok(None);
            }
            Some(existing) => {
                tracing::warn!(
                    pid = existing.pid,
                    acquired_at = existing.acquired_at,
                    "reclaiming stale index lock"
                );
                // Only remove the lock we judged stale, not a fresh one
                // another reclaimer may have published meanwhile.
                if read_lock(path)?.as_ref() == Some(&existing) {
                    remove_if_present(path)?;
                }
            }
            None => {
                tracing::warn!(path = %path.display(), "removing unreadable index lock");
                remove_if_present(path)?;
            }
        }

        if publish(path, &info)? {
            Ok(Some(IndexLock {
                path: path.to_path_buf(),
                info,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        match read_lock(&self.path) {
            Ok(Some(current)) if current == self.info => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to release index lock");
                }
            }
            _ => {}
        }
    }
}

/// Current lock holder, if the file exists and parses.
pub fn read_lock(path: &Path) -> Result<Option<LockInfo>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read lock {}", path.display()))
        }
    };
    Ok(serde_json::from_str(&raw).ok())
}

/// Atomically create `path` with `info`. Returns false if it already exists.
fn publish(path: &Path, info: &LockInfo) -> Result<bool> {
    let tmp = path.with_extension(format!("{}.tmp", info.pid));
    std::fs::write(&tmp, serde_json::to_vec(info)?)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;

    let linked = std::fs::hard_link(&tmp, path);
    let _ = std::fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to create lock {}", path.display())),
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove lock {}", path.display())),
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// Without a cheap liveness probe, only the age limit reclaims locks.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

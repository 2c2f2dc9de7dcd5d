//! Singleton run lock.
//!
//! A JSON lock file keeps two agent processes off the same queue. A
//! lock whose start time is older than the staleness window is
//! presumed left behind by a dead process and taken over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RunLockError {
    #[error("IO error on lock file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    started_at: DateTime<Utc>,
}

/// Held for the lifetime of the process; removed on drop.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Try to take the lock. Returns `None` when another process holds
    /// a fresh lock. A stale or unreadable lock file is overwritten.
    pub fn acquire(path: &Path, staleness: Duration) -> Result<Option<RunLock>, RunLockError> {
        if let Some(existing) = read_lock(path) {
            let age = Utc::now().signed_duration_since(existing.started_at);
            let stale = age
                .to_std()
                .map(|age| age > staleness)
                .unwrap_or(true);
            if !stale {
                info!(
                    path = %path.display(),
                    holder_pid = existing.pid,
                    "run lock held by another process"
                );
                return Ok(None);
            }
            warn!(
                path = %path.display(),
                holder_pid = existing.pid,
                "taking over stale run lock"
            );
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| RunLockError::Io {
                path: path.display().to_string(),
                source,
            })?;
        }
        let info = LockInfo {
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        let body = serde_json::to_string_pretty(&info)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            .map_err(|source| RunLockError::Io {
                path: path.display().to_string(),
                source,
            })?;
        fs::write(path, body).map_err(|source| RunLockError::Io {
            path: path.display().to_string(),
            source,
        })?;

        Ok(Some(RunLock {
            path: path.to_path_buf(),
        }))
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove run lock");
        }
    }
}

/// A lock file that cannot be read or parsed counts as absent.
fn read_lock(path: &Path) -> Option<LockInfo> {
    let text = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(info) => Some(info),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt run lock file");
            None
        }
    }
}

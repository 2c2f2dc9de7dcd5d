//! Filesystem backup store.
//!
//! One snapshot is taken immediately before every mutating deploy.
//! Snapshots are append-only and never deleted automatically: each is
//! a payload file plus a JSON metadata sidecar under a per-content
//! directory, and every snapshot also refreshes a `latest.html`
//! pointer for quick manual restore.

use chrono::Utc;
use retouch_core::content::BackupMeta;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup not found: {0}")]
    NotFound(String),

    #[error("corrupt backup metadata at {path}: {source}")]
    CorruptMeta {
        path: String,
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BackupResult<T> = std::result::Result<T, BackupError>;

/// A snapshot on disk: metadata plus the path of the payload file.
#[derive(Debug, Clone)]
pub struct Backup {
    pub meta: BackupMeta,
    pub payload_path: PathBuf,
}

/// Store rooted at a single directory, one subdirectory per content
/// item.
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn content_dir(&self, content_id: uuid::Uuid) -> PathBuf {
        self.root.join(content_id.simple().to_string())
    }

    /// Snapshot `payload` for `content_id`. Returns the created backup.
    pub async fn snapshot(
        &self,
        content_id: uuid::Uuid,
        payload: &str,
        description: &str,
    ) -> BackupResult<Backup> {
        let dir = self.content_dir(content_id);
        tokio::fs::create_dir_all(&dir).await?;

        let backed_up_at = Utc::now();
        // Nanosecond stamp keeps names unique even for back-to-back
        // snapshots of the same item.
        let stem = backed_up_at.format("%Y-%m-%d_%H-%M-%S%.9f").to_string();
        let payload_file = format!("{stem}.html");
        let payload_path = dir.join(&payload_file);

        let meta = BackupMeta {
            content_id,
            backed_up_at,
            description: description.to_string(),
            payload_size: payload.len(),
            payload_file: format!("{}/{payload_file}", content_id.simple()),
        };

        tokio::fs::write(&payload_path, payload).await?;
        let meta_json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(dir.join(format!("{stem}.json")), meta_json).await?;
        tokio::fs::write(dir.join("latest.html"), payload).await?;

        info!(
            content_id = %content_id,
            file = %meta.payload_file,
            size = payload.len(),
            "backup created"
        );

        Ok(Backup { meta, payload_path })
    }

    /// All backups for one content item, newest first.
    pub async fn list(&self, content_id: uuid::Uuid) -> BackupResult<Vec<Backup>> {
        let dir = self.content_dir(content_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                backups.push(self.read_backup(&path).await?);
            }
        }

        backups.sort_by(|a, b| b.meta.backed_up_at.cmp(&a.meta.backed_up_at));
        Ok(backups)
    }

    /// The most recent backup for one content item, if any.
    pub async fn latest(&self, content_id: uuid::Uuid) -> BackupResult<Option<Backup>> {
        Ok(self.list(content_id).await?.into_iter().next())
    }

    /// Read the payload snapshot of a backup.
    pub async fn load_payload(&self, backup: &Backup) -> BackupResult<String> {
        match tokio::fs::read_to_string(&backup.payload_path).await {
            Ok(payload) => Ok(payload),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BackupError::NotFound(
                backup.payload_path.display().to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_backup(&self, meta_path: &Path) -> BackupResult<Backup> {
        let text = tokio::fs::read_to_string(meta_path).await?;
        let meta: BackupMeta =
            serde_json::from_str(&text).map_err(|source| BackupError::CorruptMeta {
                path: meta_path.display().to_string(),
                source,
            })?;
        let payload_path = self.root.join(&meta.payload_file);
        Ok(Backup { meta, payload_path })
    }
}

//! Content and revision models.
//!
//! A content item owns a published payload and an append-only revision
//! chain. When `current_revision_id` is set, the payload under active
//! review is the latest completed revision rather than
//! `current_payload` itself, and new edits must stack on top of it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A content item: an addressable blob of markup owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Content {
    pub id: uuid::Uuid,
    pub current_payload: String,
    /// Points at the latest accepted revision, when the item has a
    /// revision chain.
    pub current_revision_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of a revision in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevisionStatus {
    PendingReview,
    Completed,
}

impl RevisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevisionStatus::PendingReview => "pending-review",
            RevisionStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for RevisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RevisionStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending-review" => Ok(RevisionStatus::PendingReview),
            "completed" => Ok(RevisionStatus::Completed),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown revision status: {other}"
            ))),
        }
    }
}

/// One entry in a content item's revision chain.
///
/// `revision_id` values are monotonically increasing per content item;
/// "latest accepted" is the highest revision_id with status completed.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Revision {
    pub content_id: uuid::Uuid,
    pub revision_id: i64,
    pub payload: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Revision {
    pub fn status(&self) -> crate::Result<RevisionStatus> {
        self.status.parse()
    }
}

/// Metadata for one filesystem backup snapshot.
///
/// Backups are append-only and never deleted automatically; one is
/// created immediately before every successful deploy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMeta {
    pub content_id: uuid::Uuid,
    pub backed_up_at: DateTime<Utc>,
    pub description: String,
    pub payload_size: usize,
    /// Path of the payload snapshot, relative to the backup root.
    pub payload_file: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_status_round_trip() {
        for status in [RevisionStatus::PendingReview, RevisionStatus::Completed] {
            assert_eq!(status.as_str().parse::<RevisionStatus>().unwrap(), status);
        }
    }
}

//! Edit request model.
//!
//! An edit request is a row in the `edit_requests` table: a free-text
//! instruction against one content item. Rows are created by producers
//! and mutated only by the worker that currently holds the claim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an edit request.
///
/// `Completed` and `Failed` are terminal. At most one worker holds a
/// request in `Processing` at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditStatus::Pending => "pending",
            EditStatus::Processing => "processing",
            EditStatus::Completed => "completed",
            EditStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EditStatus::Completed | EditStatus::Failed)
    }
}

impl std::fmt::Display for EditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EditStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EditStatus::Pending),
            "processing" => Ok(EditStatus::Processing),
            "completed" => Ok(EditStatus::Completed),
            "failed" => Ok(EditStatus::Failed),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown edit status: {other}"
            ))),
        }
    }
}

/// A queued edit request.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EditRequest {
    pub id: uuid::Uuid,
    pub content_id: uuid::Uuid,
    /// Free-text instruction, interpreted by the transformation tool.
    pub instruction: String,
    pub status: String,
    /// Worker instance that claimed this row, for crash recovery.
    pub claimed_by: Option<String>,
    /// Who to notify when the request reaches a terminal state.
    pub requester: Option<String>,
    pub error_message: Option<String>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EditRequest {
    pub fn status(&self) -> crate::Result<EditStatus> {
        self.status.parse()
    }
}

/// Fields for enqueuing a new edit request.
#[derive(Debug, Clone)]
pub struct NewEditRequest {
    pub content_id: uuid::Uuid,
    pub instruction: String,
    pub requester: Option<String>,
}

/// An edit request joined with the payload the pipeline should edit.
///
/// The base payload is resolved once at claim time (see revision
/// stacking in [`crate::content`]) and cached here for the duration of
/// the job.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub request: EditRequest,
    /// Payload the Process stage edits: the latest completed revision's
    /// payload when one exists, the original payload otherwise.
    pub base_payload: String,
    /// Revision the base payload came from, if any.
    pub base_revision_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            EditStatus::Pending,
            EditStatus::Processing,
            EditStatus::Completed,
            EditStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<EditStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(EditStatus::Completed.is_terminal());
        assert!(EditStatus::Failed.is_terminal());
        assert!(!EditStatus::Pending.is_terminal());
        assert!(!EditStatus::Processing.is_terminal());
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!("cancelled".parse::<EditStatus>().is_err());
    }
}

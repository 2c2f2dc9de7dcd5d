//! Pipeline failure taxonomy.

use retouch_core::transform::TransformError;
use retouch_db::DbError;
use thiserror::Error;

/// How a pipeline run failed. The variant decides what happens to the
/// request row.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Store or network unavailable. The request is NOT marked failed;
    /// the worker backs off and the claim is eventually swept back to
    /// pending if the worker dies.
    #[error("transient store error: {0}")]
    Transient(String),

    /// The transformation tool timed out (after its bounded retry) or
    /// errored. Terminal for the request.
    #[error("{0}")]
    Tool(#[from] TransformError),

    /// The candidate payload failed the validation battery. Terminal;
    /// requires a corrected new request.
    #[error("validation failed: {}", issues.join("; "))]
    Validation { issues: Vec<String> },

    /// The write path raised after Process and Validate succeeded.
    /// Terminal; the backup taken in Deploy step 2 makes manual
    /// restore possible.
    #[error("deploy failed: {0}")]
    Deploy(String),

    /// The revision is live but the request row could not be marked
    /// completed. Re-running the job would deploy a duplicate
    /// revision, so the caller must retry only the completion mark.
    #[error("edit deployed but completion not recorded: {message}")]
    CompletionPending { summary: String, message: String },
}

impl PipelineError {
    /// Terminal failures mark the request failed. Transient and
    /// completion-pending failures do not: the former is retried, the
    /// latter already succeeded on the content side.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            PipelineError::Transient(_) | PipelineError::CompletionPending { .. }
        )
    }

    pub fn from_db(e: DbError) -> Self {
        match e {
            // A missing content row will not appear on retry.
            DbError::NotFound(what) => PipelineError::Deploy(format!("not found: {what}")),
            other => PipelineError::Transient(other.to_string()),
        }
    }
}

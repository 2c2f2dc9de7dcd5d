//! Pipeline stage driver: Process, Validate, Deploy.
//!
//! Nothing is written to the content store until the candidate payload
//! has passed validation, and a backup of the live payload is taken
//! before every mutation.

use retouch_backup::{Backup, BackupStore};
use retouch_core::notify::Notifier;
use retouch_core::request::ClaimedJob;
use retouch_core::transform::Transformer;
use retouch_core::validate::{self, ContentKind};
use retouch_db::repo::{ContentStore, JobStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::claim::resolve_base;
use crate::error::PipelineError;

/// Attempts at recording a completion before handing the problem back
/// to the worker.
const COMPLETION_ATTEMPTS: u32 = 3;
const COMPLETION_BACKOFF: Duration = Duration::from_millis(200);

/// Result of a successful pipeline run.
#[derive(Debug, Clone)]
pub struct EditOutcome {
    pub revision_id: i64,
    pub summary: String,
}

/// Drives one claimed request through the three stages.
pub struct Pipeline {
    jobs: Arc<dyn JobStore>,
    contents: Arc<dyn ContentStore>,
    backups: Arc<BackupStore>,
    transformer: Arc<dyn Transformer>,
    notifier: Arc<dyn Notifier>,
    transform_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        contents: Arc<dyn ContentStore>,
        backups: Arc<BackupStore>,
        transformer: Arc<dyn Transformer>,
        notifier: Arc<dyn Notifier>,
        transform_timeout: Duration,
    ) -> Self {
        Self {
            jobs,
            contents,
            backups,
            transformer,
            notifier,
            transform_timeout,
        }
    }

    /// Run a claimed request to completion. On success the request is
    /// marked completed and the requester notified. Failures are
    /// returned to the caller, which decides the request's fate from
    /// the error variant.
    pub async fn run(&self, job: &ClaimedJob) -> Result<EditOutcome, PipelineError> {
        let request = &job.request;

        // Process: hand instruction plus base payload to the tool.
        info!(
            request_id = %request.id,
            content_id = %request.content_id,
            tool = self.transformer.name(),
            base_revision = ?job.base_revision_id,
            "processing edit request"
        );
        let output = self
            .transformer
            .transform(&request.instruction, &job.base_payload, self.transform_timeout)
            .await?;

        // Validate: local battery, no external calls.
        let validation = validate::validate(&output.payload);
        if !validation.is_valid() {
            return Err(PipelineError::Validation {
                issues: validation.issues,
            });
        }

        // Deploy: backup first, then append the revision and bump the
        // pointer.
        let summary = summarize(validation.kind, &request.instruction);
        let revision_id = self
            .deploy(
                request.content_id,
                &output.payload,
                &format!("before: {}", request.id),
            )
            .await?;

        // The revision is live at this point. A store hiccup here must
        // not look like a retryable job, so the completion mark gets
        // its own bounded retry before escalating.
        let mut completion_error = None;
        for attempt in 1..=COMPLETION_ATTEMPTS {
            match self.jobs.mark_completed(request.id, &summary).await {
                Ok(()) => {
                    completion_error = None;
                    break;
                }
                Err(e) => {
                    warn!(
                        request_id = %request.id,
                        attempt,
                        error = %e,
                        "failed to record completion, retrying"
                    );
                    completion_error = Some(e);
                    tokio::time::sleep(COMPLETION_BACKOFF).await;
                }
            }
        }
        if let Some(e) = completion_error {
            return Err(PipelineError::CompletionPending {
                summary,
                message: e.to_string(),
            });
        }

        info!(
            request_id = %request.id,
            content_id = %request.content_id,
            revision_id,
            "edit deployed"
        );

        if let Some(requester) = &request.requester {
            // Best effort only; a lost notification never fails the job.
            self.notifier
                .notify(requester, &format!("Edit applied: {summary}"))
                .await;
        }

        Ok(EditOutcome {
            revision_id,
            summary,
        })
    }

    /// Roll a content item back to a snapshot. Goes through the same
    /// backup-first write path as a deploy, so the pre-restore state is
    /// itself recoverable. Running the same restore twice is harmless.
    pub async fn restore(&self, backup: &Backup) -> Result<i64, PipelineError> {
        let payload = self
            .backups
            .load_payload(backup)
            .await
            .map_err(|e| PipelineError::Deploy(e.to_string()))?;

        let revision_id = self
            .deploy(
                backup.meta.content_id,
                &payload,
                &format!("before: restore of {}", backup.meta.payload_file),
            )
            .await?;

        // Platforms reading current_payload directly see the restored
        // bytes too.
        self.contents
            .update_payload(backup.meta.content_id, &payload)
            .await
            .map_err(PipelineError::from_db)?;

        info!(
            content_id = %backup.meta.content_id,
            revision_id,
            from = %backup.meta.payload_file,
            "content restored from backup"
        );
        Ok(revision_id)
    }

    /// The only write path: fetch the live payload fresh, snapshot it,
    /// then append the new revision and move the pointer.
    async fn deploy(
        &self,
        content_id: uuid::Uuid,
        payload: &str,
        backup_description: &str,
    ) -> Result<i64, PipelineError> {
        let (live, _) = resolve_base(self.contents.as_ref(), content_id)
            .await
            .map_err(PipelineError::from_db)?;

        if let Err(e) = self
            .backups
            .snapshot(content_id, &live, backup_description)
            .await
        {
            // No backup, no mutation.
            warn!(content_id = %content_id, error = %e, "backup failed, aborting deploy");
            return Err(PipelineError::Deploy(format!("backup failed: {e}")));
        }

        self.contents
            .publish_revision(content_id, payload)
            .await
            .map_err(PipelineError::from_db)
    }
}

/// One-line completion summary, worded by content kind.
fn summarize(kind: ContentKind, instruction: &str) -> String {
    let short = truncate(instruction, 80);
    match kind {
        ContentKind::Collaborative => format!("Updated collaborative app: {short}"),
        ContentKind::Game => format!("Updated game: {short}"),
        ContentKind::Form => format!("Updated form: {short}"),
        ContentKind::Standard => format!("Updated page: {short}"),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}...")
}

//! Claim protocol: pick one eligible pending request and take it with
//! a conditional update.

use chrono::Utc;
use retouch_core::request::ClaimedJob;
use retouch_db::repo::{ContentStore, JobStore};
use retouch_db::{DbError, DbResult};
use std::sync::Arc;
use tracing::{debug, warn};

/// How many pending rows one claim attempt inspects.
const CLAIM_BATCH: i64 = 10;

/// Selects and claims edit requests for a worker.
pub struct Claimer {
    jobs: Arc<dyn JobStore>,
    contents: Arc<dyn ContentStore>,
}

impl Claimer {
    pub fn new(jobs: Arc<dyn JobStore>, contents: Arc<dyn ContentStore>) -> Self {
        Self { jobs, contents }
    }

    /// Attempt to claim the oldest eligible pending request.
    ///
    /// A candidate is eligible when no open request for the same
    /// content item precedes it. The claim itself is a conditional
    /// pending-to-processing update; losing that race returns `None`
    /// rather than falling through to the next candidate, so the
    /// worker re-enters its poll loop and re-evaluates eligibility
    /// from fresh state.
    pub async fn claim_next(&self, worker_id: &str) -> DbResult<Option<ClaimedJob>> {
        let pending = self.jobs.list_pending(CLAIM_BATCH).await?;

        for candidate in pending {
            let blocking = self
                .jobs
                .count_blocking(candidate.content_id, candidate.created_at)
                .await?;
            if blocking > 0 {
                debug!(
                    request_id = %candidate.id,
                    content_id = %candidate.content_id,
                    blocking,
                    "request blocked by earlier edit for same content"
                );
                continue;
            }

            if !self.jobs.try_claim(candidate.id, worker_id).await? {
                debug!(request_id = %candidate.id, "lost claim race");
                return Ok(None);
            }

            // The claim is already ours; a base-resolution failure must
            // not strand the row in processing.
            let (base_payload, base_revision_id) =
                match resolve_base(self.contents.as_ref(), candidate.content_id).await {
                    Ok(base) => base,
                    Err(DbError::NotFound(what)) => {
                        // The content is gone; no retry will bring it
                        // back.
                        self.jobs
                            .mark_failed(candidate.id, &format!("not found: {what}"))
                            .await?;
                        warn!(
                            request_id = %candidate.id,
                            content_id = %candidate.content_id,
                            "failed request for missing content"
                        );
                        return Ok(None);
                    }
                    Err(e) => {
                        if let Err(release_err) =
                            self.jobs.release_claimed_by(worker_id).await
                        {
                            warn!(
                                request_id = %candidate.id,
                                error = %release_err,
                                "could not release claim after base resolution failure"
                            );
                        }
                        return Err(e);
                    }
                };

            let mut request = candidate;
            request.status = "processing".to_string();
            request.claimed_by = Some(worker_id.to_string());
            request.processed_at = Some(Utc::now());

            return Ok(Some(ClaimedJob {
                request,
                base_payload,
                base_revision_id,
            }));
        }

        Ok(None)
    }
}

/// Resolve the payload an edit stacks on: the latest accepted revision
/// when the content has one, otherwise the published payload.
pub async fn resolve_base(
    contents: &dyn ContentStore,
    content_id: uuid::Uuid,
) -> DbResult<(String, Option<i64>)> {
    let content = contents.get_content(content_id).await?;
    match content.current_revision_id {
        Some(revision_id) => {
            let revision = contents.get_revision(content_id, revision_id).await?;
            Ok((revision.payload, Some(revision_id)))
        }
        None => Ok((content.current_payload, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retouch_core::request::NewEditRequest;
    use retouch_db::memory::MemoryStore;

    fn new_request(content_id: uuid::Uuid, instruction: &str) -> NewEditRequest {
        NewEditRequest {
            content_id,
            instruction: instruction.to_string(),
            requester: Some("tester".to_string()),
        }
    }

    async fn store_with_content(payload: &str) -> (Arc<MemoryStore>, uuid::Uuid) {
        let store = Arc::new(MemoryStore::new());
        let content_id = uuid::Uuid::now_v7();
        store.insert_content(content_id, payload).await.unwrap();
        (store, content_id)
    }

    fn claimer(store: &Arc<MemoryStore>) -> Claimer {
        Claimer::new(store.clone(), store.clone())
    }

    #[tokio::test]
    async fn test_claims_oldest_first() {
        let (store, a) = store_with_content("<html>a</html>").await;
        let b = uuid::Uuid::now_v7();
        store.insert_content(b, "<html>b</html>").await.unwrap();

        let first = store.insert(new_request(a, "edit a")).await.unwrap();
        store.insert(new_request(b, "edit b")).await.unwrap();

        let claimed = claimer(&store).claim_next("w1").await.unwrap().unwrap();
        assert_eq!(claimed.request.id, first.id);
        assert_eq!(claimed.request.claimed_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_second_edit_for_same_content_is_blocked() {
        let (store, content_id) = store_with_content("<html>v1</html>").await;
        let c = claimer(&store);

        let first = store.insert(new_request(content_id, "first")).await.unwrap();
        store.insert(new_request(content_id, "second")).await.unwrap();

        let claimed = c.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(claimed.request.id, first.id);

        // The later edit stays blocked while the first is processing.
        assert!(c.claim_next("w2").await.unwrap().is_none());

        store.mark_completed(first.id, "done").await.unwrap();
        let next = c.claim_next("w2").await.unwrap().unwrap();
        assert_eq!(next.request.instruction, "second");
    }

    #[tokio::test]
    async fn test_blocked_candidate_does_not_shadow_other_content() {
        let (store, a) = store_with_content("<html>a</html>").await;
        let b = uuid::Uuid::now_v7();
        store.insert_content(b, "<html>b</html>").await.unwrap();
        let c = claimer(&store);

        let a1 = store.insert(new_request(a, "a1")).await.unwrap();
        store.insert(new_request(a, "a2")).await.unwrap();
        store.insert(new_request(b, "b1")).await.unwrap();

        let first = c.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(first.request.id, a1.id);

        // a2 is blocked by a1, but b1 is independent and claimable.
        let second = c.claim_next("w2").await.unwrap().unwrap();
        assert_eq!(second.request.instruction, "b1");
    }

    #[tokio::test]
    async fn test_base_stacks_on_latest_accepted_revision() {
        let (store, content_id) = store_with_content("<html>v1</html>").await;

        let rev = store
            .publish_revision(content_id, "<html>v2</html>")
            .await
            .unwrap();

        store.insert(new_request(content_id, "edit")).await.unwrap();
        let claimed = claimer(&store).claim_next("w1").await.unwrap().unwrap();

        assert_eq!(claimed.base_payload, "<html>v2</html>");
        assert_eq!(claimed.base_revision_id, Some(rev));
    }

    #[tokio::test]
    async fn test_base_is_published_payload_without_revisions() {
        let (store, content_id) = store_with_content("<html>v1</html>").await;
        store.insert(new_request(content_id, "edit")).await.unwrap();

        let claimed = claimer(&store).claim_next("w1").await.unwrap().unwrap();
        assert_eq!(claimed.base_payload, "<html>v1</html>");
        assert_eq!(claimed.base_revision_id, None);
    }

    #[tokio::test]
    async fn test_missing_content_fails_request_instead_of_stranding_claim() {
        let store = Arc::new(MemoryStore::new());
        // Request against a content id that was never inserted.
        let orphan = store
            .insert(new_request(uuid::Uuid::now_v7(), "edit nothing"))
            .await
            .unwrap();

        let claimed = claimer(&store).claim_next("w1").await.unwrap();
        assert!(claimed.is_none());

        let request = store.get(orphan.id).await.unwrap();
        assert_eq!(request.status, "failed");
        assert!(request.error_message.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_empty_queue_claims_nothing() {
        let store = Arc::new(MemoryStore::new());
        assert!(claimer(&store).claim_next("w1").await.unwrap().is_none());
    }
}

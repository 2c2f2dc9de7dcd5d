//! Single worker loop: claim, run the pipeline, record the outcome.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use retouch_core::request::ClaimedJob;
use retouch_db::repo::JobStore;

use crate::error::PipelineError;
use crate::claim::Claimer;
use crate::pipeline::Pipeline;

/// How often one claimed job is attempted before the claim is given
/// back.
const TRANSIENT_ATTEMPTS: u32 = 3;

pub struct Worker {
    id: String,
    claimer: Claimer,
    pipeline: Arc<Pipeline>,
    jobs: Arc<dyn JobStore>,
    poll_interval: Duration,
    max_consecutive_failures: u32,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        claimer: Claimer,
        pipeline: Arc<Pipeline>,
        jobs: Arc<dyn JobStore>,
        poll_interval: Duration,
        max_consecutive_failures: u32,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            claimer,
            pipeline,
            jobs,
            poll_interval,
            max_consecutive_failures,
            shutdown,
        }
    }

    /// Poll-and-process until shutdown is signalled or too many
    /// consecutive unexpected failures suggest systemic trouble.
    ///
    /// Terminal pipeline failures are recorded on the request and do
    /// not count against the worker; store errors and exhausted
    /// transient retries do, since they repeat across jobs when the
    /// environment is broken.
    pub async fn run(mut self) {
        info!(worker_id = %self.id, "worker started");
        let mut consecutive_failures: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if consecutive_failures >= self.max_consecutive_failures {
                error!(
                    worker_id = %self.id,
                    consecutive_failures,
                    "too many consecutive failures, stopping worker"
                );
                break;
            }

            match self.claimer.claim_next(&self.id).await {
                Ok(Some(job)) => {
                    if self.process_job(&job).await {
                        consecutive_failures = 0;
                    } else {
                        consecutive_failures += 1;
                    }
                }
                Ok(None) => {
                    self.idle().await;
                }
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "claim attempt failed");
                    consecutive_failures += 1;
                    self.idle().await;
                }
            }
        }

        info!(worker_id = %self.id, "worker stopped");
    }

    /// Drive one claimed job to an outcome. Returns whether the job was
    /// handled cleanly.
    ///
    /// Transient failures happen before any content mutation (the
    /// revision write is atomic), so re-running the pipeline is safe;
    /// after the bounded retries the claim is released so later edits
    /// for the content are not blocked behind a dead row.
    async fn process_job(&mut self, job: &ClaimedJob) -> bool {
        for attempt in 1..=TRANSIENT_ATTEMPTS {
            match self.pipeline.run(job).await {
                Ok(outcome) => {
                    info!(
                        worker_id = %self.id,
                        request_id = %job.request.id,
                        revision_id = outcome.revision_id,
                        "request completed"
                    );
                    return true;
                }
                Err(e) if e.is_terminal() => {
                    warn!(
                        worker_id = %self.id,
                        request_id = %job.request.id,
                        error = %e,
                        "request failed"
                    );
                    match self.jobs.mark_failed(job.request.id, &e.to_string()).await {
                        Ok(()) => return true,
                        Err(store_err) => {
                            error!(
                                worker_id = %self.id,
                                request_id = %job.request.id,
                                error = %store_err,
                                "could not record request failure"
                            );
                            return false;
                        }
                    }
                }
                Err(PipelineError::CompletionPending { summary, message }) => {
                    warn!(
                        worker_id = %self.id,
                        request_id = %job.request.id,
                        error = %message,
                        "edit deployed, retrying completion mark"
                    );
                    return self.finish_completion(job.request.id, &summary).await;
                }
                Err(e) => {
                    warn!(
                        worker_id = %self.id,
                        request_id = %job.request.id,
                        attempt,
                        error = %e,
                        "transient failure, backing off"
                    );
                    if attempt < TRANSIENT_ATTEMPTS {
                        self.idle().await;
                    }
                }
            }
        }

        // Give the row back to pending; this worker holds at most one
        // claim at a time.
        if let Err(e) = self.jobs.release_claimed_by(&self.id).await {
            error!(worker_id = %self.id, error = %e, "could not release claim");
        }
        false
    }

    /// The revision is already live; only the request row is behind.
    /// Releasing the claim here would replay the whole deploy, so on
    /// repeated failure the row stays claimed for the stale sweep and
    /// startup recovery.
    async fn finish_completion(&mut self, request_id: uuid::Uuid, summary: &str) -> bool {
        for _ in 0..TRANSIENT_ATTEMPTS {
            match self.jobs.mark_completed(request_id, summary).await {
                Ok(()) => {
                    info!(worker_id = %self.id, request_id = %request_id, "request completed");
                    return true;
                }
                Err(e) => {
                    warn!(
                        worker_id = %self.id,
                        request_id = %request_id,
                        error = %e,
                        "completion mark still failing"
                    );
                    self.idle().await;
                }
            }
        }
        error!(
            worker_id = %self.id,
            request_id = %request_id,
            "giving up on completion mark, leaving row claimed"
        );
        false
    }

    async fn idle(&mut self) {
        let sleep = tokio::time::sleep(self.poll_interval);
        tokio::pin!(sleep);
        tokio::select! {
            _ = &mut sleep => {}
            result = self.shutdown.changed() => {
                // A closed channel is not a shutdown signal; wait out
                // the interval instead of spinning.
                if result.is_err() {
                    sleep.await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use retouch_backup::BackupStore;
    use retouch_core::content::{Content, Revision};
    use retouch_core::notify::NoopNotifier;
    use retouch_core::request::{EditRequest, NewEditRequest};
    use retouch_core::transform::{TransformError, TransformOutput, Transformer};
    use retouch_db::memory::MemoryStore;
    use retouch_db::repo::ContentStore;
    use retouch_db::{DbError, DbResult};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn valid_page(marker: &str) -> String {
        format!(
            "<!DOCTYPE html><html><head>\
             <meta name=\"viewport\" content=\"width=device-width\">\
             </head><body><div>{marker}</div></body></html>"
        )
    }

    struct FixedTransformer {
        result: Result<String, ()>,
    }

    #[async_trait]
    impl Transformer for FixedTransformer {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn transform(
            &self,
            _instruction: &str,
            _payload: &str,
            _timeout: Duration,
        ) -> Result<TransformOutput, TransformError> {
            match &self.result {
                Ok(payload) => Ok(TransformOutput {
                    payload: payload.clone(),
                }),
                Err(()) => Err(TransformError::Tool("tool exploded".to_string())),
            }
        }
    }

    fn good_transformer() -> FixedTransformer {
        FixedTransformer {
            result: Ok(valid_page("edited")),
        }
    }

    /// JobStore wrapper whose `mark_completed` fails a set number of
    /// times before succeeding.
    struct FlakyCompletionStore {
        inner: Arc<MemoryStore>,
        failures_left: AtomicU32,
    }

    impl FlakyCompletionStore {
        fn new(inner: Arc<MemoryStore>, failures: u32) -> Self {
            Self {
                inner,
                failures_left: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl JobStore for FlakyCompletionStore {
        async fn insert(&self, new: NewEditRequest) -> DbResult<EditRequest> {
            self.inner.insert(new).await
        }

        async fn get(&self, id: uuid::Uuid) -> DbResult<EditRequest> {
            self.inner.get(id).await
        }

        async fn list_pending(&self, limit: i64) -> DbResult<Vec<EditRequest>> {
            self.inner.list_pending(limit).await
        }

        async fn count_blocking(
            &self,
            content_id: uuid::Uuid,
            before: DateTime<Utc>,
        ) -> DbResult<i64> {
            self.inner.count_blocking(content_id, before).await
        }

        async fn try_claim(&self, id: uuid::Uuid, worker_id: &str) -> DbResult<bool> {
            self.inner.try_claim(id, worker_id).await
        }

        async fn mark_completed(&self, id: uuid::Uuid, summary: &str) -> DbResult<()> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(DbError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.mark_completed(id, summary).await
        }

        async fn mark_failed(&self, id: uuid::Uuid, error: &str) -> DbResult<()> {
            self.inner.mark_failed(id, error).await
        }

        async fn release_claimed_by(&self, worker_prefix: &str) -> DbResult<u64> {
            self.inner.release_claimed_by(worker_prefix).await
        }

        async fn release_all_processing(&self) -> DbResult<u64> {
            self.inner.release_all_processing().await
        }

        async fn release_stale(&self, max_age: Duration) -> DbResult<u64> {
            self.inner.release_stale(max_age).await
        }
    }

    /// ContentStore wrapper whose reads always fail as if the store
    /// were unreachable.
    struct UnreachableContentStore {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl ContentStore for UnreachableContentStore {
        async fn insert_content(&self, id: uuid::Uuid, payload: &str) -> DbResult<Content> {
            self.inner.insert_content(id, payload).await
        }

        async fn get_content(&self, _id: uuid::Uuid) -> DbResult<Content> {
            Err(DbError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn get_revision(
            &self,
            content_id: uuid::Uuid,
            revision_id: i64,
        ) -> DbResult<Revision> {
            self.inner.get_revision(content_id, revision_id).await
        }

        async fn publish_revision(&self, content_id: uuid::Uuid, payload: &str) -> DbResult<i64> {
            self.inner.publish_revision(content_id, payload).await
        }

        async fn update_payload(&self, content_id: uuid::Uuid, payload: &str) -> DbResult<()> {
            self.inner.update_payload(content_id, payload).await
        }
    }

    fn temp_backups() -> Arc<BackupStore> {
        Arc::new(BackupStore::new(
            std::env::temp_dir()
                .join("retouch-worker-tests")
                .join(uuid::Uuid::now_v7().simple().to_string()),
        ))
    }

    fn build_worker_with(
        jobs: Arc<dyn JobStore>,
        contents: Arc<dyn ContentStore>,
        transformer: FixedTransformer,
        max_consecutive_failures: u32,
        shutdown: watch::Receiver<bool>,
    ) -> Worker {
        let pipeline = Arc::new(Pipeline::new(
            jobs.clone(),
            contents.clone(),
            temp_backups(),
            Arc::new(transformer),
            Arc::new(NoopNotifier),
            Duration::from_secs(5),
        ));
        Worker::new(
            "test-w0".to_string(),
            Claimer::new(jobs.clone(), contents),
            pipeline,
            jobs,
            Duration::from_millis(5),
            max_consecutive_failures,
            shutdown,
        )
    }

    fn build_worker(
        store: &Arc<MemoryStore>,
        transformer: FixedTransformer,
        shutdown: watch::Receiver<bool>,
    ) -> Worker {
        build_worker_with(store.clone(), store.clone(), transformer, 5, shutdown)
    }

    async fn wait_for_terminal(store: &MemoryStore, id: uuid::Uuid) -> String {
        for _ in 0..400 {
            let status = store.get(id).await.unwrap().status;
            if status == "completed" || status == "failed" {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("request {id} never reached a terminal status");
    }

    async fn submit(store: &MemoryStore, content_id: uuid::Uuid) -> uuid::Uuid {
        store
            .insert(NewEditRequest {
                content_id,
                instruction: "edit".to_string(),
                requester: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_worker_processes_queue_until_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let a = uuid::Uuid::now_v7();
        let b = uuid::Uuid::now_v7();
        store.insert_content(a, &valid_page("a")).await.unwrap();
        store.insert_content(b, &valid_page("b")).await.unwrap();
        let ra = submit(&store, a).await;
        let rb = submit(&store, b).await;

        let (tx, rx) = watch::channel(false);
        let worker = build_worker(&store, good_transformer(), rx);
        let handle = tokio::spawn(worker.run());

        assert_eq!(wait_for_terminal(&store, ra).await, "completed");
        assert_eq!(wait_for_terminal(&store, rb).await, "completed");

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_terminal_failure_marks_request_failed() {
        let store = Arc::new(MemoryStore::new());
        let c = uuid::Uuid::now_v7();
        store.insert_content(c, &valid_page("v1")).await.unwrap();
        let id = submit(&store, c).await;

        let (tx, rx) = watch::channel(false);
        let worker = build_worker(&store, FixedTransformer { result: Err(()) }, rx);
        let handle = tokio::spawn(worker.run());

        assert_eq!(wait_for_terminal(&store, id).await, "failed");
        let failed = store.get(id).await.unwrap();
        assert!(failed.error_message.unwrap().contains("tool exploded"));

        // Content untouched by the failed edit.
        let content = store.get_content(c).await.unwrap();
        assert_eq!(content.current_revision_id, None);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_flaky_completion_retried_without_duplicate_deploy() {
        let store = Arc::new(MemoryStore::new());
        let c = uuid::Uuid::now_v7();
        store.insert_content(c, &valid_page("v1")).await.unwrap();
        let id = submit(&store, c).await;

        // Four failures: enough to exhaust the pipeline's own retries
        // and exercise the worker's completion-pending path too.
        let jobs = Arc::new(FlakyCompletionStore::new(store.clone(), 4));

        let (tx, rx) = watch::channel(false);
        let worker = build_worker_with(jobs, store.clone(), good_transformer(), 5, rx);
        let handle = tokio::spawn(worker.run());

        assert_eq!(wait_for_terminal(&store, id).await, "completed");

        // Exactly one revision despite the completion-mark failures.
        let content = store.get_content(c).await.unwrap();
        assert_eq!(content.current_revision_id, Some(1));
        assert!(matches!(
            store.get_revision(c, 2).await,
            Err(DbError::NotFound(_))
        ));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_store_releases_claim_and_stops_worker() {
        let store = Arc::new(MemoryStore::new());
        let c = uuid::Uuid::now_v7();
        store.insert_content(c, &valid_page("v1")).await.unwrap();
        let id = submit(&store, c).await;

        let contents = Arc::new(UnreachableContentStore {
            inner: store.clone(),
        });

        let (_tx, rx) = watch::channel(false);
        let worker = build_worker_with(store.clone(), contents, good_transformer(), 2, rx);

        // No shutdown signal: the worker must stop on its own once the
        // consecutive-failure bound is hit.
        tokio::time::timeout(Duration::from_secs(5), tokio::spawn(worker.run()))
            .await
            .expect("worker did not stop after repeated failures")
            .unwrap();

        // The row is back in pending, not stranded in processing.
        let request = store.get(id).await.unwrap();
        assert_eq!(request.status, "pending");
        assert!(request.claimed_by.is_none());
    }
}

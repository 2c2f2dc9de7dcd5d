//! In-memory store for tests and local development.
//!
//! Implements both store traits over a single mutex so the claim
//! compare-and-swap has the same atomicity as the conditional UPDATE
//! in the Postgres implementation.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use retouch_core::content::{Content, Revision, RevisionStatus};
use retouch_core::request::{EditRequest, EditStatus, NewEditRequest};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::repo::{ContentStore, JobStore};
use crate::{DbError, DbResult};

#[derive(Default)]
struct Inner {
    requests: Vec<EditRequest>,
    contents: HashMap<uuid::Uuid, Content>,
    revisions: HashMap<uuid::Uuid, Vec<Revision>>,
    /// Monotonic tick so created_at values are strictly increasing
    /// even when the wall clock does not move between inserts.
    ticks: i64,
}

impl Inner {
    fn next_created_at(&mut self) -> DateTime<Utc> {
        self.ticks += 1;
        Utc::now() + ChronoDuration::microseconds(self.ticks)
    }
}

/// Shared in-memory implementation of `JobStore` and `ContentStore`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens after a panicking test; propagate
        // the inner state regardless.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Test hook: rewrite a request's claim time, for stale-sweep
    /// scenarios.
    pub fn backdate_claim(&self, id: uuid::Uuid, age: Duration) {
        let mut inner = self.lock();
        if let Some(request) = inner.requests.iter_mut().find(|r| r.id == id) {
            request.processed_at =
                Some(Utc::now() - ChronoDuration::from_std(age).unwrap_or_default());
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, new: NewEditRequest) -> DbResult<EditRequest> {
        let mut inner = self.lock();
        let created_at = inner.next_created_at();
        let request = EditRequest {
            id: uuid::Uuid::now_v7(),
            content_id: new.content_id,
            instruction: new.instruction,
            status: EditStatus::Pending.as_str().to_string(),
            claimed_by: None,
            requester: new.requester,
            error_message: None,
            summary: None,
            created_at,
            processed_at: None,
            completed_at: None,
        };
        inner.requests.push(request.clone());
        Ok(request)
    }

    async fn get(&self, id: uuid::Uuid) -> DbResult<EditRequest> {
        self.lock()
            .requests
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("edit request {}", id)))
    }

    async fn list_pending(&self, limit: i64) -> DbResult<Vec<EditRequest>> {
        let inner = self.lock();
        let mut pending: Vec<EditRequest> = inner
            .requests
            .iter()
            .filter(|r| r.status == EditStatus::Pending.as_str())
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn count_blocking(
        &self,
        content_id: uuid::Uuid,
        before: DateTime<Utc>,
    ) -> DbResult<i64> {
        let inner = self.lock();
        let count = inner
            .requests
            .iter()
            .filter(|r| {
                r.content_id == content_id
                    && r.created_at < before
                    && (r.status == EditStatus::Pending.as_str()
                        || r.status == EditStatus::Processing.as_str())
            })
            .count();
        Ok(count as i64)
    }

    async fn try_claim(&self, id: uuid::Uuid, worker_id: &str) -> DbResult<bool> {
        let mut inner = self.lock();
        let Some(request) = inner.requests.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        if request.status != EditStatus::Pending.as_str() {
            return Ok(false);
        }
        request.status = EditStatus::Processing.as_str().to_string();
        request.claimed_by = Some(worker_id.to_string());
        request.processed_at = Some(Utc::now());
        Ok(true)
    }

    async fn mark_completed(&self, id: uuid::Uuid, summary: &str) -> DbResult<()> {
        let mut inner = self.lock();
        let request = inner
            .requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DbError::NotFound(format!("edit request {}", id)))?;
        request.status = EditStatus::Completed.as_str().to_string();
        request.summary = Some(summary.to_string());
        request.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, id: uuid::Uuid, error: &str) -> DbResult<()> {
        let mut inner = self.lock();
        let request = inner
            .requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DbError::NotFound(format!("edit request {}", id)))?;
        request.status = EditStatus::Failed.as_str().to_string();
        request.error_message = Some(error.to_string());
        request.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn release_claimed_by(&self, worker_prefix: &str) -> DbResult<u64> {
        let mut inner = self.lock();
        let mut released = 0;
        for request in inner.requests.iter_mut() {
            let claimed_here = request
                .claimed_by
                .as_deref()
                .is_some_and(|w| w.starts_with(worker_prefix));
            if request.status == EditStatus::Processing.as_str() && claimed_here {
                request.status = EditStatus::Pending.as_str().to_string();
                request.claimed_by = None;
                request.processed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn release_all_processing(&self) -> DbResult<u64> {
        let mut inner = self.lock();
        let mut released = 0;
        for request in inner.requests.iter_mut() {
            if request.status == EditStatus::Processing.as_str() {
                request.status = EditStatus::Pending.as_str().to_string();
                request.claimed_by = None;
                request.processed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn release_stale(&self, max_age: Duration) -> DbResult<u64> {
        let cutoff = Utc::now() - ChronoDuration::from_std(max_age).unwrap_or_default();
        let mut inner = self.lock();
        let mut released = 0;
        for request in inner.requests.iter_mut() {
            let stale = request.processed_at.is_some_and(|t| t < cutoff);
            if request.status == EditStatus::Processing.as_str() && stale {
                request.status = EditStatus::Pending.as_str().to_string();
                request.claimed_by = None;
                request.processed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn insert_content(&self, id: uuid::Uuid, payload: &str) -> DbResult<Content> {
        let mut inner = self.lock();
        let now = Utc::now();
        let content = Content {
            id,
            current_payload: payload.to_string(),
            current_revision_id: None,
            created_at: now,
            updated_at: now,
        };
        inner.contents.insert(id, content.clone());
        Ok(content)
    }

    async fn get_content(&self, id: uuid::Uuid) -> DbResult<Content> {
        self.lock()
            .contents
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("content {}", id)))
    }

    async fn get_revision(&self, content_id: uuid::Uuid, revision_id: i64) -> DbResult<Revision> {
        self.lock()
            .revisions
            .get(&content_id)
            .and_then(|chain| chain.iter().find(|r| r.revision_id == revision_id))
            .cloned()
            .ok_or_else(|| {
                DbError::NotFound(format!("revision {} of content {}", revision_id, content_id))
            })
    }

    async fn publish_revision(&self, content_id: uuid::Uuid, payload: &str) -> DbResult<i64> {
        // Append and pointer bump happen under one lock, matching the
        // transaction in the Postgres implementation.
        let mut inner = self.lock();
        if !inner.contents.contains_key(&content_id) {
            return Err(DbError::NotFound(format!("content {}", content_id)));
        }

        let chain = inner.revisions.entry(content_id).or_default();
        let revision_id = chain.iter().map(|r| r.revision_id).max().unwrap_or(0) + 1;
        chain.push(Revision {
            content_id,
            revision_id,
            payload: payload.to_string(),
            status: RevisionStatus::Completed.as_str().to_string(),
            created_at: Utc::now(),
        });

        if let Some(content) = inner.contents.get_mut(&content_id) {
            content.current_revision_id = Some(revision_id);
            content.updated_at = Utc::now();
        }
        Ok(revision_id)
    }

    async fn update_payload(&self, content_id: uuid::Uuid, payload: &str) -> DbResult<()> {
        let mut inner = self.lock();
        let content = inner
            .contents
            .get_mut(&content_id)
            .ok_or_else(|| DbError::NotFound(format!("content {}", content_id)))?;
        content.current_payload = payload.to_string();
        content.updated_at = Utc::now();
        Ok(())
    }
}

//! Edit request store: the sole coordination point between producers
//! and workers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use retouch_core::request::{EditRequest, NewEditRequest};
use sqlx::PgPool;
use std::time::Duration;

use crate::{DbError, DbResult};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enqueue a new edit request (producer side).
    async fn insert(&self, new: NewEditRequest) -> DbResult<EditRequest>;

    /// Fetch one request by id.
    async fn get(&self, id: uuid::Uuid) -> DbResult<EditRequest>;

    /// Pending requests in submission order, oldest first.
    async fn list_pending(&self, limit: i64) -> DbResult<Vec<EditRequest>>;

    /// Count of open (pending or processing) requests for the same
    /// content item created before `before`. Non-zero means a candidate
    /// is blocked by the per-content ordering constraint.
    async fn count_blocking(
        &self,
        content_id: uuid::Uuid,
        before: DateTime<Utc>,
    ) -> DbResult<i64>;

    /// Atomically transition a request from pending to processing.
    /// Returns false when another worker won the race.
    async fn try_claim(&self, id: uuid::Uuid, worker_id: &str) -> DbResult<bool>;

    /// Terminal success: record the summary and completion time.
    async fn mark_completed(&self, id: uuid::Uuid, summary: &str) -> DbResult<()>;

    /// Terminal failure: record the error message and completion time.
    async fn mark_failed(&self, id: uuid::Uuid, error: &str) -> DbResult<()>;

    /// Release rows claimed by workers of this instance back to
    /// pending. Used on graceful shutdown.
    async fn release_claimed_by(&self, worker_prefix: &str) -> DbResult<u64>;

    /// Coarse recovery: release every processing row back to pending.
    async fn release_all_processing(&self) -> DbResult<u64>;

    /// Reclaim processing rows whose claim is older than `max_age`,
    /// presuming the claiming worker dead.
    async fn release_stale(&self, max_age: Duration) -> DbResult<u64>;
}

/// PostgreSQL implementation of JobStore.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, new: NewEditRequest) -> DbResult<EditRequest> {
        let request = sqlx::query_as::<_, EditRequest>(
            r#"
            INSERT INTO edit_requests (id, content_id, instruction, requester, status, created_at)
            VALUES ($1, $2, $3, $4, 'pending', NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(new.content_id)
        .bind(&new.instruction)
        .bind(&new.requester)
        .fetch_one(&self.pool)
        .await?;
        Ok(request)
    }

    async fn get(&self, id: uuid::Uuid) -> DbResult<EditRequest> {
        let request =
            sqlx::query_as::<_, EditRequest>("SELECT * FROM edit_requests WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("edit request {}", id)))?;
        Ok(request)
    }

    async fn list_pending(&self, limit: i64) -> DbResult<Vec<EditRequest>> {
        let requests = sqlx::query_as::<_, EditRequest>(
            r#"
            SELECT * FROM edit_requests
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(requests)
    }

    async fn count_blocking(
        &self,
        content_id: uuid::Uuid,
        before: DateTime<Utc>,
    ) -> DbResult<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM edit_requests
            WHERE content_id = $1
              AND created_at < $2
              AND status IN ('pending', 'processing')
            "#,
        )
        .bind(content_id)
        .bind(before)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }

    async fn try_claim(&self, id: uuid::Uuid, worker_id: &str) -> DbResult<bool> {
        // Compare-and-swap on the status column: zero rows affected
        // means another worker won the race.
        let result = sqlx::query(
            r#"
            UPDATE edit_requests
            SET status = 'processing', claimed_by = $2, processed_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_completed(&self, id: uuid::Uuid, summary: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE edit_requests
            SET status = 'completed', summary = $2, completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: uuid::Uuid, error: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE edit_requests
            SET status = 'failed', error_message = $2, completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_claimed_by(&self, worker_prefix: &str) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE edit_requests
            SET status = 'pending', claimed_by = NULL, processed_at = NULL
            WHERE status = 'processing' AND claimed_by LIKE $1 || '%'
            "#,
        )
        .bind(worker_prefix)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn release_all_processing(&self) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE edit_requests
            SET status = 'pending', claimed_by = NULL, processed_at = NULL
            WHERE status = 'processing'
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn release_stale(&self, max_age: Duration) -> DbResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(1));
        let result = sqlx::query(
            r#"
            UPDATE edit_requests
            SET status = 'pending', claimed_by = NULL, processed_at = NULL
            WHERE status = 'processing' AND processed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

//! Content store: published payloads and revision chains.

use async_trait::async_trait;
use retouch_core::content::{Content, Revision};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Create a content item with its initial payload.
    async fn insert_content(&self, id: uuid::Uuid, payload: &str) -> DbResult<Content>;

    async fn get_content(&self, id: uuid::Uuid) -> DbResult<Content>;

    async fn get_revision(&self, content_id: uuid::Uuid, revision_id: i64) -> DbResult<Revision>;

    /// Append a completed revision to the chain and move the content's
    /// latest-accepted pointer to it, atomically. Returns the new
    /// revision_id; ids are monotonically increasing per content item.
    async fn publish_revision(&self, content_id: uuid::Uuid, payload: &str) -> DbResult<i64>;

    /// Overwrite the published payload in place. Used by platforms
    /// without a revision chain and by restore.
    async fn update_payload(&self, content_id: uuid::Uuid, payload: &str) -> DbResult<()>;
}

/// PostgreSQL implementation of ContentStore.
pub struct PgContentStore {
    pool: PgPool,
}

impl PgContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContentStore for PgContentStore {
    async fn insert_content(&self, id: uuid::Uuid, payload: &str) -> DbResult<Content> {
        let content = sqlx::query_as::<_, Content>(
            r#"
            INSERT INTO contents (id, current_payload, created_at, updated_at)
            VALUES ($1, $2, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(content)
    }

    async fn get_content(&self, id: uuid::Uuid) -> DbResult<Content> {
        let content = sqlx::query_as::<_, Content>("SELECT * FROM contents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("content {}", id)))?;
        Ok(content)
    }

    async fn get_revision(&self, content_id: uuid::Uuid, revision_id: i64) -> DbResult<Revision> {
        let revision = sqlx::query_as::<_, Revision>(
            "SELECT * FROM content_revisions WHERE content_id = $1 AND revision_id = $2",
        )
        .bind(content_id)
        .bind(revision_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            DbError::NotFound(format!("revision {} of content {}", revision_id, content_id))
        })?;
        Ok(revision)
    }

    async fn publish_revision(&self, content_id: uuid::Uuid, payload: &str) -> DbResult<i64> {
        // Append and pointer bump commit together; a crash between the
        // two statements must not leave an orphan completed revision.
        let mut tx = self.pool.begin().await?;

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO content_revisions (content_id, revision_id, payload, status, created_at)
            SELECT $1, COALESCE(MAX(revision_id), 0) + 1, $2, 'completed', NOW()
            FROM content_revisions WHERE content_id = $1
            RETURNING revision_id
            "#,
        )
        .bind(content_id)
        .bind(payload)
        .fetch_one(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE contents
            SET current_revision_id = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(content_id)
        .bind(row.0)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            // Dropping the transaction rolls the insert back.
            return Err(DbError::NotFound(format!("content {}", content_id)));
        }

        tx.commit().await?;
        Ok(row.0)
    }

    async fn update_payload(&self, content_id: uuid::Uuid, payload: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE contents
            SET current_payload = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(content_id)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("content {}", content_id)));
        }
        Ok(())
    }
}

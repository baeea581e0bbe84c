//! Queue lists stored in the `ready_queue` / `delayed_queue` tables.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::{QueueError, message::QueueEntry, traits::TaskQueue};

#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskQueue for PgQueue {
    async fn push_ready(&self, payload: String) -> Result<(), QueueError> {
        sqlx::query("INSERT INTO ready_queue (payload) VALUES ($1)")
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// `FOR UPDATE SKIP LOCKED` lets concurrent dispatchers pop without
    /// blocking on each other or receiving the same row.
    async fn pop_ready(&self) -> Result<Option<String>, QueueError> {
        let payload: Option<String> = sqlx::query_scalar(
            r#"
            DELETE FROM ready_queue
            WHERE id = (
                SELECT id FROM ready_queue
                ORDER BY id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING payload
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(payload)
    }

    async fn push_delayed(&self, payload: String) -> Result<(), QueueError> {
        sqlx::query("INSERT INTO delayed_queue (payload) VALUES ($1)")
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn scan_delayed(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, payload FROM delayed_queue ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, payload)| QueueEntry { id, payload })
            .collect())
    }

    async fn remove_delayed(&self, id: i64) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM delayed_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

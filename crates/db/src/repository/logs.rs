//! Append-only task log lines.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    DbError,
    models::{NewTaskLog, TaskLogRow},
};

pub async fn append_log(pool: &PgPool, new: NewTaskLog) -> Result<TaskLogRow, DbError> {
    let row = sqlx::query_as::<_, TaskLogRow>(
        r#"
        INSERT INTO task_logs (id, task_id, run_id, level, message, metadata, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, task_id, run_id, level, message, metadata, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(new.task_id)
    .bind(new.run_id)
    .bind(new.level.as_str())
    .bind(new.message)
    .bind(new.metadata)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Log lines for one task, oldest first.
pub async fn list_logs_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskLogRow>, DbError> {
    let rows = sqlx::query_as::<_, TaskLogRow>(
        r#"
        SELECT id, task_id, run_id, level, message, metadata, created_at
        FROM task_logs
        WHERE task_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

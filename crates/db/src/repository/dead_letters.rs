use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    DbError,
    models::{DeadLetterRow, NewDeadLetter},
};

pub async fn append_dead_letter(pool: &PgPool, new: NewDeadLetter) -> Result<DeadLetterRow, DbError> {
    let row = sqlx::query_as::<_, DeadLetterRow>(
        r#"
        INSERT INTO dead_letters
            (id, run_id, workflow_id, node_id, input, error, retry_count, max_retries, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id, run_id, workflow_id, node_id, input, error, retry_count, max_retries, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(new.run_id)
    .bind(new.workflow_id)
    .bind(new.node_id)
    .bind(new.input)
    .bind(new.error)
    .bind(new.retry_count)
    .bind(new.max_retries)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn list_dead_letters_for_run(
    pool: &PgPool,
    run_id: Uuid,
) -> Result<Vec<DeadLetterRow>, DbError> {
    let rows = sqlx::query_as::<_, DeadLetterRow>(
        r#"
        SELECT id, run_id, workflow_id, node_id, input, error, retry_count, max_retries, created_at
        FROM dead_letters
        WHERE run_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

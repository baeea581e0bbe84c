//! Task repository functions.
//!
//! The two race-prone writes are expressed as single statements:
//! - creation is `INSERT … ON CONFLICT DO NOTHING`,
//! - claiming is `UPDATE … WHERE status IN ('PENDING', 'RETRY')`.
//!
//! In both cases the loser gets `Ok(None)`.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    DbError,
    models::{NewTask, RunStatus, TaskRow, TaskStatus, TaskTransition},
};

const TASK_COLUMNS: &str = "id, run_id, workflow_id, node_id, status, input, output, error, \
                            retry_count, max_retries, idempotency_key, started_at, completed_at, \
                            created_at, updated_at";

/// Insert a `PENDING` task unless one already exists for `(run_id, node_id)`.
pub async fn insert_task_if_absent(pool: &PgPool, new: NewTask) -> Result<Option<TaskRow>, DbError> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let key = new.idempotency_key();

    let sql = format!(
        "INSERT INTO tasks \
             (id, run_id, workflow_id, node_id, status, input, retry_count, max_retries, \
              idempotency_key, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8, $9, $9) \
         ON CONFLICT DO NOTHING \
         RETURNING {TASK_COLUMNS}"
    );
    let row = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(id)
        .bind(new.run_id)
        .bind(new.workflow_id)
        .bind(new.node_id)
        .bind(TaskStatus::Pending.as_str())
        .bind(new.input)
        .bind(new.max_retries)
        .bind(key)
        .bind(now)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<TaskRow, DbError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
    sqlx::query_as::<_, TaskRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::not_found("task", id))
}

pub async fn list_tasks_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<TaskRow>, DbError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE run_id = $1 ORDER BY created_at ASC");
    let rows = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(run_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Atomically move a `PENDING`/`RETRY` task to `RUNNING`.
pub async fn claim_task(pool: &PgPool, id: Uuid) -> Result<Option<TaskRow>, DbError> {
    let now = Utc::now();
    let sql = format!(
        "UPDATE tasks SET status = $1, started_at = $2, updated_at = $2 \
         WHERE id = $3 AND status IN ($4, $5) \
         RETURNING {TASK_COLUMNS}"
    );
    let row = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(TaskStatus::Running.as_str())
        .bind(now)
        .bind(id)
        .bind(TaskStatus::Pending.as_str())
        .bind(TaskStatus::Retry.as_str())
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Apply a handler result to a task that is still `RUNNING`.
pub async fn complete_task(
    pool: &PgPool,
    id: Uuid,
    transition: TaskTransition,
) -> Result<Option<TaskRow>, DbError> {
    let now = Utc::now();
    let status = transition.status();

    let (output, error, retry_count, completed_at): (
        Option<serde_json::Value>,
        Option<String>,
        Option<i32>,
        Option<DateTime<Utc>>,
    ) = match transition {
        TaskTransition::Succeeded { output } => (Some(output), None, None, Some(now)),
        TaskTransition::Retrying { error, retry_count } => (None, Some(error), Some(retry_count), None),
        TaskTransition::Failed { error } => (None, Some(error), None, Some(now)),
    };

    let sql = format!(
        "UPDATE tasks SET \
             status = $1, \
             output = COALESCE($2, output), \
             error = COALESCE($3, error), \
             retry_count = COALESCE($4, retry_count), \
             completed_at = COALESCE($5, completed_at), \
             updated_at = $6 \
         WHERE id = $7 AND status = $8 \
         RETURNING {TASK_COLUMNS}"
    );
    let row = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .bind(retry_count)
        .bind(completed_at)
        .bind(now)
        .bind(id)
        .bind(TaskStatus::Running.as_str())
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

const NON_TERMINAL: [TaskStatus; 3] = [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Retry];

fn labels(statuses: &[TaskStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_owned()).collect()
}

/// Cancel one task if it is not terminal yet.
pub async fn cancel_task(pool: &PgPool, id: Uuid) -> Result<Option<TaskRow>, DbError> {
    let now = Utc::now();
    let sql = format!(
        "UPDATE tasks SET status = $1, completed_at = $2, updated_at = $2 \
         WHERE id = $3 AND status = ANY($4) \
         RETURNING {TASK_COLUMNS}"
    );
    let row = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(TaskStatus::Canceled.as_str())
        .bind(now)
        .bind(id)
        .bind(labels(&NON_TERMINAL))
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Cancel every non-terminal task of a run; returns the canceled rows.
pub async fn cancel_tasks_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<TaskRow>, DbError> {
    let now = Utc::now();
    let sql = format!(
        "UPDATE tasks SET status = $1, completed_at = $2, updated_at = $2 \
         WHERE run_id = $3 AND status = ANY($4) \
         RETURNING {TASK_COLUMNS}"
    );
    let rows = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(TaskStatus::Canceled.as_str())
        .bind(now)
        .bind(run_id)
        .bind(labels(&NON_TERMINAL))
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// `PENDING`/`RETRY` tasks of running runs untouched since `before`.
pub async fn list_stale_tasks(pool: &PgPool, before: DateTime<Utc>) -> Result<Vec<TaskRow>, DbError> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks \
         WHERE status IN ($1, $2) AND updated_at < $3 \
           AND run_id IN (SELECT id FROM runs WHERE status = $4) \
         ORDER BY updated_at ASC"
    );
    let rows = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(TaskStatus::Pending.as_str())
        .bind(TaskStatus::Retry.as_str())
        .bind(before)
        .bind(RunStatus::Running.as_str())
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Bump `updated_at` without changing anything else.
pub async fn touch_task(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    sqlx::query("UPDATE tasks SET updated_at = $1 WHERE id = $2")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

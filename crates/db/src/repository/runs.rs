//! Run repository functions.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    DbError,
    models::{NewRun, RunRow, RunStatus, RunTransition},
};

const RUN_COLUMNS: &str = "id, workflow_id, workflow_version, status, input, output, \
                           started_at, completed_at, created_by, created_at, updated_at";

fn status_labels(statuses: &[RunStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_owned()).collect()
}

/// Create a new run record in `PENDING` status.
pub async fn create_run(pool: &PgPool, new: NewRun) -> Result<RunRow, DbError> {
    let id = Uuid::new_v4();
    let now = Utc::now();

    let sql = format!(
        "INSERT INTO runs (id, workflow_id, workflow_version, status, input, created_by, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $7) \
         RETURNING {RUN_COLUMNS}"
    );
    let row = sqlx::query_as::<_, RunRow>(&sql)
        .bind(id)
        .bind(new.workflow_id)
        .bind(new.workflow_version)
        .bind(RunStatus::Pending.as_str())
        .bind(new.input)
        .bind(new.created_by)
        .bind(now)
        .fetch_one(pool)
        .await?;

    Ok(row)
}

pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<RunRow, DbError> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1");
    sqlx::query_as::<_, RunRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::not_found("run", id))
}

pub async fn list_runs_by_status(pool: &PgPool, status: RunStatus) -> Result<Vec<RunRow>, DbError> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE status = $1 ORDER BY created_at ASC");
    let rows = sqlx::query_as::<_, RunRow>(&sql)
        .bind(status.as_str())
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Compare-and-swap the run status.
///
/// Returns `None` when the run's current status is not one of `from`.
pub async fn transition_run(
    pool: &PgPool,
    id: Uuid,
    from: &[RunStatus],
    to: RunTransition,
) -> Result<Option<RunRow>, DbError> {
    let now = Utc::now();
    let sql = format!(
        "UPDATE runs SET \
             status = $1, \
             output = COALESCE($2, output), \
             started_at = CASE WHEN $3 THEN COALESCE(started_at, $5) ELSE started_at END, \
             completed_at = CASE WHEN $4 THEN $5 ELSE completed_at END, \
             updated_at = $5 \
         WHERE id = $6 AND status = ANY($7) \
         RETURNING {RUN_COLUMNS}"
    );
    let row = sqlx::query_as::<_, RunRow>(&sql)
        .bind(to.status.as_str())
        .bind(to.output.clone())
        .bind(to.stamps_start())
        .bind(to.stamps_completion())
        .bind(now)
        .bind(id)
        .bind(status_labels(from))
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Terminal runs whose `completed_at` is older than `cutoff`.
pub async fn list_runs_completed_before(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<RunRow>, DbError> {
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM runs \
         WHERE status = ANY($1) AND completed_at < $2"
    );
    let terminal = [RunStatus::Success, RunStatus::Failed, RunStatus::Canceled];
    let rows = sqlx::query_as::<_, RunRow>(&sql)
        .bind(status_labels(&terminal))
        .bind(cutoff)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Delete a run with its tasks and task logs in one transaction.
///
/// Dead letters are kept: they are the diagnostic record of the run.
pub async fn delete_run(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM task_logs WHERE run_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM tasks WHERE run_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("DELETE FROM runs WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(DbError::not_found("run", id));
    }

    tx.commit().await?;
    Ok(())
}

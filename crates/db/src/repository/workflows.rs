//! Workflow version storage.
//!
//! Definitions are never updated in place: inserting under an existing name
//! creates the next version.  Runs pin the exact row they were started from.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, models::WorkflowRow};

/// Insert a new workflow version.
///
/// `definition` must be a JSON object produced by serialising the domain
/// `Workflow` graph from the `engine` crate.  The version is one above the
/// highest existing version for `name` (1 for a new name).
pub async fn create_workflow(
    pool: &PgPool,
    name: &str,
    definition: serde_json::Value,
) -> Result<WorkflowRow, DbError> {
    let id = Uuid::new_v4();
    let now = Utc::now();

    let row = sqlx::query_as::<_, WorkflowRow>(
        r#"
        INSERT INTO workflows (id, name, version, definition, is_active, created_at)
        VALUES (
            $1, $2,
            (SELECT COALESCE(MAX(version), 0) + 1 FROM workflows WHERE name = $2),
            $3, TRUE, $4
        )
        RETURNING id, name, version, definition, is_active, created_at
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(definition)
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Fetch a single workflow version by its primary key.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<WorkflowRow, DbError> {
    let row = sqlx::query_as::<_, WorkflowRow>(
        r#"SELECT id, name, version, definition, is_active, created_at FROM workflows WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::not_found("workflow", id))?;

    Ok(row)
}

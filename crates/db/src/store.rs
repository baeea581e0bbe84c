//! The persistence contract the engine is written against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    DbError, DbPool,
    models::{
        DeadLetterRow, NewDeadLetter, NewRun, NewTask, NewTaskLog, RunRow, RunStatus,
        RunTransition, TaskLogRow, TaskRow, TaskTransition, WorkflowRow,
    },
    repository::{dead_letters, logs, runs, tasks, workflows},
};

/// Durable state for workflows, runs, tasks, logs and dead letters.
///
/// Conditional writes return `Ok(None)` when the precondition did not hold;
/// callers treat that as "someone else got there first", never as an error.
#[async_trait]
pub trait Store: Send + Sync {
    // workflows
    async fn insert_workflow(&self, name: &str, definition: serde_json::Value) -> Result<WorkflowRow, DbError>;
    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError>;

    // runs
    async fn create_run(&self, new: NewRun) -> Result<RunRow, DbError>;
    async fn get_run(&self, id: Uuid) -> Result<RunRow, DbError>;
    async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<RunRow>, DbError>;
    /// Compare-and-swap: applies only if the current status is in `from`.
    async fn transition_run(
        &self,
        id: Uuid,
        from: &[RunStatus],
        to: RunTransition,
    ) -> Result<Option<RunRow>, DbError>;
    async fn list_runs_completed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<RunRow>, DbError>;
    /// Removes the run, its tasks and its task logs. Dead letters stay.
    async fn delete_run(&self, id: Uuid) -> Result<(), DbError>;

    // tasks
    /// At most one task ever exists per `(run_id, node_id)`.
    async fn insert_task_if_absent(&self, new: NewTask) -> Result<Option<TaskRow>, DbError>;
    async fn get_task(&self, id: Uuid) -> Result<TaskRow, DbError>;
    async fn list_tasks_for_run(&self, run_id: Uuid) -> Result<Vec<TaskRow>, DbError>;
    /// `PENDING`/`RETRY` -> `RUNNING`.
    async fn claim_task(&self, id: Uuid) -> Result<Option<TaskRow>, DbError>;
    /// Applies only while the task is `RUNNING`.
    async fn complete_task(&self, id: Uuid, transition: TaskTransition) -> Result<Option<TaskRow>, DbError>;
    async fn cancel_task(&self, id: Uuid) -> Result<Option<TaskRow>, DbError>;
    async fn cancel_tasks_for_run(&self, run_id: Uuid) -> Result<Vec<TaskRow>, DbError>;
    async fn list_stale_tasks(&self, before: DateTime<Utc>) -> Result<Vec<TaskRow>, DbError>;
    async fn touch_task(&self, id: Uuid) -> Result<(), DbError>;

    // logs and dead letters
    async fn append_log(&self, new: NewTaskLog) -> Result<TaskLogRow, DbError>;
    async fn list_logs_for_task(&self, task_id: Uuid) -> Result<Vec<TaskLogRow>, DbError>;
    async fn append_dead_letter(&self, new: NewDeadLetter) -> Result<DeadLetterRow, DbError>;
    async fn list_dead_letters_for_run(&self, run_id: Uuid) -> Result<Vec<DeadLetterRow>, DbError>;
}

/// [`Store`] backed by the Postgres repository functions.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_workflow(&self, name: &str, definition: serde_json::Value) -> Result<WorkflowRow, DbError> {
        workflows::create_workflow(&self.pool, name, definition).await
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError> {
        workflows::get_workflow(&self.pool, id).await
    }

    async fn create_run(&self, new: NewRun) -> Result<RunRow, DbError> {
        runs::create_run(&self.pool, new).await
    }

    async fn get_run(&self, id: Uuid) -> Result<RunRow, DbError> {
        runs::get_run(&self.pool, id).await
    }

    async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<RunRow>, DbError> {
        runs::list_runs_by_status(&self.pool, status).await
    }

    async fn transition_run(
        &self,
        id: Uuid,
        from: &[RunStatus],
        to: RunTransition,
    ) -> Result<Option<RunRow>, DbError> {
        runs::transition_run(&self.pool, id, from, to).await
    }

    async fn list_runs_completed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<RunRow>, DbError> {
        runs::list_runs_completed_before(&self.pool, cutoff).await
    }

    async fn delete_run(&self, id: Uuid) -> Result<(), DbError> {
        runs::delete_run(&self.pool, id).await
    }

    async fn insert_task_if_absent(&self, new: NewTask) -> Result<Option<TaskRow>, DbError> {
        tasks::insert_task_if_absent(&self.pool, new).await
    }

    async fn get_task(&self, id: Uuid) -> Result<TaskRow, DbError> {
        tasks::get_task(&self.pool, id).await
    }

    async fn list_tasks_for_run(&self, run_id: Uuid) -> Result<Vec<TaskRow>, DbError> {
        tasks::list_tasks_for_run(&self.pool, run_id).await
    }

    async fn claim_task(&self, id: Uuid) -> Result<Option<TaskRow>, DbError> {
        tasks::claim_task(&self.pool, id).await
    }

    async fn complete_task(&self, id: Uuid, transition: TaskTransition) -> Result<Option<TaskRow>, DbError> {
        tasks::complete_task(&self.pool, id, transition).await
    }

    async fn cancel_task(&self, id: Uuid) -> Result<Option<TaskRow>, DbError> {
        tasks::cancel_task(&self.pool, id).await
    }

    async fn cancel_tasks_for_run(&self, run_id: Uuid) -> Result<Vec<TaskRow>, DbError> {
        tasks::cancel_tasks_for_run(&self.pool, run_id).await
    }

    async fn list_stale_tasks(&self, before: DateTime<Utc>) -> Result<Vec<TaskRow>, DbError> {
        tasks::list_stale_tasks(&self.pool, before).await
    }

    async fn touch_task(&self, id: Uuid) -> Result<(), DbError> {
        tasks::touch_task(&self.pool, id).await
    }

    async fn append_log(&self, new: NewTaskLog) -> Result<TaskLogRow, DbError> {
        logs::append_log(&self.pool, new).await
    }

    async fn list_logs_for_task(&self, task_id: Uuid) -> Result<Vec<TaskLogRow>, DbError> {
        logs::list_logs_for_task(&self.pool, task_id).await
    }

    async fn append_dead_letter(&self, new: NewDeadLetter) -> Result<DeadLetterRow, DbError> {
        dead_letters::append_dead_letter(&self.pool, new).await
    }

    async fn list_dead_letters_for_run(&self, run_id: Uuid) -> Result<Vec<DeadLetterRow>, DbError> {
        dead_letters::list_dead_letters_for_run(&self.pool, run_id).await
    }
}

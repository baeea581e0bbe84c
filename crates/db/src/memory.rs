//! In-process [`Store`] used by tests, demos and the `validate` command.
//!
//! All state sits behind one async mutex, so every method is trivially
//! atomic and the conditional writes behave like their SQL counterparts.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    DbError,
    models::{
        DeadLetterRow, NewDeadLetter, NewRun, NewTask, NewTaskLog, RunRow, RunStatus,
        RunTransition, TaskLogRow, TaskRow, TaskStatus, TaskTransition, WorkflowRow,
    },
    store::Store,
};

#[derive(Default)]
struct State {
    workflows: HashMap<Uuid, WorkflowRow>,
    runs: HashMap<Uuid, RunRow>,
    tasks: HashMap<Uuid, TaskRow>,
    /// idempotency key -> task id
    task_keys: HashMap<String, Uuid>,
    logs: Vec<TaskLogRow>,
    dead_letters: Vec<DeadLetterRow>,
    /// Remaining injected failures per operation.
    failures: HashMap<FailPoint, usize>,
}

impl State {
    fn take_failure(&mut self, point: FailPoint) -> Result<(), DbError> {
        match self.failures.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(DbError::Sqlx(sqlx::Error::PoolTimedOut))
            }
            _ => Ok(()),
        }
    }
}

/// Write operations [`MemoryStore::fail_next`] can make fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    AppendLog,
    AppendDeadLetter,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a task's `updated_at`.  Lets tests age a task without
    /// waiting in real time.
    pub async fn set_task_updated_at(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| DbError::not_found("task", id))?;
        task.updated_at = at;
        Ok(())
    }

    /// Overwrite a run's `completed_at`.
    pub async fn set_run_completed_at(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&id)
            .ok_or_else(|| DbError::not_found("run", id))?;
        run.completed_at = Some(at);
        Ok(())
    }

    /// Make the next `times` calls of `point` fail with a pool timeout.
    pub async fn fail_next(&self, point: FailPoint, times: usize) {
        self.state.lock().await.failures.insert(point, times);
    }

    /// Flip a workflow's `is_active` flag.
    pub async fn set_workflow_active(&self, id: Uuid, active: bool) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        let wf = state
            .workflows
            .get_mut(&id)
            .ok_or_else(|| DbError::not_found("workflow", id))?;
        wf.is_active = active;
        Ok(())
    }
}

fn sorted_by_creation<T, F>(mut rows: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    rows.sort_by_key(|r| key(r));
    rows
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_workflow(&self, name: &str, definition: serde_json::Value) -> Result<WorkflowRow, DbError> {
        let mut state = self.state.lock().await;
        let version = state
            .workflows
            .values()
            .filter(|w| w.name == name)
            .map(|w| w.version)
            .max()
            .unwrap_or(0)
            + 1;
        let row = WorkflowRow {
            id: Uuid::new_v4(),
            name: name.to_string(),
            version,
            definition,
            is_active: true,
            created_at: Utc::now(),
        };
        state.workflows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError> {
        let state = self.state.lock().await;
        state
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("workflow", id))
    }

    async fn create_run(&self, new: NewRun) -> Result<RunRow, DbError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let row = RunRow {
            id: Uuid::new_v4(),
            workflow_id: new.workflow_id,
            workflow_version: new.workflow_version,
            status: RunStatus::Pending,
            input: new.input,
            output: None,
            started_at: None,
            completed_at: None,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        };
        state.runs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_run(&self, id: Uuid) -> Result<RunRow, DbError> {
        let state = self.state.lock().await;
        state
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("run", id))
    }

    async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<RunRow>, DbError> {
        let state = self.state.lock().await;
        let rows = state.runs.values().filter(|r| r.status == status).cloned().collect();
        Ok(sorted_by_creation(rows, |r: &RunRow| r.created_at))
    }

    async fn transition_run(
        &self,
        id: Uuid,
        from: &[RunStatus],
        to: RunTransition,
    ) -> Result<Option<RunRow>, DbError> {
        let mut state = self.state.lock().await;
        let Some(run) = state.runs.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&run.status) {
            return Ok(None);
        }
        let now = Utc::now();
        if to.stamps_start() && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if to.stamps_completion() {
            run.completed_at = Some(now);
        }
        if let Some(output) = to.output {
            run.output = Some(output);
        }
        run.status = to.status;
        run.updated_at = now;
        Ok(Some(run.clone()))
    }

    async fn list_runs_completed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<RunRow>, DbError> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .values()
            .filter(|r| r.status.is_terminal() && r.completed_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect())
    }

    async fn delete_run(&self, id: Uuid) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        if state.runs.remove(&id).is_none() {
            return Err(DbError::not_found("run", id));
        }
        let doomed: Vec<(Uuid, String)> = state
            .tasks
            .values()
            .filter(|t| t.run_id == id)
            .map(|t| (t.id, t.idempotency_key.clone()))
            .collect();
        for (task_id, key) in doomed {
            state.tasks.remove(&task_id);
            state.task_keys.remove(&key);
        }
        state.logs.retain(|l| l.run_id != id);
        Ok(())
    }

    async fn insert_task_if_absent(&self, new: NewTask) -> Result<Option<TaskRow>, DbError> {
        let mut state = self.state.lock().await;
        let key = new.idempotency_key();
        if state.task_keys.contains_key(&key) {
            return Ok(None);
        }
        let now = Utc::now();
        let row = TaskRow {
            id: Uuid::new_v4(),
            run_id: new.run_id,
            workflow_id: new.workflow_id,
            node_id: new.node_id,
            status: TaskStatus::Pending,
            input: new.input,
            output: None,
            error: None,
            retry_count: 0,
            max_retries: new.max_retries,
            idempotency_key: key.clone(),
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        state.task_keys.insert(key, row.id);
        state.tasks.insert(row.id, row.clone());
        Ok(Some(row))
    }

    async fn get_task(&self, id: Uuid) -> Result<TaskRow, DbError> {
        let state = self.state.lock().await;
        state
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("task", id))
    }

    async fn list_tasks_for_run(&self, run_id: Uuid) -> Result<Vec<TaskRow>, DbError> {
        let state = self.state.lock().await;
        let rows = state.tasks.values().filter(|t| t.run_id == run_id).cloned().collect();
        Ok(sorted_by_creation(rows, |t: &TaskRow| t.created_at))
    }

    async fn claim_task(&self, id: Uuid) -> Result<Option<TaskRow>, DbError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(None);
        };
        if !task.status.is_claimable() {
            return Ok(None);
        }
        let now = Utc::now();
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn complete_task(&self, id: Uuid, transition: TaskTransition) -> Result<Option<TaskRow>, DbError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(None);
        };
        if task.status != TaskStatus::Running {
            return Ok(None);
        }
        let now = Utc::now();
        task.status = transition.status();
        match transition {
            TaskTransition::Succeeded { output } => {
                task.output = Some(output);
                task.completed_at = Some(now);
            }
            TaskTransition::Retrying { error, retry_count } => {
                task.error = Some(error);
                task.retry_count = retry_count;
            }
            TaskTransition::Failed { error } => {
                task.error = Some(error);
                task.completed_at = Some(now);
            }
        }
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn cancel_task(&self, id: Uuid) -> Result<Option<TaskRow>, DbError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(None);
        };
        if task.status.is_terminal() {
            return Ok(None);
        }
        let now = Utc::now();
        task.status = TaskStatus::Canceled;
        task.completed_at = Some(now);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn cancel_tasks_for_run(&self, run_id: Uuid) -> Result<Vec<TaskRow>, DbError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut canceled = Vec::new();
        for task in state.tasks.values_mut() {
            if task.run_id == run_id && !task.status.is_terminal() {
                task.status = TaskStatus::Canceled;
                task.completed_at = Some(now);
                task.updated_at = now;
                canceled.push(task.clone());
            }
        }
        Ok(sorted_by_creation(canceled, |t: &TaskRow| t.created_at))
    }

    async fn list_stale_tasks(&self, before: DateTime<Utc>) -> Result<Vec<TaskRow>, DbError> {
        let state = self.state.lock().await;
        let rows = state
            .tasks
            .values()
            .filter(|t| t.status.is_claimable() && t.updated_at < before)
            .filter(|t| {
                state
                    .runs
                    .get(&t.run_id)
                    .is_some_and(|r| r.status == RunStatus::Running)
            })
            .cloned()
            .collect();
        Ok(sorted_by_creation(rows, |t: &TaskRow| t.updated_at))
    }

    async fn touch_task(&self, id: Uuid) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        if let Some(task) = state.tasks.get_mut(&id) {
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn append_log(&self, new: NewTaskLog) -> Result<TaskLogRow, DbError> {
        let mut state = self.state.lock().await;
        state.take_failure(FailPoint::AppendLog)?;
        let row = TaskLogRow {
            id: Uuid::new_v4(),
            task_id: new.task_id,
            run_id: new.run_id,
            level: new.level.as_str().to_string(),
            message: new.message,
            metadata: new.metadata,
            created_at: Utc::now(),
        };
        state.logs.push(row.clone());
        Ok(row)
    }

    async fn list_logs_for_task(&self, task_id: Uuid) -> Result<Vec<TaskLogRow>, DbError> {
        let state = self.state.lock().await;
        Ok(state.logs.iter().filter(|l| l.task_id == task_id).cloned().collect())
    }

    async fn append_dead_letter(&self, new: NewDeadLetter) -> Result<DeadLetterRow, DbError> {
        let mut state = self.state.lock().await;
        state.take_failure(FailPoint::AppendDeadLetter)?;
        let row = DeadLetterRow {
            id: Uuid::new_v4(),
            run_id: new.run_id,
            workflow_id: new.workflow_id,
            node_id: new.node_id,
            input: new.input,
            error: new.error,
            retry_count: new.retry_count,
            max_retries: new.max_retries,
            created_at: Utc::now(),
        };
        state.dead_letters.push(row.clone());
        Ok(row)
    }

    async fn list_dead_letters_for_run(&self, run_id: Uuid) -> Result<Vec<DeadLetterRow>, DbError> {
        let state = self.state.lock().await;
        Ok(state
            .dead_letters
            .iter()
            .filter(|d| d.run_id == run_id)
            .cloned()
            .collect())
    }
}

//! Task dispatcher.
//!
//! `TaskDispatcher` pulls one task reference at a time, claims the task with
//! a conditional update, runs its handler and applies the result:
//! 1. success  -> SUCCESS, INFO log, downstream tasks, run completion check;
//! 2. retryable failure with budget left -> RETRY, WARN log, delayed entry;
//! 3. anything else -> FAILED, ERROR log, dead letter, run completion check.
//!
//! Handler failures never escape [`TaskDispatcher::dispatch`]; infrastructure
//! errors are recorded on the task and the loop keeps going.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use db::models::{LogLevel, NewDeadLetter, NewTaskLog, RunStatus, TaskRow, TaskStatus, TaskTransition};
use nodes::{ExecutableNode, ExecutionContext, NodeError};

use crate::{
    EngineContext, EngineError,
    completion::{close_run_if_complete, on_task_succeeded},
    notify::EngineEvent,
};

/// Slack between a handler's time budget and the hard timeout.
pub const HANDLER_GRACE: std::time::Duration = std::time::Duration::from_millis(250);

/// What `dispatch` did with a claimed task.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Succeeded,
    Retrying { retry_at: DateTime<Utc> },
    Failed { error: String },
    /// The run was no longer RUNNING, or another worker already moved the task.
    Skipped,
}

/// Node config overlaid by the task input.  Input keys win; a non-object
/// input is kept under `"input"`.
pub fn merge_input(config: &Value, input: &Value) -> Value {
    let mut merged = match config {
        Value::Object(fields) => fields.clone(),
        _ => Map::new(),
    };
    match input {
        Value::Object(fields) => {
            merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Value::Null => {}
        other => {
            merged.insert("input".into(), other.clone());
        }
    }
    Value::Object(merged)
}

#[derive(Clone)]
pub struct TaskDispatcher {
    ctx: EngineContext,
}

impl TaskDispatcher {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Pop references until one can be claimed.
    ///
    /// Falls back to one matured delayed entry when the ready list is empty.
    /// A reference whose claim matches no row is dropped.  On a store error
    /// the reference is pushed back before the error is returned.
    pub async fn claim_next(&self) -> Result<Option<TaskRow>, EngineError> {
        loop {
            let task_id = match self.ctx.queue.dequeue().await? {
                Some(msg) => msg.task_id,
                None => {
                    let now = self.ctx.clock.now();
                    match self.ctx.queue.take_matured(now, Some(1)).await?.pop() {
                        Some(msg) => msg.task_id,
                        None => return Ok(None),
                    }
                }
            };

            match self.ctx.store.claim_task(task_id).await {
                Ok(Some(task)) => {
                    debug!(%task_id, node_id = %task.node_id, "task claimed");
                    self.ctx.events.publish(EngineEvent::task(&task));
                    return Ok(Some(task));
                }
                Ok(None) => {
                    debug!(%task_id, "task already claimed, finished or canceled; dropping reference");
                }
                Err(err) => {
                    if let Err(queue_err) = self.ctx.queue.enqueue(task_id).await {
                        warn!(%task_id, error = %queue_err, "failed to requeue task after claim error");
                    }
                    return Err(err.into());
                }
            }
        }
    }

    /// Execute a claimed task and record the result.
    ///
    /// Only returns `Err` when even recording the failure was impossible.
    #[instrument(skip(self, task), fields(task_id = %task.id, run_id = %task.run_id, node_id = %task.node_id))]
    pub async fn dispatch(&self, task: TaskRow) -> Result<DispatchOutcome, EngineError> {
        match self.try_dispatch(&task).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(error = %err, "dispatch failed");
                self.fail_task(&task, err.to_string()).await
            }
        }
    }

    /// Claim and dispatch one task.  `None` when no work is queued.
    pub async fn process_next(&self) -> Result<Option<DispatchOutcome>, EngineError> {
        match self.claim_next().await? {
            Some(task) => Ok(Some(self.dispatch(task).await?)),
            None => Ok(None),
        }
    }

    /// Dispatch continuously until `shutdown` fires, waiting up to
    /// `poll_interval` whenever the queue is empty.
    pub async fn run(&self, shutdown: CancellationToken) {
        let poll = self.ctx.config.poll_interval;
        info!(poll_ms = poll.as_millis() as u64, "dispatcher started");
        while !shutdown.is_cancelled() {
            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.ctx.queue.wait_for_ready(poll) => {}
                    }
                }
                Err(err) => {
                    error!(error = %err, "dispatcher iteration failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            }
        }
        info!("dispatcher stopped");
    }

    async fn try_dispatch(&self, task: &TaskRow) -> Result<DispatchOutcome, EngineError> {
        let run = self.ctx.store.get_run(task.run_id).await?;
        if run.status != RunStatus::Running {
            if let Some(canceled) = self.ctx.store.cancel_task(task.id).await? {
                self.ctx.events.publish(EngineEvent::task(&canceled));
            }
            debug!(run_status = %run.status, "run not running; task canceled");
            return Ok(DispatchOutcome::Skipped);
        }

        let workflow = self.ctx.load_workflow(run.workflow_id).await?;
        let Some(node) = workflow.node(&task.node_id) else {
            let err = EngineError::UnknownNode {
                workflow_id: workflow.id,
                node_id: task.node_id.clone(),
            };
            return self.fail_task(task, err.to_string()).await;
        };
        let Some(handler) = self.ctx.registry.get(&node.node_type) else {
            let err = EngineError::UnknownNodeType(node.node_type.clone());
            return self.fail_task(task, err.to_string()).await;
        };

        let input = merge_input(&node.config, &task.input);
        let exec_ctx = ExecutionContext {
            task_id: task.id,
            run_id: task.run_id,
            workflow_id: task.workflow_id,
            node_id: task.node_id.clone(),
            retry_count: u32::try_from(task.retry_count).unwrap_or(0),
            max_retries: u32::try_from(task.max_retries).unwrap_or(0),
            time_budget: Some(self.ctx.config.handler_timeout),
        };

        debug!(node_type = %node.node_type, attempt = task.retry_count + 1, "executing handler");
        match self.invoke(handler, input, exec_ctx).await? {
            Ok(output) => self.succeed_task(task, output).await,
            Err(node_err) if node_err.is_retryable() && task.retry_count < task.max_retries => {
                let hint = match &node_err {
                    NodeError::Retryable { retry_after, .. } => *retry_after,
                    _ => None,
                };
                self.retry_task(task, node_err.message().to_string(), hint).await
            }
            Err(node_err) => {
                let message = if node_err.is_retryable() {
                    format!("{} (retries exhausted)", node_err.message())
                } else {
                    node_err.message().to_string()
                };
                self.fail_task(task, message).await
            }
        }
    }

    /// Run the handler on its own tokio task, bounded by `handler_timeout`
    /// plus [`HANDLER_GRACE`].  Handlers see `handler_timeout` as their time
    /// budget, so one that honours it reports its own failure first; the
    /// outer timeout only fires for handlers that ignore it and counts as
    /// retryable.  A panic is an infrastructure error.
    async fn invoke(
        &self,
        handler: Arc<dyn ExecutableNode>,
        input: Value,
        exec_ctx: ExecutionContext,
    ) -> Result<Result<Value, NodeError>, EngineError> {
        let timeout = self.ctx.config.handler_timeout;
        let hard_limit = timeout + HANDLER_GRACE;
        let handle = tokio::spawn(async move {
            tokio::time::timeout(hard_limit, handler.execute(input, &exec_ctx)).await
        });
        match handle.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_elapsed)) => Ok(Err(NodeError::retryable(format!(
                "handler timed out after {}ms",
                timeout.as_millis()
            )))),
            Err(join_err) => Err(EngineError::HandlerCrashed(join_err.to_string())),
        }
    }

    async fn succeed_task(&self, task: &TaskRow, output: Value) -> Result<DispatchOutcome, EngineError> {
        let transition = TaskTransition::Succeeded { output: output.clone() };
        let Some(done) = self.ctx.store.complete_task(task.id, transition).await? else {
            debug!("task no longer running; result discarded");
            return Ok(DispatchOutcome::Skipped);
        };
        info!("task succeeded");
        self.ctx.events.publish(EngineEvent::task(&done));

        self.append_log(
            NewTaskLog::new(&done, LogLevel::Info, "Task completed successfully")
                .with_metadata(json!({ "output": output })),
        )
        .await;
        if let Some(message) = output.get("logMessage").and_then(Value::as_str) {
            let level = output
                .get("level")
                .and_then(Value::as_str)
                .map(LogLevel::from_label)
                .unwrap_or(LogLevel::Info);
            self.append_log(NewTaskLog::new(&done, level, message)).await;
        }

        let created = on_task_succeeded(&self.ctx, &done).await?;
        if created == 0 {
            close_run_if_complete(&self.ctx, done.run_id).await?;
        }
        Ok(DispatchOutcome::Succeeded)
    }

    async fn retry_task(
        &self,
        task: &TaskRow,
        error: String,
        hint: Option<std::time::Duration>,
    ) -> Result<DispatchOutcome, EngineError> {
        let retry_count = u32::try_from(task.retry_count).unwrap_or(0);
        let delay = self.ctx.config.retry.delay_with_hint(retry_count, hint);
        let retry_at = self.ctx.clock.now()
            + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(30));

        let transition = TaskTransition::Retrying {
            error: error.clone(),
            retry_count: task.retry_count + 1,
        };
        let Some(retrying) = self.ctx.store.complete_task(task.id, transition).await? else {
            debug!("task no longer running; retry discarded");
            return Ok(DispatchOutcome::Skipped);
        };
        if let Err(err) = self.ctx.queue.schedule_retry(task.id, retry_at).await {
            warn!(error = %err, "failed to schedule retry; leaving it for stale-task recovery");
        }
        let delay_ms = delay.as_millis() as u64;
        warn!(retry_count = retrying.retry_count, delay_ms, %error, "task will be retried");
        self.ctx.events.publish(EngineEvent::task(&retrying));

        self.append_log(
            NewTaskLog::new(
                &retrying,
                LogLevel::Warn,
                format!(
                    "Task failed, retrying in {delay_ms}ms (attempt {}/{}): {error}",
                    retrying.retry_count, retrying.max_retries
                ),
            )
            .with_metadata(json!({ "error": error, "retryAt": retry_at.to_rfc3339() })),
        )
        .await;
        Ok(DispatchOutcome::Retrying { retry_at })
    }

    /// Mark the task FAILED and write its dead letter.
    ///
    /// When the FAILED update already happened on an earlier attempt whose
    /// dead-letter write did not land, the entry is written now.
    async fn fail_task(&self, task: &TaskRow, error: String) -> Result<DispatchOutcome, EngineError> {
        let transition = TaskTransition::Failed { error: error.clone() };
        let Some(failed) = self.ctx.store.complete_task(task.id, transition).await? else {
            let current = self.ctx.store.get_task(task.id).await?;
            if current.status == TaskStatus::Failed && !self.has_dead_letter(&current).await? {
                let recorded = current.error.clone().unwrap_or(error);
                self.ctx
                    .store
                    .append_dead_letter(NewDeadLetter::from_task(&current, recorded.clone()))
                    .await?;
                warn!("dead letter written for a task failed earlier");
                close_run_if_complete(&self.ctx, current.run_id).await?;
                return Ok(DispatchOutcome::Failed { error: recorded });
            }
            debug!("task no longer running; failure discarded");
            return Ok(DispatchOutcome::Skipped);
        };

        self.ctx
            .store
            .append_dead_letter(NewDeadLetter::from_task(&failed, error.clone()))
            .await?;
        error!(%error, retry_count = failed.retry_count, "task failed; moved to dead letters");
        self.ctx.events.publish(EngineEvent::task(&failed));

        self.append_log(
            NewTaskLog::new(&failed, LogLevel::Error, format!("Task failed: {error}"))
                .with_metadata(json!({ "error": error, "retryCount": failed.retry_count })),
        )
        .await;

        close_run_if_complete(&self.ctx, failed.run_id).await?;
        Ok(DispatchOutcome::Failed { error })
    }

    async fn has_dead_letter(&self, task: &TaskRow) -> Result<bool, EngineError> {
        let entries = self.ctx.store.list_dead_letters_for_run(task.run_id).await?;
        Ok(entries.iter().any(|d| d.node_id == task.node_id))
    }

    /// Task logs are an audit trail; a failed write never blocks the state
    /// machine.
    async fn append_log(&self, log: NewTaskLog) {
        let (task_id, level) = (log.task_id, log.level);
        if let Err(err) = self.ctx.store.append_log(log).await {
            warn!(%task_id, %level, error = %err, "failed to append task log");
        }
    }
}

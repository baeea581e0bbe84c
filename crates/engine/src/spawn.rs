//! Create-and-enqueue, shared by run start, the scheduler pass and
//! completion propagation.

use serde_json::Value;
use tracing::{debug, warn};

use db::models::{NewTask, RunRow, RunStatus, TaskRow};

use crate::{EngineContext, EngineError, models::NodeDefinition, notify::EngineEvent};

/// Create the task for `node` in `run` unless it already exists, then push
/// its reference onto the ready queue.
///
/// Returns `None` when another caller created the task first, or when the
/// run stopped RUNNING in the meantime (the fresh task is canceled then).
/// A failed enqueue is logged only: the task stays PENDING and stale-task
/// recovery re-enqueues it.
pub async fn spawn_task(
    ctx: &EngineContext,
    run: &RunRow,
    node: &NodeDefinition,
    input: Value,
) -> Result<Option<TaskRow>, EngineError> {
    let max_retries = node.max_retries.unwrap_or(ctx.config.retry.max_retries);
    let new = NewTask {
        run_id: run.id,
        workflow_id: run.workflow_id,
        node_id: node.id.clone(),
        input,
        max_retries: i32::try_from(max_retries).unwrap_or(i32::MAX),
    };

    let Some(task) = ctx.store.insert_task_if_absent(new).await? else {
        debug!(run_id = %run.id, node_id = %node.id, "task already exists; skipping");
        return Ok(None);
    };

    // A cancel may have landed between the readiness check and the insert.
    let current = ctx.store.get_run(run.id).await?;
    if current.status != RunStatus::Running {
        if let Some(canceled) = ctx.store.cancel_task(task.id).await? {
            ctx.events.publish(EngineEvent::task(&canceled));
        }
        debug!(run_id = %run.id, node_id = %node.id, status = %current.status, "run no longer running; task canceled");
        return Ok(None);
    }

    if let Err(err) = ctx.queue.enqueue(task.id).await {
        warn!(task_id = %task.id, error = %err, "failed to enqueue task; leaving it for stale-task recovery");
    }
    debug!(task_id = %task.id, run_id = %run.id, node_id = %node.id, "task created");
    ctx.events.publish(EngineEvent::task(&task));
    Ok(Some(task))
}

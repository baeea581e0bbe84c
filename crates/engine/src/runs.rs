//! Run boundaries: start a run from an active workflow, cancel a run, and
//! read a run back with its tasks.

use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use db::models::{NewRun, RunRow, RunStatus, RunTransition, TaskRow};

use crate::{
    EngineContext, EngineError,
    completion::close_run_if_complete,
    dag::validate_dag,
    notify::EngineEvent,
    spawn::spawn_task,
};

/// A run together with the tasks created for it so far.
#[derive(Debug, Clone, Serialize)]
pub struct RunDetails {
    #[serde(flatten)]
    pub run: RunRow,
    pub tasks: Vec<TaskRow>,
}

/// Create a run for `workflow_id`, move it to RUNNING and enqueue its root
/// tasks.
///
/// # Errors
/// - [`EngineError::NotFound`] if the workflow does not exist.
/// - [`EngineError::WorkflowInactive`] if the workflow is switched off.
/// - a validation error if the stored graph is not a valid DAG.
#[instrument(skip(ctx, input))]
pub async fn start_run(
    ctx: &EngineContext,
    workflow_id: Uuid,
    input: Value,
    created_by: Option<String>,
) -> Result<RunRow, EngineError> {
    let workflow = ctx.load_workflow(workflow_id).await?;
    if !workflow.is_active {
        return Err(EngineError::WorkflowInactive(workflow_id));
    }
    validate_dag(&workflow)?;

    let run = ctx
        .store
        .create_run(NewRun {
            workflow_id,
            workflow_version: workflow.version,
            input,
            created_by,
        })
        .await?;
    let Some(run) = ctx
        .store
        .transition_run(run.id, &[RunStatus::Pending], RunTransition::to(RunStatus::Running))
        .await?
    else {
        // canceled before it ever started
        return Ok(ctx.store.get_run(run.id).await?);
    };
    ctx.events.publish(EngineEvent::run(&run));

    let roots = workflow.root_nodes();
    for node in &roots {
        spawn_task(ctx, &run, node, run.input.clone()).await?;
    }
    info!(run_id = %run.id, workflow = %workflow.name, version = workflow.version, roots = roots.len(), "run started");

    if roots.is_empty() {
        close_run_if_complete(ctx, run.id).await?;
    }
    Ok(ctx.store.get_run(run.id).await?)
}

/// Cancel a PENDING or RUNNING run and every non-terminal task in it.
///
/// # Errors
/// - [`EngineError::NotFound`] if the run does not exist.
/// - [`EngineError::RunNotCancelable`] if the run already finished.
#[instrument(skip(ctx))]
pub async fn cancel_run(ctx: &EngineContext, run_id: Uuid) -> Result<RunRow, EngineError> {
    let transition = RunTransition::to(RunStatus::Canceled);
    let Some(run) = ctx
        .store
        .transition_run(run_id, &[RunStatus::Pending, RunStatus::Running], transition)
        .await?
    else {
        let current = ctx.store.get_run(run_id).await?;
        return Err(EngineError::RunNotCancelable {
            id: run_id,
            status: current.status.to_string(),
        });
    };
    ctx.events.publish(EngineEvent::run(&run));

    let canceled = ctx.store.cancel_tasks_for_run(run_id).await?;
    for task in &canceled {
        ctx.events.publish(EngineEvent::task(task));
    }
    info!(%run_id, canceled_tasks = canceled.len(), "run canceled");
    Ok(run)
}

pub async fn get_run_details(ctx: &EngineContext, run_id: Uuid) -> Result<RunDetails, EngineError> {
    let run = ctx.store.get_run(run_id).await?;
    let tasks = ctx.store.list_tasks_for_run(run_id).await?;
    Ok(RunDetails { run, tasks })
}

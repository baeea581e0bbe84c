//! What happens after a task reaches a terminal status: downstream tasks are
//! created, and the run is closed once nothing is left to do.

use std::collections::HashSet;

use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use db::models::{RunRow, RunStatus, RunTransition, TaskRow, TaskStatus};

use crate::{
    EngineContext, EngineError,
    dag::{is_ready, seed_input, tasks_by_node},
    models::Workflow,
    notify::EngineEvent,
    spawn::spawn_task,
};

/// Create tasks for dependents of `completed` whose predecessors have all
/// succeeded.  Returns the number of tasks created.
pub async fn on_task_succeeded(ctx: &EngineContext, completed: &TaskRow) -> Result<usize, EngineError> {
    let run = ctx.store.get_run(completed.run_id).await?;
    if run.status != RunStatus::Running {
        return Ok(0);
    }
    let workflow = ctx.load_workflow(run.workflow_id).await?;
    let tasks = ctx.store.list_tasks_for_run(run.id).await?;
    let index = tasks_by_node(&tasks);

    let mut created = 0;
    for dependent in workflow.dependents_of(&completed.node_id) {
        if !is_ready(&workflow, dependent, &index) {
            continue;
        }
        let Some(node) = workflow.node(dependent) else {
            continue;
        };
        let input = seed_input(&workflow, dependent, &run.input, &index);
        if spawn_task(ctx, &run, node, input).await?.is_some() {
            created += 1;
        }
    }
    Ok(created)
}

/// The run's final status given its tasks, or `None` while work remains.
///
/// FAILED once every task is terminal and one of them failed; SUCCESS once
/// every node has a task and all of them succeeded.
pub fn final_status(workflow: &Workflow, tasks: &[TaskRow]) -> Option<RunStatus> {
    if !tasks.iter().all(|t| t.status.is_terminal()) {
        return None;
    }
    if tasks.iter().any(|t| t.status == TaskStatus::Failed) {
        return Some(RunStatus::Failed);
    }
    let with_task: HashSet<&str> = tasks.iter().map(|t| t.node_id.as_str()).collect();
    let all_present = workflow.nodes.iter().all(|n| with_task.contains(n.id.as_str()));
    let all_succeeded = tasks.iter().all(|t| t.status == TaskStatus::Success);
    (all_present && all_succeeded).then_some(RunStatus::Success)
}

/// Outputs of the sink nodes, keyed by node id.
fn run_output(workflow: &Workflow, tasks: &[TaskRow]) -> Value {
    let index = tasks_by_node(tasks);
    let mut out = Map::new();
    for sink in workflow.sink_nodes() {
        if let Some(output) = index.get(sink.id.as_str()).and_then(|t| t.output.clone()) {
            out.insert(sink.id.clone(), output);
        }
    }
    Value::Object(out)
}

/// Move a RUNNING run to SUCCESS or FAILED when its tasks allow it.
pub async fn close_run_if_complete(ctx: &EngineContext, run_id: Uuid) -> Result<Option<RunRow>, EngineError> {
    let run = ctx.store.get_run(run_id).await?;
    if run.status != RunStatus::Running {
        return Ok(None);
    }
    let workflow = ctx.load_workflow(run.workflow_id).await?;
    let tasks = ctx.store.list_tasks_for_run(run_id).await?;

    let Some(status) = final_status(&workflow, &tasks) else {
        return Ok(None);
    };
    let transition = match status {
        RunStatus::Success => RunTransition::to(status).with_output(run_output(&workflow, &tasks)),
        _ => RunTransition::to(status),
    };

    match ctx.store.transition_run(run_id, &[RunStatus::Running], transition).await? {
        Some(closed) => {
            info!(%run_id, status = %closed.status, "run finished");
            ctx.events.publish(EngineEvent::run(&closed));
            Ok(Some(closed))
        }
        None => {
            debug!(%run_id, "run already closed by another worker");
            Ok(None)
        }
    }
}

//! Workflow registration.

use serde_json::Value;
use tracing::{info, instrument, warn};

use db::models::WorkflowRow;

use crate::{EngineContext, EngineError, Workflow, WorkflowDefinition, dag::validate_dag};

/// Parse a `{ "nodes": [...], "edges": [...] }` document and check that it
/// forms a DAG.  Returns the workflow and its topological order.
pub fn parse_workflow(name: &str, definition: Value) -> Result<(Workflow, Vec<String>), EngineError> {
    let parsed = WorkflowDefinition::from_json(definition)?;
    let workflow = Workflow::new(name, parsed.nodes, parsed.edges);
    let order = validate_dag(&workflow)?;
    Ok((workflow, order))
}

/// Validate `definition` and store it as the next version of `name`.
///
/// Node types without a registered handler are accepted with a warning;
/// their tasks fail when dispatched.
#[instrument(skip(ctx, definition))]
pub async fn register_workflow(
    ctx: &EngineContext,
    name: &str,
    definition: Value,
) -> Result<WorkflowRow, EngineError> {
    let (workflow, _) = parse_workflow(name, definition)?;
    for node in &workflow.nodes {
        if ctx.registry.get(&node.node_type).is_none() {
            warn!(node_id = %node.id, node_type = %node.node_type, "no handler registered for node type");
        }
    }

    let row = ctx
        .store
        .insert_workflow(name, workflow.definition().to_json()?)
        .await?;
    info!(workflow_id = %row.id, version = row.version, nodes = workflow.nodes.len(), "workflow registered");
    Ok(row)
}

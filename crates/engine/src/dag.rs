//! DAG validation and readiness.
//!
//! Rules enforced by [`validate_dag`]:
//! 1. Node IDs must be unique within the workflow.
//! 2. Every edge must reference valid node IDs (both `source` and `target`).
//! 3. The directed graph must be acyclic (topological sort must succeed).
//!
//! Readiness is computed from the tasks that already exist for a run: a node
//! is ready when it has no task yet and every predecessor's task is SUCCESS.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::{Map, Value};

use db::models::{TaskRow, TaskStatus};

use crate::{EngineError, models::{NodeDefinition, Workflow}};

/// Validate the workflow's DAG and return nodes in topological execution order.
///
/// # Errors
/// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
/// - [`EngineError::UnknownNodeReference`] if an edge references a missing node.
/// - [`EngineError::CycleDetected`] if the graph is not acyclic.
pub fn validate_dag(workflow: &Workflow) -> Result<Vec<String>, EngineError> {
    // -----------------------------------------------------------------------
    // 1. Ensure node IDs are unique
    // -----------------------------------------------------------------------
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for node in &workflow.nodes {
        if !seen_ids.insert(node.id.as_str()) {
            return Err(EngineError::DuplicateNodeId(node.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate edge endpoints
    // -----------------------------------------------------------------------
    for edge in &workflow.edges {
        if !seen_ids.contains(edge.source.as_str()) {
            return Err(EngineError::UnknownNodeReference {
                node_id: edge.source.clone(),
                side: "source",
            });
        }
        if !seen_ids.contains(edge.target.as_str()) {
            return Err(EngineError::UnknownNodeReference {
                node_id: edge.target.clone(),
                side: "target",
            });
        }
    }

    // -----------------------------------------------------------------------
    // 3. Topological sort (Kahn's algorithm)
    // -----------------------------------------------------------------------
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();

    for node in &workflow.nodes {
        adjacency.entry(node.id.as_str()).or_default();
        in_degree.entry(node.id.as_str()).or_insert(0);
    }

    for edge in &workflow.edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
        *in_degree.entry(edge.target.as_str()).or_insert(0) += 1;
    }

    // Seed in declaration order so the result is deterministic.
    let mut queue: VecDeque<&str> = workflow
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    let mut sorted: Vec<String> = Vec::with_capacity(workflow.nodes.len());

    while let Some(node_id) = queue.pop_front() {
        sorted.push(node_id.to_owned());

        if let Some(neighbours) = adjacency.get(node_id) {
            for &neighbour in neighbours {
                let deg = in_degree.entry(neighbour).or_insert(0);
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(neighbour);
                }
            }
        }
    }

    // If we didn't visit every node the graph contains a cycle.
    if sorted.len() != workflow.nodes.len() {
        return Err(EngineError::CycleDetected);
    }

    Ok(sorted)
}

/// Index a run's tasks by node id.
pub fn tasks_by_node(tasks: &[TaskRow]) -> HashMap<&str, &TaskRow> {
    tasks.iter().map(|t| (t.node_id.as_str(), t)).collect()
}

/// Every predecessor of `node_id` has a SUCCESS task.
pub fn dependencies_satisfied(
    workflow: &Workflow,
    node_id: &str,
    tasks: &HashMap<&str, &TaskRow>,
) -> bool {
    workflow.dependencies_of(node_id).into_iter().all(|dep| {
        tasks
            .get(dep)
            .is_some_and(|t| t.status == TaskStatus::Success)
    })
}

/// `node_id` has no task yet and its dependencies are satisfied.
pub fn is_ready(workflow: &Workflow, node_id: &str, tasks: &HashMap<&str, &TaskRow>) -> bool {
    !tasks.contains_key(node_id) && dependencies_satisfied(workflow, node_id, tasks)
}

/// The ready set, in node declaration order.
pub fn ready_nodes<'w>(workflow: &'w Workflow, tasks: &[TaskRow]) -> Vec<&'w NodeDefinition> {
    let index = tasks_by_node(tasks);
    workflow
        .nodes
        .iter()
        .filter(|n| is_ready(workflow, &n.id, &index))
        .collect()
}

/// Input for a newly ready node, derived from its predecessors' outputs.
///
/// - no predecessors: the run input;
/// - one predecessor: its output;
/// - several: object outputs shallow-merged in edge order (a later edge wins
///   on a key conflict), non-object outputs stored under the predecessor id.
///
/// Falls back to the run input when no predecessor produced an output.
pub fn seed_input(
    workflow: &Workflow,
    node_id: &str,
    run_input: &Value,
    tasks: &HashMap<&str, &TaskRow>,
) -> Value {
    let mut deps = workflow.dependencies_of(node_id);
    let mut seen = HashSet::new();
    deps.retain(|d| seen.insert(*d));

    let outputs: Vec<(&str, &Value)> = deps
        .iter()
        .filter_map(|dep| {
            tasks
                .get(dep)
                .and_then(|t| t.output.as_ref())
                .filter(|v| !v.is_null())
                .map(|v| (*dep, v))
        })
        .collect();

    match (deps.len(), outputs.as_slice()) {
        (_, []) => run_input.clone(),
        (1, [(_, output)]) => (*output).clone(),
        _ => {
            let mut merged = Map::new();
            for (dep, output) in &outputs {
                match *output {
                    Value::Object(fields) => {
                        merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                    other => {
                        merged.insert(dep.to_string(), other.clone());
                    }
                }
            }
            Value::Object(merged)
        }
    }
}

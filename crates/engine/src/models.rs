//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow looks like
//! in memory.  The graph half ([`WorkflowDefinition`]) is what gets
//! serialised into the JSONB `definition` column of the `workflows` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use db::models::WorkflowRow;

use crate::EngineError;

// ---------------------------------------------------------------------------
// NodeDefinition
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique identifier within this workflow (referenced by edges).
    pub id: String,
    /// Maps to a handler registered in the `NodeRegistry`.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Static configuration; overlaid by the task input at dispatch time.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Per-node retry budget; the engine default applies when absent.
    #[serde(default, rename = "maxRetries", skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// Directed edge: `target` depends on `source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// The stored graph: `{ "nodes": [...], "edges": [...] }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowDefinition {
    pub fn to_json(&self) -> Result<serde_json::Value, EngineError> {
        serde_json::to_value(self).map_err(|e| EngineError::InvalidDefinition(e.to_string()))
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, EngineError> {
        serde_json::from_value(value).map_err(|e| EngineError::InvalidDefinition(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// One immutable version of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    /// Ordered as declared.
    pub nodes: Vec<NodeDefinition>,
    pub edges: Vec<Edge>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, nodes: Vec<NodeDefinition>, edges: Vec<Edge>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: 1,
            nodes,
            edges,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    pub fn definition(&self) -> WorkflowDefinition {
        WorkflowDefinition {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Predecessors of `node_id`, in edge declaration order.
    pub fn dependencies_of(&self, node_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.target == node_id)
            .map(|e| e.source.as_str())
            .collect()
    }

    /// Successors of `node_id`, deduplicated, in edge declaration order.
    pub fn dependents_of(&self, node_id: &str) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for edge in self.edges.iter().filter(|e| e.source == node_id) {
            if !out.contains(&edge.target.as_str()) {
                out.push(edge.target.as_str());
            }
        }
        out
    }

    /// Nodes with no incoming edge.
    pub fn root_nodes(&self) -> Vec<&NodeDefinition> {
        self.nodes
            .iter()
            .filter(|n| !self.edges.iter().any(|e| e.target == n.id))
            .collect()
    }

    /// Nodes with no outgoing edge.
    pub fn sink_nodes(&self) -> Vec<&NodeDefinition> {
        self.nodes
            .iter()
            .filter(|n| !self.edges.iter().any(|e| e.source == n.id))
            .collect()
    }
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = EngineError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        let definition: WorkflowDefinition = serde_json::from_value(row.definition)
            .map_err(|e| EngineError::InvalidDefinition(format!("workflow {}: {e}", row.id)))?;
        Ok(Self {
            id: row.id,
            name: row.name,
            version: row.version,
            nodes: definition.nodes,
            edges: definition.edges,
            is_active: row.is_active,
            created_at: row.created_at,
        })
    }
}

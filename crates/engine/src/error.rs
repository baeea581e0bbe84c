//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the workflow.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    /// Topological sort detected a cycle.
    #[error("workflow graph contains a cycle")]
    CycleDetected,

    /// The stored definition does not parse as a workflow graph.
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    // ------ Execution errors ------

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("workflow {0} is not active")]
    WorkflowInactive(Uuid),

    /// A node's `type` has no registered handler.
    #[error("no handler registered for node type '{0}'")]
    UnknownNodeType(String),

    #[error("node '{node_id}' is not part of workflow {workflow_id}")]
    UnknownNode { workflow_id: Uuid, node_id: String },

    /// Cancel was requested for a run that already finished.
    #[error("run {id} is already {status} and cannot be canceled")]
    RunNotCancelable { id: Uuid, status: String },

    /// The handler task panicked or was aborted.
    #[error("handler crashed: {0}")]
    HandlerCrashed(String),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(db::DbError),

    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),
}

impl From<db::DbError> for EngineError {
    fn from(err: db::DbError) -> Self {
        match err {
            db::DbError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Database(other),
        }
    }
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Graph-shape problems the caller can fix by editing the definition.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateNodeId(_)
                | Self::UnknownNodeReference { .. }
                | Self::CycleDetected
                | Self::InvalidDefinition(_)
        )
    }
}

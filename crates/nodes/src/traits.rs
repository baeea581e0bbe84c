//! The `ExecutableNode` trait: the contract every node must fulfil.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::NodeError;

/// Identity and retry position of the task being executed.
///
/// Defined here (in the nodes crate) so both the engine and individual node
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub node_id: String,
    /// Retries already spent before this attempt.
    pub retry_count: u32,
    pub max_retries: u32,
    /// Wall-clock time the dispatcher grants this attempt.  Handlers with
    /// their own timeouts should stay within it so they can classify the
    /// failure themselves.
    pub time_budget: Option<Duration>,
}

impl ExecutionContext {
    /// `true` once no further retry will be granted after this attempt.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// The core node trait.
///
/// Built-in node types and anything registered by embedding code implement
/// this; the dispatcher never needs to know the concrete type.
#[async_trait]
pub trait ExecutableNode: Send + Sync {
    /// Execute the node.  `input` is the node's static config overlaid by the
    /// task input (output of the upstream node(s) or the run input).
    async fn execute(
        &self,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, NodeError>;
}

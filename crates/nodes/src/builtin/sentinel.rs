//! `start` / `end`: DAG sentinels with no side effects.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};

use crate::{ExecutableNode, NodeError, traits::ExecutionContext};

/// Passes `input` through, adding a message, a timestamp and a completion
/// marker.  Keys already present in `input` are kept as they are.
fn pass_through(input: Value, message: &str) -> Value {
    let mut out = Map::new();
    out.insert("message".into(), json!(message));
    out.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
    out.insert("completed".into(), json!(true));
    match input {
        Value::Object(fields) => out.extend(fields),
        Value::Null => {}
        other => {
            out.insert("input".into(), other);
        }
    }
    Value::Object(out)
}

pub struct StartNode;

#[async_trait]
impl ExecutableNode for StartNode {
    async fn execute(&self, input: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        Ok(pass_through(input, "Workflow started successfully"))
    }
}

pub struct EndNode;

#[async_trait]
impl ExecutableNode for EndNode {
    async fn execute(&self, input: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        Ok(pass_through(input, "Workflow completed successfully"))
    }
}

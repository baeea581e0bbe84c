//! `echo`: writes a leveled message to the log and returns it.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use crate::{ExecutableNode, NodeError, traits::ExecutionContext};

const DEFAULT_MESSAGE: &str = "Echo task executed";

pub struct EchoNode;

#[async_trait]
impl ExecutableNode for EchoNode {
    async fn execute(&self, input: Value, ctx: &ExecutionContext) -> Result<Value, NodeError> {
        let mut fields = match input {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".into(), other);
                map
            }
        };

        let message = match fields.remove("message") {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => DEFAULT_MESSAGE.to_string(),
        };
        let level = match fields.remove("level") {
            Some(Value::String(s)) => normalize_level(&s),
            _ => "info",
        };

        let mut log_message = format!("[{}] {}", level.to_uppercase(), message);
        let input_data = (!fields.is_empty()).then(|| Value::Object(fields));
        if let Some(data) = &input_data {
            let pretty = serde_json::to_string_pretty(data).unwrap_or_default();
            log_message.push_str("\nData from previous task: ");
            log_message.push_str(&pretty);
        }

        let node_id = ctx.node_id.as_str();
        match level {
            "debug" => debug!(node_id, "{log_message}"),
            "warn" => warn!(node_id, "{log_message}"),
            "error" => error!(node_id, "{log_message}"),
            _ => info!(node_id, "{log_message}"),
        }

        let mut out = json!({
            "message": message,
            "level": level.to_uppercase(),
            "timestamp": Utc::now().to_rfc3339(),
            "logMessage": log_message,
        });
        if let (Some(obj), Some(data)) = (out.as_object_mut(), input_data) {
            obj.insert("inputData".into(), data);
        }
        Ok(out)
    }
}

/// Case-insensitive level; anything unrecognised is `info`.
fn normalize_level(raw: &str) -> &'static str {
    match raw.to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            task_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            node_id: "say".into(),
            retry_count: 0,
            max_retries: 3,
            time_budget: None,
        }
    }

    #[tokio::test]
    async fn defaults_when_config_is_empty() {
        let out = EchoNode.execute(json!({}), &ctx()).await.unwrap();
        assert_eq!(out["message"], DEFAULT_MESSAGE);
        assert_eq!(out["level"], "INFO");
        assert_eq!(out["logMessage"], "[INFO] Echo task executed");
        assert!(out.get("inputData").is_none());
    }

    #[tokio::test]
    async fn upstream_data_is_echoed() {
        let out = EchoNode
            .execute(json!({"message": "hi", "level": "WARN", "count": 2}), &ctx())
            .await
            .unwrap();
        assert_eq!(out["level"], "WARN");
        assert_eq!(out["inputData"], json!({"count": 2}));
        let log = out["logMessage"].as_str().unwrap();
        assert!(log.starts_with("[WARN] hi\nData from previous task:"));
    }

    #[test]
    fn unknown_level_is_info() {
        assert_eq!(normalize_level("verbose"), "info");
        assert_eq!(normalize_level("Error"), "error");
    }
}

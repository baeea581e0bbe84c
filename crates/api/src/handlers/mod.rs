use axum::Json;
use serde_json::{Value, json};

pub mod runs;
pub mod scheduler;
pub mod tasks;
pub mod workflows;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

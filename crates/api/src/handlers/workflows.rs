use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{ApiError, AppState};
use db::models::WorkflowRow;

#[derive(Deserialize)]
pub struct CreateWorkflowDto {
    pub name: String,
    pub definition: Value,
}

pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkflowDto>,
) -> Result<(StatusCode, Json<WorkflowRow>), ApiError> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest("workflow name must not be empty".into()));
    }
    let row = engine::register_workflow(&state.ctx, &payload.name, payload.definition).await?;
    Ok((StatusCode::CREATED, Json(row)))
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<WorkflowRow>, ApiError> {
    Ok(Json(state.ctx.store.get_workflow(id).await?))
}

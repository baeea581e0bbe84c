use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{ApiError, AppState};
use db::models::RunRow;
use engine::RunDetails;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunDto {
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// An empty body starts the run with `{}` as input.
pub async fn start(
    Path(workflow_id): Path<Uuid>,
    State(state): State<AppState>,
    payload: Option<Json<StartRunDto>>,
) -> Result<(StatusCode, Json<RunRow>), ApiError> {
    let dto = payload.map(|Json(dto)| dto).unwrap_or_default();
    let input = dto.input.unwrap_or_else(|| Value::Object(Default::default()));
    let run = engine::start_run(&state.ctx, workflow_id, input, dto.created_by).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<RunDetails>, ApiError> {
    Ok(Json(engine::get_run_details(&state.ctx, id).await?))
}

pub async fn cancel(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<RunRow>, ApiError> {
    Ok(Json(engine::cancel_run(&state.ctx, id).await?))
}

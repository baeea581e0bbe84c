use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::{ApiError, AppState};
use db::models::TaskLogRow;
use engine::DispatchOutcome;

const DEFAULT_BATCH: usize = 10;
const MAX_BATCH: usize = 100;

pub async fn logs(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Vec<TaskLogRow>>, ApiError> {
    // 404 for an unknown task rather than an empty list
    state.ctx.store.get_task(id).await?;
    Ok(Json(state.ctx.store.list_logs_for_task(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ProcessParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessReport {
    pub processed: usize,
    pub succeeded: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ProcessReport {
    fn record(&mut self, outcome: &DispatchOutcome) {
        self.processed += 1;
        match outcome {
            DispatchOutcome::Succeeded => self.succeeded += 1,
            DispatchOutcome::Retrying { .. } => self.retrying += 1,
            DispatchOutcome::Failed { .. } => self.failed += 1,
            DispatchOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Dispatch up to `limit` queued tasks (default 10) in this request.
pub async fn process(
    State(state): State<AppState>,
    Query(params): Query<ProcessParams>,
) -> Result<Json<ProcessReport>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_BATCH).min(MAX_BATCH);
    let mut report = ProcessReport::default();
    for _ in 0..limit {
        match state.dispatcher.process_next().await {
            Ok(Some(outcome)) => report.record(&outcome),
            Ok(None) => break,
            // keep what was already processed
            Err(err) if report.processed > 0 => {
                error!(error = %err, "dispatch failed mid-batch");
                break;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(Json(report))
}

use axum::{Json, extract::State};

use crate::AppState;
use engine::SchedulerReport;

/// One retry-promotion, scheduling and stale-recovery pass.
pub async fn process(State(state): State<AppState>) -> Json<SchedulerReport> {
    Json(state.scheduler.run_once().await)
}

//! Maps engine and store errors onto HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use db::DbError;
use engine::EngineError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{0}")]
    BadRequest(String),
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        Self::Engine(err.into())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Engine(err) if err.is_not_found() => StatusCode::NOT_FOUND,
            Self::Engine(err) if err.is_validation() => StatusCode::BAD_REQUEST,
            Self::Engine(EngineError::WorkflowInactive(_)) => StatusCode::BAD_REQUEST,
            Self::Engine(EngineError::RunNotCancelable { .. }) => StatusCode::CONFLICT,
            Self::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn engine_errors_map_to_statuses() {
        let id = Uuid::new_v4();
        let cases = [
            (ApiError::from(DbError::not_found("run", id)), StatusCode::NOT_FOUND),
            (EngineError::CycleDetected.into(), StatusCode::BAD_REQUEST),
            (EngineError::WorkflowInactive(id).into(), StatusCode::BAD_REQUEST),
            (
                EngineError::RunNotCancelable { id, status: "SUCCESS".into() }.into(),
                StatusCode::CONFLICT,
            ),
            (EngineError::HandlerCrashed("boom".into()).into(), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status(), expected, "{err}");
        }
    }
}

//! `api` crate: HTTP surface over the engine.
//!
//! Routes:
//!   GET    /health
//!   POST   /api/v1/workflows
//!   GET    /api/v1/workflows/:id
//!   POST   /api/v1/workflows/:id/runs
//!   GET    /api/v1/runs/:id
//!   DELETE /api/v1/runs/:id
//!   GET    /api/v1/tasks/:id/logs
//!   POST   /api/v1/tasks/process
//!   POST   /api/v1/scheduler/process

pub mod error;
pub mod handlers;

use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use engine::{DependencyScheduler, EngineContext, TaskDispatcher};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub ctx: EngineContext,
    pub scheduler: DependencyScheduler,
    pub dispatcher: TaskDispatcher,
}

impl AppState {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            scheduler: DependencyScheduler::new(ctx.clone()),
            dispatcher: TaskDispatcher::new(ctx.clone()),
            ctx,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/workflows", post(handlers::workflows::create))
        .route("/workflows/:id", get(handlers::workflows::get))
        .route("/workflows/:id/runs", post(handlers::runs::start))
        .route("/runs/:id", get(handlers::runs::get).delete(handlers::runs::cancel))
        .route("/tasks/:id/logs", get(handlers::tasks::logs))
        .route("/tasks/process", post(handlers::tasks::process))
        .route("/scheduler/process", post(handlers::scheduler::process));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` fires.
pub async fn serve(addr: SocketAddr, ctx: EngineContext, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "api listening");

    axum::serve(listener, router(AppState::new(ctx)))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("api stopped");
    Ok(())
}

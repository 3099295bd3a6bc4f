//! HTTP surface of the worker: ingest, session prompts, search, timeline,
//! context, agent lifecycle, and operational endpoints, all under `/api` on
//! a loopback port.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

use anyhow::Result;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", routes::api_router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` fires. New connections stop first; the caller
/// then cancels the supervisors and closes the store.
pub async fn serve(state: AppState, addr: &str, shutdown: CancellationToken) -> Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr, "claude-mem worker listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

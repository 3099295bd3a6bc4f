pub mod agents;
pub mod ingest;
pub mod ops;
pub mod search;

use axum::Router;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .merge(ingest::router())
        .merge(search::router())
        .nest("/agents", agents::router())
        .merge(ops::router())
}

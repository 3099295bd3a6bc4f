//! Liveness, readiness, and the metrics rollup.

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use claude_mem_schema::epoch_millis_now;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

const HOUR_MILLIS: i64 = 60 * 60 * 1_000;
const DAY_MILLIS: i64 = 24 * HOUR_MILLIS;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/readiness", get(readiness))
        .route("/metrics", get(metrics))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let migrations = state.readiness.migrations_complete.load(Ordering::SeqCst);
    let configured = state.readiness.provider_configured.load(Ordering::SeqCst);
    let reachable = state.readiness.provider_reachable.load(Ordering::SeqCst);
    // The provider leg only gates readiness when one is configured.
    let ready = migrations && (reachable || !configured);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "ready": ready,
            "migrationsComplete": migrations,
            "providerConfigured": configured,
            "providerReachable": reachable,
        })),
    )
}

async fn metrics(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let now = epoch_millis_now();
    let agents = state.store.agent_metrics(now).await?;
    let aliases = state.store.alias_metrics().await?;
    let observations = state.store.observation_metrics().await?;
    let failed_1h = state
        .store
        .count_audit_actions_since("agent.verify.failure", now - HOUR_MILLIS)
        .await?;
    let lockouts_24h = state
        .store
        .count_audit_actions_since("agent.lockout", now - DAY_MILLIS)
        .await?;
    let active_sessions = state.sessions.active_session_count().await;

    Ok(Json(json!({
        "agents": agents,
        "auth": {
            "failed_1h": failed_1h,
            "lockouts_24h": lockouts_24h,
        },
        "aliases": aliases,
        "observations": observations,
        "sessions": { "active": active_sessions },
    })))
}

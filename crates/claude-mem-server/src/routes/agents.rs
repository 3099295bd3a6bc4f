//! Agent lifecycle endpoints. Register and verify are rate limited per
//! source; me/rotate/revoke require a bearer key.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use claude_mem_schema::AgentRecord;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{require_agent, source_key};
use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/verify", post(verify))
        .route("/me", get(me))
        .route("/rotate-key", post(rotate_key))
        .route("/revoke", post(revoke))
}

fn agent_json(agent: &AgentRecord) -> Value {
    json!({
        "id": agent.id,
        "department": agent.department,
        "permissions": agent.permissions,
        "apiKeyPrefix": agent.api_key_prefix,
        "createdAtEpoch": agent.created_at_epoch,
        "lastSeenAtEpoch": agent.last_seen_at_epoch,
        "expiresAtEpoch": agent.expires_at_epoch,
        "verified": agent.verified,
        "spawnedBy": agent.spawned_by,
        "role": agent.role,
    })
}

async fn check_rate(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let key = source_key(headers);
    if !state.rate_limiter.check(&key).await {
        return Err(ApiError::rate_limited("too many requests"));
    }
    Ok(key)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
    id: String,
    #[serde(default)]
    department: Option<String>,
    #[serde(default)]
    permissions: Option<String>,
    #[serde(default)]
    spawned_by: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegisterBody>,
) -> Result<Json<Value>, ApiError> {
    let ip = check_rate(&state, &headers).await?;
    let outcome = state
        .registry
        .register(
            &body.id,
            body.department.as_deref().unwrap_or("default"),
            body.permissions.as_deref().unwrap_or("read,write"),
            body.spawned_by.as_deref(),
            body.role.as_deref(),
            Some(&ip),
        )
        .await?;
    Ok(Json(json!({
        "agent": agent_json(&outcome.agent),
        "created": outcome.created,
        "apiKey": outcome.api_key,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyBody {
    id: String,
    api_key: String,
}

async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<VerifyBody>,
) -> Result<Json<Value>, ApiError> {
    let ip = check_rate(&state, &headers).await?;
    let agent = state
        .registry
        .verify(&body.id, &body.api_key, Some(&ip))
        .await?;
    Ok(Json(json!({ "agent": agent_json(&agent) })))
}

async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ip = source_key(&headers);
    let agent = require_agent(&state, &headers, Some(&ip)).await?;
    Ok(Json(json!({ "agent": agent_json(&agent) })))
}

async fn rotate_key(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ip = source_key(&headers);
    let agent = require_agent(&state, &headers, Some(&ip)).await?;
    let (refreshed, api_key) = state.registry.rotate(&agent.id, Some(&ip)).await?;
    Ok(Json(json!({
        "agent": agent_json(&refreshed),
        "apiKey": api_key,
    })))
}

async fn revoke(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ip = source_key(&headers);
    let agent = require_agent(&state, &headers, Some(&ip)).await?;
    state.registry.revoke(&agent.id, Some(&ip)).await?;
    Ok(Json(json!({ "revoked": agent.id })))
}

//! Read surface: search, observation fetch, timeline, and the session-start
//! context block.

use std::path::PathBuf;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use claude_mem_core::{project, SearchRequest, TimelineAnchor, TimelineEntry};
use claude_mem_schema::ObservationType;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{maybe_agent, source_key};
use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/search", get(search))
        .route("/get_observations", get(get_observations))
        .route("/timeline", get(timeline))
        .route("/context", get(context))
}

fn split_csv(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    concepts: Option<String>,
    #[serde(default)]
    files: Option<String>,
    #[serde(default)]
    from: Option<i64>,
    #[serde(default)]
    to: Option<i64>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>, ApiError> {
    let ip = source_key(&headers);
    let agent = maybe_agent(&state, &headers, Some(&ip)).await?;

    let mut kinds = Vec::new();
    for raw in split_csv(&params.kind) {
        match ObservationType::parse(&raw) {
            Some(kind) => kinds.push(kind),
            None => {
                return Err(ApiError::bad_request(format!(
                    "unknown observation type: {raw}"
                )))
            }
        }
    }

    let request = SearchRequest {
        query: params.query,
        project: params.project,
        kinds,
        concepts: split_csv(&params.concepts),
        file_substring: params.files,
        from_epoch: params.from,
        to_epoch: params.to,
        limit: params.limit.unwrap_or(20),
    };
    let results = state.search.search(&request, agent.as_ref()).await?;
    Ok(Json(json!({
        "count": results.len(),
        "results": results,
    })))
}

#[derive(Deserialize)]
struct GetObservationsParams {
    ids: String,
}

async fn get_observations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<GetObservationsParams>,
) -> Result<Json<Value>, ApiError> {
    let ip = source_key(&headers);
    let agent = maybe_agent(&state, &headers, Some(&ip)).await?;
    let ids: Vec<i64> = params
        .ids
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| ApiError::bad_request(format!("bad observation id: {s}")))
        })
        .collect::<Result<_, _>>()?;
    let results = state
        .search
        .observations_by_ids(ids, agent.as_ref())
        .await?;
    Ok(Json(json!({ "results": results })))
}

#[derive(Deserialize)]
struct TimelineParams {
    around: i64,
    #[serde(default)]
    before: Option<usize>,
    #[serde(default)]
    after: Option<usize>,
    #[serde(default)]
    project: Option<String>,
}

async fn timeline(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<TimelineParams>,
) -> Result<Json<Value>, ApiError> {
    let ip = source_key(&headers);
    let agent = maybe_agent(&state, &headers, Some(&ip)).await?;

    // `around` accepts either an observation row id or a raw epoch; row ids
    // win when both interpretations are possible.
    let anchor = match state.store.observation(params.around).await? {
        Some(_) => TimelineAnchor::ObservationId(params.around),
        None => TimelineAnchor::Epoch(params.around),
    };
    let entries = state
        .search
        .timeline(
            anchor,
            params.before.unwrap_or(5),
            params.after.unwrap_or(5),
            params.project.as_deref(),
            agent.as_ref(),
        )
        .await?;

    let entries: Vec<Value> = entries
        .into_iter()
        .map(|entry| match entry {
            TimelineEntry::Observation(o) => json!({ "kind": "observation", "data": o }),
            TimelineEntry::Summary(s) => json!({ "kind": "summary", "data": s }),
            TimelineEntry::Prompt(p) => json!({ "kind": "prompt", "data": p }),
        })
        .collect();
    Ok(Json(json!({ "entries": entries })))
}

#[derive(Deserialize)]
struct ContextParams {
    cwd: String,
}

async fn context(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ContextParams>,
) -> Result<Json<Value>, ApiError> {
    let ip = source_key(&headers);
    let agent = maybe_agent(&state, &headers, Some(&ip)).await?;

    let path = PathBuf::from(&params.cwd);
    let identity = project::resolve_project(&path, &state.settings.git_remote_order);
    project::register_project_alias(&state.store, &path, &identity).await;

    let mode = state.active_mode();
    let block = state
        .search
        .context_block(
            &identity,
            &mode,
            state.settings.context_observations,
            state.settings.context_summaries,
            agent.as_ref(),
        )
        .await?;
    Ok(Json(json!({ "project": identity, "context": block })))
}

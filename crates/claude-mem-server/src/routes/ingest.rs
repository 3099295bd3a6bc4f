//! Ingest and session-prompt endpoints. Ingest is ack-on-enqueue: the hook
//! gets its `202` as soon as the message is durably queued, and processing
//! failures surface only in metrics and logs.

use std::path::PathBuf;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use claude_mem_core::project;
use claude_mem_schema::{epoch_millis_now, MessageType, NewPendingMessage};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ingest/observation", post(ingest_observation))
        .route("/ingest/summarize", post(ingest_summarize))
        .route("/session/prompt", post(session_prompt))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObservationBody {
    content_session_id: String,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    tool_name: String,
    #[serde(default)]
    tool_input: Option<Value>,
    #[serde(default)]
    tool_response: Option<Value>,
    #[serde(default)]
    prompt_number: Option<i64>,
    #[serde(default)]
    bead_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummarizeBody {
    content_session_id: String,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    last_assistant_message: String,
    #[serde(default)]
    last_user_message: Option<String>,
    #[serde(default)]
    prompt_number: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptBody {
    content_session_id: String,
    prompt_text: String,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    sender_id: Option<String>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
}

/// Resolve the project for a request: explicit value first, then the git
/// remote of `cwd`, then the directory basename.
async fn resolve_project(
    state: &AppState,
    explicit: Option<&str>,
    cwd: Option<&str>,
) -> String {
    if let Some(project) = explicit.filter(|p| !p.is_empty()) {
        return project.to_string();
    }
    let Some(cwd) = cwd.filter(|c| !c.is_empty()) else {
        return project::UNKNOWN_PROJECT.to_string();
    };
    let path = PathBuf::from(cwd);
    let identity = project::resolve_project(&path, &state.settings.git_remote_order);
    project::register_project_alias(&state.store, &path, &identity).await;
    identity
}

fn serialize_payload(value: Option<Value>) -> Option<String> {
    value.map(|v| match v {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

async fn ingest_observation(
    State(state): State<AppState>,
    Json(body): Json<ObservationBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if state
        .settings
        .skip_tools
        .iter()
        .any(|t| t == &body.tool_name)
    {
        debug!(tool = %body.tool_name, "tool on skip list, acknowledging without enqueue");
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "pendingMessageId": null, "skipped": true })),
        ));
    }

    let now = epoch_millis_now();
    let project = resolve_project(&state, body.project.as_deref(), body.cwd.as_deref()).await;
    let session = state
        .store
        .create_session_if_absent(&body.content_session_id, &project, None, now)
        .await?;

    let pending_id = state
        .store
        .enqueue_pending(
            NewPendingMessage {
                session_db_id: session.id,
                content_session_id: body.content_session_id.clone(),
                message_type: MessageType::Observation,
                tool_name: Some(body.tool_name),
                tool_input: serialize_payload(body.tool_input),
                tool_response: serialize_payload(body.tool_response),
                cwd: body.cwd,
                last_user_message: None,
                last_assistant_message: None,
                prompt_number: body.prompt_number,
                bead_id: body.bead_id,
            },
            now,
        )
        .await?;
    state.sessions.ensure_task_and_notify(&session).await;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "pendingMessageId": pending_id })),
    ))
}

async fn ingest_summarize(
    State(state): State<AppState>,
    Json(body): Json<SummarizeBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let now = epoch_millis_now();
    let project = resolve_project(&state, body.project.as_deref(), body.cwd.as_deref()).await;
    let session = state
        .store
        .create_session_if_absent(&body.content_session_id, &project, None, now)
        .await?;

    let pending_id = state
        .store
        .enqueue_pending(
            NewPendingMessage {
                session_db_id: session.id,
                content_session_id: body.content_session_id.clone(),
                message_type: MessageType::Summarize,
                tool_name: None,
                tool_input: None,
                tool_response: None,
                cwd: body.cwd,
                last_user_message: body.last_user_message,
                last_assistant_message: Some(body.last_assistant_message),
                prompt_number: body.prompt_number,
                bead_id: None,
            },
            now,
        )
        .await?;
    state.sessions.ensure_task_and_notify(&session).await;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "pendingMessageId": pending_id })),
    ))
}

async fn session_prompt(
    State(state): State<AppState>,
    _headers: HeaderMap,
    Json(body): Json<PromptBody>,
) -> Result<Json<Value>, ApiError> {
    let now = epoch_millis_now();
    if state
        .store
        .session_by_content_id(&body.content_session_id)
        .await?
        .is_none()
    {
        // Prompts can land before the first tool event; create the session
        // when the hook told us where it runs.
        if body.project.is_some() || body.cwd.is_some() {
            let project =
                resolve_project(&state, body.project.as_deref(), body.cwd.as_deref()).await;
            state
                .store
                .create_session_if_absent(
                    &body.content_session_id,
                    &project,
                    Some(&body.prompt_text),
                    now,
                )
                .await?;
        }
    }

    let prompt = state
        .store
        .append_user_prompt(
            &body.content_session_id,
            &body.prompt_text,
            body.agent_id.as_deref(),
            body.sender_id.as_deref(),
            now,
        )
        .await?;

    if let Some(session) = state
        .store
        .session_by_content_id(&body.content_session_id)
        .await?
    {
        if let Err(e) = state.vector_sync.sync_prompt(&prompt, &session.project).await {
            tracing::warn!(prompt = prompt.id, error = %e, "prompt vector sync failed");
        }
    }

    Ok(Json(json!({
        "promptId": prompt.id,
        "promptNumber": prompt.prompt_number,
    })))
}

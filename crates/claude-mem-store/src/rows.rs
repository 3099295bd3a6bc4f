//! Row-to-struct mappers shared by the query modules.

use claude_mem_schema::{
    AgentRecord, AuditLogEntry, MessageType, Observation, ObservationType, PendingMessage,
    PendingStatus, SessionRow, SessionStatus, SessionSummary, UserPromptRow, Visibility,
};
use rusqlite::Row;

fn bad_enum(column: &'static str, value: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unexpected {column}: {value}").into(),
    )
}

pub(crate) fn json_list(raw: String) -> Vec<String> {
    serde_json::from_str(&raw).unwrap_or_default()
}

pub(crate) fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    let status_raw: String = row.get("status")?;
    Ok(SessionRow {
        id: row.get("id")?,
        content_session_id: row.get("content_session_id")?,
        memory_session_id: row.get("memory_session_id")?,
        project: row.get("project")?,
        user_prompt: row.get("user_prompt")?,
        started_at_epoch: row.get("started_at_epoch")?,
        completed_at_epoch: row.get("completed_at_epoch")?,
        status: SessionStatus::parse(&status_raw).ok_or_else(|| bad_enum("status", status_raw))?,
        prompt_counter: row.get("prompt_counter")?,
    })
}

pub(crate) fn row_to_prompt(row: &Row<'_>) -> rusqlite::Result<UserPromptRow> {
    Ok(UserPromptRow {
        id: row.get("id")?,
        content_session_id: row.get("content_session_id")?,
        prompt_number: row.get("prompt_number")?,
        prompt_text: row.get("prompt_text")?,
        agent_id: row.get("agent_id")?,
        sender_id: row.get("sender_id")?,
        created_at_epoch: row.get("created_at_epoch")?,
    })
}

pub(crate) fn row_to_pending(row: &Row<'_>) -> rusqlite::Result<PendingMessage> {
    let type_raw: String = row.get("message_type")?;
    let status_raw: String = row.get("status")?;
    Ok(PendingMessage {
        id: row.get("id")?,
        session_db_id: row.get("session_db_id")?,
        content_session_id: row.get("content_session_id")?,
        message_type: MessageType::parse(&type_raw)
            .ok_or_else(|| bad_enum("message_type", type_raw))?,
        tool_name: row.get("tool_name")?,
        tool_input: row.get("tool_input")?,
        tool_response: row.get("tool_response")?,
        cwd: row.get("cwd")?,
        last_user_message: row.get("last_user_message")?,
        last_assistant_message: row.get("last_assistant_message")?,
        prompt_number: row.get("prompt_number")?,
        bead_id: row.get("bead_id")?,
        status: PendingStatus::parse(&status_raw).ok_or_else(|| bad_enum("status", status_raw))?,
        retry_count: row.get("retry_count")?,
        error: row.get("error")?,
        created_at_epoch: row.get("created_at_epoch")?,
        started_processing_at_epoch: row.get("started_processing_at_epoch")?,
        completed_at_epoch: row.get("completed_at_epoch")?,
        failed_at_epoch: row.get("failed_at_epoch")?,
    })
}

pub(crate) fn row_to_observation(row: &Row<'_>) -> rusqlite::Result<Observation> {
    let kind_raw: String = row.get("kind")?;
    let visibility_raw: String = row.get("visibility")?;
    Ok(Observation {
        id: row.get("id")?,
        memory_session_id: row.get("memory_session_id")?,
        project: row.get("project")?,
        kind: ObservationType::parse(&kind_raw).ok_or_else(|| bad_enum("kind", kind_raw))?,
        title: row.get("title")?,
        subtitle: row.get("subtitle")?,
        narrative: row.get("narrative")?,
        text: row.get("text")?,
        facts: json_list(row.get("facts")?),
        concepts: json_list(row.get("concepts")?),
        files_read: json_list(row.get("files_read")?),
        files_modified: json_list(row.get("files_modified")?),
        prompt_number: row.get("prompt_number")?,
        discovery_tokens: row.get("discovery_tokens")?,
        bead_id: row.get("bead_id")?,
        agent: row.get("agent")?,
        department: row.get("department")?,
        visibility: Visibility::parse(&visibility_raw)
            .ok_or_else(|| bad_enum("visibility", visibility_raw))?,
        created_at_epoch: row.get("created_at_epoch")?,
    })
}

pub(crate) fn row_to_summary(row: &Row<'_>) -> rusqlite::Result<SessionSummary> {
    let visibility_raw: String = row.get("visibility")?;
    Ok(SessionSummary {
        id: row.get("id")?,
        memory_session_id: row.get("memory_session_id")?,
        project: row.get("project")?,
        request: row.get("request")?,
        investigated: row.get("investigated")?,
        learned: row.get("learned")?,
        completed: row.get("completed")?,
        next_steps: row.get("next_steps")?,
        notes: row.get("notes")?,
        prompt_number: row.get("prompt_number")?,
        agent: row.get("agent")?,
        department: row.get("department")?,
        visibility: Visibility::parse(&visibility_raw)
            .ok_or_else(|| bad_enum("visibility", visibility_raw))?,
        created_at_epoch: row.get("created_at_epoch")?,
    })
}

pub(crate) fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<AgentRecord> {
    Ok(AgentRecord {
        id: row.get("id")?,
        department: row.get("department")?,
        permissions: row.get("permissions")?,
        api_key_prefix: row.get("api_key_prefix")?,
        api_key_hash: row.get("api_key_hash")?,
        created_at_epoch: row.get("created_at_epoch")?,
        last_seen_at_epoch: row.get("last_seen_at_epoch")?,
        expires_at_epoch: row.get("expires_at_epoch")?,
        verified: row.get::<_, i64>("verified")? != 0,
        revoked: row.get::<_, i64>("revoked")? != 0,
        failed_attempts: row.get("failed_attempts")?,
        locked_until_epoch: row.get("locked_until_epoch")?,
        spawned_by: row.get("spawned_by")?,
        bead_id: row.get("bead_id")?,
        role: row.get("role")?,
    })
}

pub(crate) fn row_to_audit(row: &Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    Ok(AuditLogEntry {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        action: row.get("action")?,
        resource_type: row.get("resource_type")?,
        resource_id: row.get("resource_id")?,
        details: row.get("details")?,
        ip_address: row.get("ip_address")?,
        created_at_epoch: row.get("created_at_epoch")?,
    })
}

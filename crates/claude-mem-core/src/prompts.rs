//! Prompt construction for the session supervisor, driven by the active
//! mode's templates.

use claude_mem_schema::modes::{render_template, Mode};
use claude_mem_schema::{PendingMessage, SessionRow};

pub fn init_prompt(mode: &Mode, session: &SessionRow) -> String {
    render_template(
        &mode.prompts.init,
        &[
            ("project", session.project.as_str()),
            ("user_prompt", session.user_prompt.as_deref().unwrap_or("")),
            (
                "observation_types",
                &mode.observation_types.join(", "),
            ),
            ("concepts", &mode.concepts.join(", ")),
        ],
    )
}

pub fn continuation_prompt(mode: &Mode, session: &SessionRow, last_prompt_number: i64) -> String {
    render_template(
        &mode.prompts.continuation,
        &[
            ("project", session.project.as_str()),
            ("prompt_number", &last_prompt_number.to_string()),
        ],
    )
}

pub fn message_prompt(mode: &Mode, message: &PendingMessage) -> String {
    match message.message_type {
        claude_mem_schema::MessageType::Observation => render_template(
            &mode.prompts.observation,
            &[
                ("tool_name", message.tool_name.as_deref().unwrap_or("unknown")),
                ("tool_input", message.tool_input.as_deref().unwrap_or("{}")),
                (
                    "tool_response",
                    message.tool_response.as_deref().unwrap_or(""),
                ),
                ("cwd", message.cwd.as_deref().unwrap_or("")),
                (
                    "last_user_message",
                    message.last_user_message.as_deref().unwrap_or(""),
                ),
            ],
        ),
        claude_mem_schema::MessageType::Summarize => render_template(
            &mode.prompts.summarize,
            &[
                (
                    "last_assistant_message",
                    message.last_assistant_message.as_deref().unwrap_or(""),
                ),
                (
                    "last_user_message",
                    message.last_user_message.as_deref().unwrap_or(""),
                ),
            ],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claude_mem_schema::{MessageType, PendingStatus, SessionStatus};

    fn session() -> SessionRow {
        SessionRow {
            id: 1,
            content_session_id: "s1".into(),
            memory_session_id: None,
            project: "github.com/u/r".into(),
            user_prompt: Some("fix the tests".into()),
            started_at_epoch: 1,
            completed_at_epoch: None,
            status: SessionStatus::Active,
            prompt_counter: 0,
        }
    }

    fn message(message_type: MessageType) -> PendingMessage {
        PendingMessage {
            id: 1,
            session_db_id: 1,
            content_session_id: "s1".into(),
            message_type,
            tool_name: Some("Read".into()),
            tool_input: Some(r#"{"file_path":"/a.ts"}"#.into()),
            tool_response: Some("contents".into()),
            cwd: Some("/repo".into()),
            last_user_message: None,
            last_assistant_message: Some("all done".into()),
            prompt_number: Some(1),
            bead_id: None,
            status: PendingStatus::Processing,
            retry_count: 0,
            error: None,
            created_at_epoch: 1,
            started_processing_at_epoch: Some(2),
            completed_at_epoch: None,
            failed_at_epoch: None,
        }
    }

    #[test]
    fn init_prompt_carries_project_and_request() {
        let prompt = init_prompt(&Mode::default(), &session());
        assert!(prompt.contains("github.com/u/r"));
        assert!(prompt.contains("fix the tests"));
    }

    #[test]
    fn observation_prompt_embeds_tool_data() {
        let prompt = message_prompt(&Mode::default(), &message(MessageType::Observation));
        assert!(prompt.contains("Read"));
        assert!(prompt.contains("/a.ts"));
        assert!(prompt.contains("contents"));
    }

    #[test]
    fn summarize_prompt_embeds_last_assistant_message() {
        let prompt = message_prompt(&Mode::default(), &message(MessageType::Summarize));
        assert!(prompt.contains("all done"));
        assert!(prompt.contains("<summary>"));
    }
}

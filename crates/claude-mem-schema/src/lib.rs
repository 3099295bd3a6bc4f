pub mod modes;
pub mod settings;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch. All persisted timestamps use this.
pub fn epoch_millis_now() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationType {
    Decision,
    Bugfix,
    Feature,
    Refactor,
    Discovery,
    Change,
}

impl ObservationType {
    pub const ALL: [ObservationType; 6] = [
        ObservationType::Decision,
        ObservationType::Bugfix,
        ObservationType::Feature,
        ObservationType::Refactor,
        ObservationType::Discovery,
        ObservationType::Change,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationType::Decision => "decision",
            ObservationType::Bugfix => "bugfix",
            ObservationType::Feature => "feature",
            ObservationType::Refactor => "refactor",
            ObservationType::Discovery => "discovery",
            ObservationType::Change => "change",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

/// Access tier for an observation or summary row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Department,
    Project,
    Public,
}

impl Visibility {
    pub const ALL: [Visibility; 4] = [
        Visibility::Private,
        Visibility::Department,
        Visibility::Project,
        Visibility::Public,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Department => "department",
            Visibility::Project => "project",
            Visibility::Public => "public",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.as_str() == s)
    }
}

impl Default for Visibility {
    fn default() -> Self {
        Visibility::Project
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Observation,
    Summarize,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Observation => "observation",
            MessageType::Summarize => "summarize",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "observation" => Some(MessageType::Observation),
            "summarize" => Some(MessageType::Summarize),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Processing => "processing",
            PendingStatus::Processed => "processed",
            PendingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PendingStatus::Pending),
            "processing" => Some(PendingStatus::Processing),
            "processed" => Some(PendingStatus::Processed),
            "failed" => Some(PendingStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }
}

/// One coding-assistant conversation bound to a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: i64,
    pub content_session_id: String,
    /// The memory agent's own conversation id, assigned after the first
    /// successful LLM round-trip.
    pub memory_session_id: Option<String>,
    pub project: String,
    pub user_prompt: Option<String>,
    pub started_at_epoch: i64,
    pub completed_at_epoch: Option<i64>,
    pub status: SessionStatus,
    pub prompt_counter: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPromptRow {
    pub id: i64,
    pub content_session_id: String,
    pub prompt_number: i64,
    pub prompt_text: String,
    pub agent_id: Option<String>,
    pub sender_id: Option<String>,
    pub created_at_epoch: i64,
}

/// A durable unit of work awaiting LLM processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMessage {
    pub id: i64,
    pub session_db_id: i64,
    pub content_session_id: String,
    pub message_type: MessageType,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub tool_response: Option<String>,
    pub cwd: Option<String>,
    pub last_user_message: Option<String>,
    pub last_assistant_message: Option<String>,
    pub prompt_number: Option<i64>,
    pub bead_id: Option<String>,
    pub status: PendingStatus,
    pub retry_count: i64,
    pub error: Option<String>,
    pub created_at_epoch: i64,
    pub started_processing_at_epoch: Option<i64>,
    pub completed_at_epoch: Option<i64>,
    pub failed_at_epoch: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPendingMessage {
    pub session_db_id: i64,
    pub content_session_id: String,
    pub message_type: MessageType,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub tool_response: Option<String>,
    pub cwd: Option<String>,
    pub last_user_message: Option<String>,
    pub last_assistant_message: Option<String>,
    pub prompt_number: Option<i64>,
    pub bead_id: Option<String>,
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Observation
    }
}

/// A compressed fact or decision extracted from one tool-use event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: i64,
    pub memory_session_id: String,
    pub project: String,
    #[serde(rename = "type")]
    pub kind: ObservationType,
    pub title: String,
    pub subtitle: Option<String>,
    pub narrative: Option<String>,
    /// Pre-structured body kept for rows written by old builds.
    pub text: Option<String>,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub prompt_number: Option<i64>,
    pub discovery_tokens: i64,
    pub bead_id: Option<String>,
    pub agent: String,
    pub department: String,
    pub visibility: Visibility,
    pub created_at_epoch: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewObservation {
    pub memory_session_id: String,
    pub project: String,
    #[serde(rename = "type")]
    pub kind: ObservationType,
    pub title: String,
    pub subtitle: Option<String>,
    pub narrative: Option<String>,
    pub text: Option<String>,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub prompt_number: Option<i64>,
    pub discovery_tokens: i64,
    pub bead_id: Option<String>,
    pub agent: String,
    pub department: String,
    pub visibility: Visibility,
    pub created_at_epoch: i64,
}

impl NewObservation {
    /// A minimal observation carrying the multi-agent defaults.
    pub fn basic(
        memory_session_id: impl Into<String>,
        project: impl Into<String>,
        kind: ObservationType,
        title: impl Into<String>,
        created_at_epoch: i64,
    ) -> Self {
        Self {
            memory_session_id: memory_session_id.into(),
            project: project.into(),
            kind,
            title: title.into(),
            subtitle: None,
            narrative: None,
            text: None,
            facts: Vec::new(),
            concepts: Vec::new(),
            files_read: Vec::new(),
            files_modified: Vec::new(),
            prompt_number: None,
            discovery_tokens: 0,
            bead_id: None,
            agent: "legacy".to_string(),
            department: "default".to_string(),
            visibility: Visibility::Project,
            created_at_epoch,
        }
    }
}

/// A session-level rollup. Sessions may accumulate several of these as
/// periodic checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: i64,
    pub memory_session_id: String,
    pub project: String,
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub notes: Option<String>,
    pub prompt_number: Option<i64>,
    pub agent: String,
    pub department: String,
    pub visibility: Visibility,
    pub created_at_epoch: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSessionSummary {
    pub memory_session_id: String,
    pub project: String,
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub notes: Option<String>,
    pub prompt_number: Option<i64>,
    pub agent: String,
    pub department: String,
    pub visibility: Visibility,
    pub created_at_epoch: i64,
}

/// An identity allowed to read from (and write to) the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// `name@host` form.
    pub id: String,
    pub department: String,
    /// Comma-free permission string containing `read` and/or `write`.
    pub permissions: String,
    pub api_key_prefix: String,
    pub api_key_hash: String,
    pub created_at_epoch: i64,
    pub last_seen_at_epoch: Option<i64>,
    pub expires_at_epoch: Option<i64>,
    pub verified: bool,
    pub revoked: bool,
    pub failed_attempts: i64,
    pub locked_until_epoch: Option<i64>,
    pub spawned_by: Option<String>,
    pub bead_id: Option<String>,
    pub role: Option<String>,
}

impl AgentRecord {
    pub fn is_locked(&self, now_epoch: i64) -> bool {
        self.locked_until_epoch.is_some_and(|until| until > now_epoch)
    }

    pub fn is_expired(&self, now_epoch: i64) -> bool {
        self.expires_at_epoch.is_some_and(|at| at <= now_epoch)
    }

    pub fn can_write(&self) -> bool {
        self.permissions.contains("write")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub agent_id: String,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub details: Option<String>,
    pub ip_address: Option<String>,
    pub created_at_epoch: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(ChatRole::User),
            "assistant" => Some(ChatRole::Assistant),
            _ => None,
        }
    }
}

/// One turn of the memory agent's conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_type_round_trips_through_strings() {
        for t in ObservationType::ALL {
            assert_eq!(ObservationType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ObservationType::parse("opinion"), None);
    }

    #[test]
    fn visibility_parse_rejects_unknown_values() {
        assert_eq!(Visibility::parse("project"), Some(Visibility::Project));
        assert_eq!(Visibility::parse("everyone"), None);
        assert_eq!(Visibility::default(), Visibility::Project);
    }

    #[test]
    fn observation_serde_uses_lowercase_type_tag() {
        let obs = NewObservation::basic("mem-1", "github.com/u/r", ObservationType::Bugfix, "T", 1);
        let json = serde_json::to_value(&obs).unwrap();
        assert_eq!(json["type"], "bugfix");
        assert_eq!(json["visibility"], "project");
        assert_eq!(json["agent"], "legacy");
        assert_eq!(json["department"], "default");
    }

    #[test]
    fn agent_lock_and_expiry_checks() {
        let mut agent = AgentRecord {
            id: "alice@laptop".into(),
            department: "eng".into(),
            permissions: "read,write".into(),
            api_key_prefix: "cm_abcdefghi".into(),
            api_key_hash: "deadbeef".into(),
            created_at_epoch: 1_000,
            last_seen_at_epoch: None,
            expires_at_epoch: Some(5_000),
            verified: true,
            revoked: false,
            failed_attempts: 0,
            locked_until_epoch: Some(2_000),
            spawned_by: None,
            bead_id: None,
            role: None,
        };
        assert!(agent.is_locked(1_500));
        assert!(!agent.is_locked(2_000));
        assert!(!agent.is_expired(4_999));
        assert!(agent.is_expired(5_000));
        assert!(agent.can_write());
        agent.permissions = "read".into();
        assert!(!agent.can_write());
    }

    #[test]
    fn pending_status_parse_covers_machine_states() {
        for s in ["pending", "processing", "processed", "failed"] {
            assert!(PendingStatus::parse(s).is_some());
        }
        assert!(PendingStatus::parse("queued").is_none());
    }

    #[test]
    fn chat_message_constructors_set_roles() {
        assert_eq!(ChatMessage::user("hi").role, ChatRole::User);
        assert_eq!(ChatMessage::assistant("ok").role, ChatRole::Assistant);
    }
}

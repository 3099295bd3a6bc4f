//! Session, user-prompt, and conversation-history operations.

use claude_mem_schema::{ChatMessage, ChatRole, SessionRow, SessionStatus, UserPromptRow};
use rusqlite::{params, OptionalExtension};

use crate::rows::{row_to_prompt, row_to_session};
use crate::{Store, StoreError};

const SESSION_COLS: &str = "id, content_session_id, memory_session_id, project, user_prompt, \
     started_at_epoch, completed_at_epoch, status, prompt_counter";

const PROMPT_COLS: &str = "id, content_session_id, prompt_number, prompt_text, agent_id, \
     sender_id, created_at_epoch";

impl Store {
    /// Get the session for `content_session_id`, creating it if this is the
    /// first event seen for that id.
    pub async fn create_session_if_absent(
        &self,
        content_session_id: &str,
        project: &str,
        user_prompt: Option<&str>,
        now_epoch: i64,
    ) -> Result<SessionRow, StoreError> {
        let content_session_id = content_session_id.to_owned();
        let project = project.to_owned();
        let user_prompt = user_prompt.map(str::to_owned);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (content_session_id, project, user_prompt, started_at_epoch)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(content_session_id) DO NOTHING",
                params![content_session_id, project, user_prompt, now_epoch],
            )?;
            let session = conn.query_row(
                &format!("SELECT {SESSION_COLS} FROM sessions WHERE content_session_id = ?1"),
                params![content_session_id],
                row_to_session,
            )?;
            Ok(session)
        })
        .await
    }

    pub async fn session_by_content_id(
        &self,
        content_session_id: &str,
    ) -> Result<Option<SessionRow>, StoreError> {
        let content_session_id = content_session_id.to_owned();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {SESSION_COLS} FROM sessions WHERE content_session_id = ?1"),
                    params![content_session_id],
                    row_to_session,
                )
                .optional()?)
        })
        .await
    }

    pub async fn session_by_db_id(&self, id: i64) -> Result<Option<SessionRow>, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"),
                    params![id],
                    row_to_session,
                )
                .optional()?)
        })
        .await
    }

    /// Record the memory agent's conversation id once the first LLM
    /// round-trip assigns one.
    pub async fn set_memory_session_id(
        &self,
        session_db_id: i64,
        memory_session_id: &str,
    ) -> Result<(), StoreError> {
        let memory_session_id = memory_session_id.to_owned();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE sessions SET memory_session_id = ?1
                 WHERE id = ?2 AND memory_session_id IS NULL",
                params![memory_session_id, session_db_id],
            )?;
            if updated == 0 {
                // Either the session is gone or the id was already assigned;
                // the latter is fine on supervisor restart.
                let exists: bool = conn.query_row(
                    "SELECT COUNT(*) > 0 FROM sessions WHERE id = ?1",
                    params![session_db_id],
                    |r| r.get(0),
                )?;
                if !exists {
                    return Err(StoreError::NotFound(format!("session {session_db_id}")));
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn update_session_status(
        &self,
        session_db_id: i64,
        status: SessionStatus,
        completed_at_epoch: Option<i64>,
    ) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE sessions SET status = ?1, completed_at_epoch = ?2 WHERE id = ?3",
                params![status.as_str(), completed_at_epoch, session_db_id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("session {session_db_id}")));
            }
            Ok(())
        })
        .await
    }

    /// Persist a user prompt, assigning the next prompt number from the
    /// session's counter in the same transaction.
    pub async fn append_user_prompt(
        &self,
        content_session_id: &str,
        prompt_text: &str,
        agent_id: Option<&str>,
        sender_id: Option<&str>,
        now_epoch: i64,
    ) -> Result<UserPromptRow, StoreError> {
        let content_session_id = content_session_id.to_owned();
        let prompt_text = prompt_text.to_owned();
        let agent_id = agent_id.map(str::to_owned);
        let sender_id = sender_id.map(str::to_owned);
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let prompt_number: i64 = tx
                .query_row(
                    "UPDATE sessions SET prompt_counter = prompt_counter + 1
                     WHERE content_session_id = ?1
                     RETURNING prompt_counter",
                    params![content_session_id],
                    |r| r.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("session {content_session_id}")))?;
            tx.execute(
                "INSERT INTO user_prompts
                    (content_session_id, prompt_number, prompt_text, agent_id, sender_id,
                     created_at_epoch)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    content_session_id,
                    prompt_number,
                    prompt_text,
                    agent_id,
                    sender_id,
                    now_epoch
                ],
            )?;
            let prompt_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO user_prompts_fts (prompt_text, prompt_id, content_session_id)
                 VALUES (?1, ?2, ?3)",
                params![prompt_text, prompt_id, content_session_id],
            )?;
            tx.commit()?;
            Ok(UserPromptRow {
                id: prompt_id,
                content_session_id,
                prompt_number,
                prompt_text,
                agent_id,
                sender_id,
                created_at_epoch: now_epoch,
            })
        })
        .await
    }

    pub async fn count_prompts(&self, content_session_id: &str) -> Result<i64, StoreError> {
        let content_session_id = content_session_id.to_owned();
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM user_prompts WHERE content_session_id = ?1",
                params![content_session_id],
                |r| r.get(0),
            )?)
        })
        .await
    }

    /// Full-text search over prompt text, newest first.
    pub async fn search_prompts(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<UserPromptRow>, StoreError> {
        let query = query.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT p.{} FROM user_prompts_fts f
                 JOIN user_prompts p ON p.id = f.prompt_id
                 WHERE user_prompts_fts MATCH ?1
                 ORDER BY p.created_at_epoch DESC
                 LIMIT ?2",
                PROMPT_COLS.replace(", ", ", p.")
            ))?;
            let rows = stmt.query_map(params![query, limit as i64], row_to_prompt)?;
            let mut prompts = Vec::new();
            for row in rows {
                prompts.push(row?);
            }
            Ok(prompts)
        })
        .await
    }

    pub async fn prompts_by_ids(&self, ids: Vec<i64>) -> Result<Vec<UserPromptRow>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| {
            let placeholders = vec!["?"; ids.len()].join(",");
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROMPT_COLS} FROM user_prompts WHERE id IN ({placeholders})"
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(ids), row_to_prompt)?;
            let mut prompts = Vec::new();
            for row in rows {
                prompts.push(row?);
            }
            Ok(prompts)
        })
        .await
    }

    /// Prompts whose session belongs to one of `projects`.
    pub async fn prompts_for_projects(
        &self,
        projects: Vec<String>,
    ) -> Result<Vec<UserPromptRow>, StoreError> {
        if projects.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| {
            let placeholders = vec!["?"; projects.len()].join(",");
            let mut stmt = conn.prepare(&format!(
                "SELECT p.{} FROM user_prompts p
                 JOIN sessions s ON s.content_session_id = p.content_session_id
                 WHERE s.project IN ({placeholders})
                 ORDER BY p.created_at_epoch DESC",
                PROMPT_COLS.replace(", ", ", p.")
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(projects), row_to_prompt)?;
            let mut prompts = Vec::new();
            for row in rows {
                prompts.push(row?);
            }
            Ok(prompts)
        })
        .await
    }

    /// Prompts inside a closed epoch window whose session belongs to one of
    /// `projects` (all projects when empty), oldest first.
    pub async fn prompts_between(
        &self,
        projects: Vec<String>,
        from_epoch: i64,
        to_epoch: i64,
    ) -> Result<Vec<UserPromptRow>, StoreError> {
        self.with_conn(move |conn| {
            let mut sql = format!(
                "SELECT p.{} FROM user_prompts p
                 JOIN sessions s ON s.content_session_id = p.content_session_id
                 WHERE p.created_at_epoch >= ? AND p.created_at_epoch <= ?",
                PROMPT_COLS.replace(", ", ", p.")
            );
            let mut args: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(from_epoch), Box::new(to_epoch)];
            if !projects.is_empty() {
                sql.push_str(&format!(
                    " AND s.project IN ({})",
                    vec!["?"; projects.len()].join(",")
                ));
                for p in &projects {
                    args.push(Box::new(p.clone()));
                }
            }
            sql.push_str(" ORDER BY p.created_at_epoch, p.id");
            let mut stmt = conn.prepare(&sql)?;
            let params = rusqlite::params_from_iter(args.iter().map(|b| b.as_ref()));
            let rows = stmt.query_map(params, row_to_prompt)?;
            let mut prompts = Vec::new();
            for row in rows {
                prompts.push(row?);
            }
            Ok(prompts)
        })
        .await
    }

    pub async fn last_prompt_for_projects(
        &self,
        projects: Vec<String>,
    ) -> Result<Option<UserPromptRow>, StoreError> {
        if projects.is_empty() {
            return Ok(None);
        }
        self.with_conn(move |conn| {
            let placeholders = vec!["?"; projects.len()].join(",");
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT p.{} FROM user_prompts p
                         JOIN sessions s ON s.content_session_id = p.content_session_id
                         WHERE s.project IN ({placeholders})
                         ORDER BY p.created_at_epoch DESC, p.id DESC
                         LIMIT 1",
                        PROMPT_COLS.replace(", ", ", p.")
                    ),
                    rusqlite::params_from_iter(projects),
                    row_to_prompt,
                )
                .optional()?)
        })
        .await
    }

    /// Replace the saved conversation for a session. Used so a supervisor
    /// can resume its chat after a worker restart.
    pub async fn save_conversation(
        &self,
        content_session_id: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<(), StoreError> {
        let content_session_id = content_session_id.to_owned();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM conversation_history WHERE content_session_id = ?1",
                params![content_session_id],
            )?;
            for (seq, message) in messages.iter().enumerate() {
                tx.execute(
                    "INSERT INTO conversation_history (content_session_id, seq, role, content)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        content_session_id,
                        seq as i64,
                        message.role.as_str(),
                        message.content
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn load_conversation(
        &self,
        content_session_id: &str,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let content_session_id = content_session_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT role, content FROM conversation_history
                 WHERE content_session_id = ?1
                 ORDER BY seq",
            )?;
            let rows = stmt.query_map(params![content_session_id], |row| {
                let role_raw: String = row.get(0)?;
                Ok((role_raw, row.get::<_, String>(1)?))
            })?;
            let mut messages = Vec::new();
            for row in rows {
                let (role_raw, content) = row?;
                let Some(role) = ChatRole::parse(&role_raw) else {
                    continue;
                };
                messages.push(ChatMessage { role, content });
            }
            Ok(messages)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_session_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let a = store
            .create_session_if_absent("s1", "github.com/u/r", Some("build it"), 10)
            .await
            .unwrap();
        let b = store
            .create_session_if_absent("s1", "different-project", None, 20)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.project, "github.com/u/r");
        assert_eq!(b.started_at_epoch, 10);
        assert_eq!(b.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn memory_session_id_is_write_once() {
        let store = Store::open_in_memory().unwrap();
        let session = store
            .create_session_if_absent("s1", "p", None, 1)
            .await
            .unwrap();
        store.set_memory_session_id(session.id, "mem-1").await.unwrap();
        store.set_memory_session_id(session.id, "mem-2").await.unwrap();
        let loaded = store.session_by_db_id(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.memory_session_id.as_deref(), Some("mem-1"));
    }

    #[tokio::test]
    async fn set_memory_session_id_on_missing_session_errors() {
        let store = Store::open_in_memory().unwrap();
        let err = store.set_memory_session_id(404, "mem").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn prompt_numbers_increment_per_session() {
        let store = Store::open_in_memory().unwrap();
        store.create_session_if_absent("s1", "p", None, 1).await.unwrap();
        store.create_session_if_absent("s2", "p", None, 1).await.unwrap();

        let p1 = store
            .append_user_prompt("s1", "first", None, None, 2)
            .await
            .unwrap();
        let p2 = store
            .append_user_prompt("s1", "second", Some("alice@h"), Some("u@h"), 3)
            .await
            .unwrap();
        let other = store
            .append_user_prompt("s2", "other session", None, None, 4)
            .await
            .unwrap();

        assert_eq!(p1.prompt_number, 1);
        assert_eq!(p2.prompt_number, 2);
        assert_eq!(other.prompt_number, 1);
        assert_eq!(store.count_prompts("s1").await.unwrap(), 2);

        let session = store.session_by_content_id("s1").await.unwrap().unwrap();
        assert_eq!(session.prompt_counter, 2);
    }

    #[tokio::test]
    async fn prompt_for_unknown_session_errors() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .append_user_prompt("ghost", "text", None, None, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn prompt_full_text_search_matches() {
        let store = Store::open_in_memory().unwrap();
        store.create_session_if_absent("s1", "p", None, 1).await.unwrap();
        store
            .append_user_prompt("s1", "please refactor the parser module", None, None, 2)
            .await
            .unwrap();
        store
            .append_user_prompt("s1", "unrelated request", None, None, 3)
            .await
            .unwrap();

        let hits = store.search_prompts("parser", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].prompt_text.contains("parser"));
    }

    #[tokio::test]
    async fn conversation_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let messages = vec![
            ChatMessage::user("observe this"),
            ChatMessage::assistant("<memory></memory>"),
        ];
        store.save_conversation("s1", messages.clone()).await.unwrap();
        let loaded = store.load_conversation("s1").await.unwrap();
        assert_eq!(loaded, messages);

        // A second save replaces, not appends.
        store
            .save_conversation("s1", vec![ChatMessage::user("only one")])
            .await
            .unwrap();
        let loaded = store.load_conversation("s1").await.unwrap();
        assert_eq!(loaded.len(), 1);
    }
}

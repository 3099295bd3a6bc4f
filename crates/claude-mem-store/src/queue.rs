//! The durable pending-message queue.
//!
//! Messages move `pending → processing → processed`, or to `failed` from
//! either live state. Claims are single atomic UPDATEs, so two supervisors
//! racing on the same session can never both claim one message.

use claude_mem_schema::{NewPendingMessage, PendingMessage};
use rusqlite::{params, OptionalExtension};

use crate::rows::row_to_pending;
use crate::{Store, StoreError};

const PENDING_COLS: &str = "id, session_db_id, content_session_id, message_type, tool_name, \
     tool_input, tool_response, cwd, last_user_message, last_assistant_message, \
     prompt_number, bead_id, status, retry_count, error, created_at_epoch, \
     started_processing_at_epoch, completed_at_epoch, failed_at_epoch";

impl Store {
    pub async fn enqueue_pending(
        &self,
        message: NewPendingMessage,
        now_epoch: i64,
    ) -> Result<i64, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO pending_messages
                    (session_db_id, content_session_id, message_type, tool_name, tool_input,
                     tool_response, cwd, last_user_message, last_assistant_message,
                     prompt_number, bead_id, created_at_epoch)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    message.session_db_id,
                    message.content_session_id,
                    message.message_type.as_str(),
                    message.tool_name,
                    message.tool_input,
                    message.tool_response,
                    message.cwd,
                    message.last_user_message,
                    message.last_assistant_message,
                    message.prompt_number,
                    message.bead_id,
                    now_epoch
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Claim the oldest `pending` message for a session, flipping it to
    /// `processing`. Returns `None` without blocking when the queue is empty.
    pub async fn claim_next_for_session(
        &self,
        session_db_id: i64,
        now_epoch: i64,
    ) -> Result<Option<PendingMessage>, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "UPDATE pending_messages
                         SET status = 'processing', started_processing_at_epoch = ?1
                         WHERE id = (
                             SELECT id FROM pending_messages
                             WHERE session_db_id = ?2 AND status = 'pending'
                             ORDER BY created_at_epoch, id
                             LIMIT 1
                         ) AND status = 'pending'
                         RETURNING {PENDING_COLS}"
                    ),
                    params![now_epoch, session_db_id],
                    row_to_pending,
                )
                .optional()?)
        })
        .await
    }

    /// Mark a claimed message done, discarding the tool payload to reclaim
    /// space. Prefer `commit_batch`, which does this inside the same
    /// transaction as the observation inserts.
    pub async fn mark_processed(&self, id: i64, now_epoch: i64) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE pending_messages
                 SET status = 'processed', completed_at_epoch = ?1,
                     tool_input = NULL, tool_response = NULL
                 WHERE id = ?2 AND status = 'processing'",
                params![now_epoch, id],
            )?;
            if updated == 0 {
                return Err(StoreError::InvalidState(format!(
                    "pending message {id} is not processing"
                )));
            }
            Ok(())
        })
        .await
    }

    /// Fail a message. With `retry`, the message returns to `pending` with a
    /// bumped retry count; otherwise it parks in `failed`.
    pub async fn mark_failed(
        &self,
        id: i64,
        reason: &str,
        now_epoch: i64,
        retry: bool,
    ) -> Result<(), StoreError> {
        let reason = reason.to_owned();
        self.with_conn(move |conn| {
            let updated = if retry {
                conn.execute(
                    "UPDATE pending_messages
                     SET status = 'pending', retry_count = retry_count + 1, error = ?1,
                         started_processing_at_epoch = NULL
                     WHERE id = ?2 AND status IN ('pending','processing')",
                    params![reason, id],
                )?
            } else {
                conn.execute(
                    "UPDATE pending_messages
                     SET status = 'failed', error = ?1, failed_at_epoch = ?2
                     WHERE id = ?3 AND status IN ('pending','processing')",
                    params![reason, now_epoch, id],
                )?
            };
            if updated == 0 {
                return Err(StoreError::InvalidState(format!(
                    "pending message {id} is not live"
                )));
            }
            Ok(())
        })
        .await
    }

    /// Fail every live message for a session. Used when a supervisor dies.
    pub async fn mark_session_messages_failed(
        &self,
        session_db_id: i64,
        reason: &str,
        now_epoch: i64,
    ) -> Result<usize, StoreError> {
        let reason = reason.to_owned();
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "UPDATE pending_messages
                 SET status = 'failed', error = ?1, failed_at_epoch = ?2
                 WHERE session_db_id = ?3 AND status IN ('pending','processing')",
                params![reason, now_epoch, session_db_id],
            )?)
        })
        .await
    }

    /// Startup scan: any message stuck in `processing` from a previous run
    /// goes back to `pending`.
    pub async fn reset_stale_processing(
        &self,
        started_before_epoch: i64,
    ) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "UPDATE pending_messages
                 SET status = 'pending', started_processing_at_epoch = NULL,
                     retry_count = retry_count + 1
                 WHERE status = 'processing' AND started_processing_at_epoch < ?1",
                params![started_before_epoch],
            )?)
        })
        .await
    }

    pub async fn pending_message(&self, id: i64) -> Result<Option<PendingMessage>, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {PENDING_COLS} FROM pending_messages WHERE id = ?1"),
                    params![id],
                    row_to_pending,
                )
                .optional()?)
        })
        .await
    }

    pub async fn pending_count_for_session(
        &self,
        session_db_id: i64,
    ) -> Result<i64, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM pending_messages
                 WHERE session_db_id = ?1 AND status = 'pending'",
                params![session_db_id],
                |r| r.get(0),
            )?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claude_mem_schema::{MessageType, PendingStatus};

    async fn seed(store: &Store) -> i64 {
        store
            .create_session_if_absent("s1", "p", None, 1)
            .await
            .unwrap()
            .id
    }

    fn message(session_db_id: i64, tool: &str) -> NewPendingMessage {
        NewPendingMessage {
            session_db_id,
            content_session_id: "s1".into(),
            message_type: MessageType::Observation,
            tool_name: Some(tool.into()),
            tool_input: Some("{\"file_path\":\"/a.ts\"}".into()),
            tool_response: Some("ok".into()),
            cwd: Some("/repo".into()),
            prompt_number: Some(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn claim_returns_oldest_pending_first() {
        let store = Store::open_in_memory().unwrap();
        let sid = seed(&store).await;
        store.enqueue_pending(message(sid, "Read"), 100).await.unwrap();
        store.enqueue_pending(message(sid, "Edit"), 200).await.unwrap();

        let first = store.claim_next_for_session(sid, 300).await.unwrap().unwrap();
        assert_eq!(first.tool_name.as_deref(), Some("Read"));
        assert_eq!(first.status, PendingStatus::Processing);
        assert_eq!(first.started_processing_at_epoch, Some(300));

        let second = store.claim_next_for_session(sid, 301).await.unwrap().unwrap();
        assert_eq!(second.tool_name.as_deref(), Some("Edit"));

        assert!(store.claim_next_for_session(sid, 302).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_on_empty_queue_returns_none() {
        let store = Store::open_in_memory().unwrap();
        let sid = seed(&store).await;
        assert!(store.claim_next_for_session(sid, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_take_distinct_messages() {
        let store = Store::open_in_memory().unwrap();
        let sid = seed(&store).await;
        store.enqueue_pending(message(sid, "Read"), 100).await.unwrap();
        store.enqueue_pending(message(sid, "Edit"), 200).await.unwrap();

        let (a, b) = tokio::join!(
            store.claim_next_for_session(sid, 300),
            store.claim_next_for_session(sid, 300)
        );
        let a = a.unwrap().unwrap();
        let b = b.unwrap().unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn mark_processed_nulls_tool_payload() {
        let store = Store::open_in_memory().unwrap();
        let sid = seed(&store).await;
        let id = store.enqueue_pending(message(sid, "Read"), 100).await.unwrap();
        store.claim_next_for_session(sid, 200).await.unwrap().unwrap();
        store.mark_processed(id, 300).await.unwrap();

        let row = store.pending_message(id).await.unwrap().unwrap();
        assert_eq!(row.status, PendingStatus::Processed);
        assert_eq!(row.completed_at_epoch, Some(300));
        assert!(row.tool_input.is_none());
        assert!(row.tool_response.is_none());
    }

    #[tokio::test]
    async fn mark_processed_requires_processing_state() {
        let store = Store::open_in_memory().unwrap();
        let sid = seed(&store).await;
        let id = store.enqueue_pending(message(sid, "Read"), 100).await.unwrap();
        let err = store.mark_processed(id, 200).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
    }

    #[tokio::test]
    async fn mark_failed_with_retry_requeues() {
        let store = Store::open_in_memory().unwrap();
        let sid = seed(&store).await;
        let id = store.enqueue_pending(message(sid, "Read"), 100).await.unwrap();
        store.claim_next_for_session(sid, 200).await.unwrap();

        store.mark_failed(id, "llm timeout", 300, true).await.unwrap();
        let row = store.pending_message(id).await.unwrap().unwrap();
        assert_eq!(row.status, PendingStatus::Pending);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.error.as_deref(), Some("llm timeout"));

        // Claimable again.
        assert!(store.claim_next_for_session(sid, 400).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn mark_failed_without_retry_parks() {
        let store = Store::open_in_memory().unwrap();
        let sid = seed(&store).await;
        let id = store.enqueue_pending(message(sid, "Read"), 100).await.unwrap();
        store.mark_failed(id, "bad auth", 300, false).await.unwrap();

        let row = store.pending_message(id).await.unwrap().unwrap();
        assert_eq!(row.status, PendingStatus::Failed);
        assert_eq!(row.failed_at_epoch, Some(300));
        assert!(store.claim_next_for_session(sid, 400).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_wide_failure_covers_live_messages_only() {
        let store = Store::open_in_memory().unwrap();
        let sid = seed(&store).await;
        let done = store.enqueue_pending(message(sid, "Read"), 100).await.unwrap();
        store.enqueue_pending(message(sid, "Edit"), 200).await.unwrap();
        store.claim_next_for_session(sid, 250).await.unwrap();
        store.mark_processed(done, 260).await.unwrap();
        store.enqueue_pending(message(sid, "Bash"), 300).await.unwrap();

        let failed = store
            .mark_session_messages_failed(sid, "supervisor died", 400)
            .await
            .unwrap();
        assert_eq!(failed, 2);
        let row = store.pending_message(done).await.unwrap().unwrap();
        assert_eq!(row.status, PendingStatus::Processed);
    }

    #[tokio::test]
    async fn stale_processing_rows_reset_on_startup_scan() {
        let store = Store::open_in_memory().unwrap();
        let sid = seed(&store).await;
        store.enqueue_pending(message(sid, "Read"), 100).await.unwrap();
        store.claim_next_for_session(sid, 200).await.unwrap();

        assert_eq!(store.reset_stale_processing(150).await.unwrap(), 0);
        assert_eq!(store.reset_stale_processing(250).await.unwrap(), 1);
        let claimed = store.claim_next_for_session(sid, 300).await.unwrap();
        assert!(claimed.is_some());
    }
}

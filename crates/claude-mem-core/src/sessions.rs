//! Per-session supervisors.
//!
//! Each active session owns exactly one supervisor task holding the live
//! conversation with the LLM. Work arrives through the store's pending
//! queue; the ingest path enqueues and rings the session's notifier, and the
//! supervisor's message iterator claims messages in FIFO order. Cancellation
//! rolls any claimed-but-uncommitted message back to `pending`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use claude_mem_provider::LlmProvider;
use claude_mem_schema::modes::Mode;
use claude_mem_schema::{
    epoch_millis_now, ChatMessage, PendingMessage, SessionRow, SessionStatus,
};
use claude_mem_store::Store;
use claude_mem_vector::VectorSync;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::processor::ResponseProcessor;
use crate::prompts;
use crate::CoreError;

const IDLE_POLL: Duration = Duration::from_secs(5);

struct SessionHandle {
    notify: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    store: Store,
    provider: Arc<dyn LlmProvider>,
    processor: ResponseProcessor,
    sync: VectorSync,
    mode: Mode,
    shutdown: CancellationToken,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    /// Projects whose vector mirror needs a repair backfill.
    repair_projects: Mutex<HashSet<String>>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

/// Lazily claims pending messages for one session. Yields in FIFO order and
/// ends when the session leaves `active` or the task is cancelled.
struct MessageIterator {
    store: Store,
    session_db_id: i64,
    notify: Arc<Notify>,
    cancel: CancellationToken,
}

impl MessageIterator {
    async fn next(&mut self) -> Result<Option<PendingMessage>, CoreError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(message) = self
                .store
                .claim_next_for_session(self.session_db_id, epoch_millis_now())
                .await?
            {
                return Ok(Some(message));
            }
            match self.store.session_by_db_id(self.session_db_id).await? {
                Some(session) if session.status == SessionStatus::Active => {}
                _ => return Ok(None),
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
                _ = self.cancel.cancelled() => return Ok(None),
            }
        }
    }
}

impl SessionManager {
    pub fn new(
        store: Store,
        provider: Arc<dyn LlmProvider>,
        processor: ResponseProcessor,
        sync: VectorSync,
        mode: Mode,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                provider,
                processor,
                sync,
                mode,
                shutdown,
                sessions: Mutex::new(HashMap::new()),
                repair_projects: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Make sure a supervisor task is running for this session, then ring
    /// its notifier. Called on every ingest.
    pub async fn ensure_task_and_notify(&self, session: &SessionRow) {
        let mut sessions = self.inner.sessions.lock().await;
        let stale = sessions
            .get(&session.content_session_id)
            .is_some_and(|handle| handle.task.is_finished());
        if stale {
            sessions.remove(&session.content_session_id);
        }
        let handle = sessions
            .entry(session.content_session_id.clone())
            .or_insert_with(|| {
                let notify = Arc::new(Notify::new());
                let cancel = self.inner.shutdown.child_token();
                let task = tokio::spawn(run_supervisor(
                    Arc::clone(&self.inner),
                    session.clone(),
                    Arc::clone(&notify),
                    cancel.clone(),
                ));
                info!(session = %session.content_session_id, project = %session.project, "supervisor started");
                SessionHandle {
                    notify,
                    cancel,
                    task,
                }
            });
        handle.notify.notify_one();
    }

    /// Mark the session done and stop its supervisor.
    pub async fn complete_session(&self, content_session_id: &str) -> Result<(), CoreError> {
        if let Some(session) = self.inner.store.session_by_content_id(content_session_id).await? {
            self.inner
                .store
                .update_session_status(session.id, SessionStatus::Completed, Some(epoch_millis_now()))
                .await?;
        }
        let handle = {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.remove(content_session_id)
        };
        if let Some(handle) = handle {
            handle.cancel.cancel();
            handle.notify.notify_one();
            let _ = handle.task.await;
        }
        Ok(())
    }

    /// Flag a project for vector repair at the next session start.
    pub async fn flag_repair(&self, project: &str) {
        self.inner
            .repair_projects
            .lock()
            .await
            .insert(project.to_string());
    }

    pub async fn active_session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Cancel every supervisor and wait for each to acknowledge. Each task
    /// rolls its in-flight claim back to `pending` before exiting.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, SessionHandle)> = {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.drain().collect()
        };
        for (id, handle) in handles {
            handle.cancel.cancel();
            handle.notify.notify_one();
            if handle.task.await.is_err() {
                warn!(session = %id, "supervisor task panicked during shutdown");
            }
        }
    }
}

async fn run_supervisor(
    inner: Arc<Inner>,
    session: SessionRow,
    notify: Arc<Notify>,
    cancel: CancellationToken,
) {
    if let Err(e) = supervise(&inner, &session, notify, cancel).await {
        error!(session = %session.content_session_id, error = %e, "supervisor terminated with error");
        let now = epoch_millis_now();
        if let Err(e) = inner
            .store
            .mark_session_messages_failed(session.id, "supervisor terminated", now)
            .await
        {
            error!(error = %e, "failed to fail session messages after supervisor death");
        }
    }
}

async fn supervise(
    inner: &Inner,
    session: &SessionRow,
    notify: Arc<Notify>,
    cancel: CancellationToken,
) -> Result<(), CoreError> {
    // Repair the vector mirror first if a previous sync failure flagged it.
    let needs_repair = inner
        .repair_projects
        .lock()
        .await
        .remove(&session.project);
    if needs_repair {
        if let Err(e) = inner.sync.ensure_backfilled(&session.project).await {
            warn!(project = %session.project, error = %e, "vector repair backfill failed");
            inner
                .repair_projects
                .lock()
                .await
                .insert(session.project.clone());
        }
    }

    let mut history = inner
        .store
        .load_conversation(&session.content_session_id)
        .await?;
    let mut memory_session_id = session.memory_session_id.clone();

    // Open the conversation: a fresh init prompt, or a continuation when
    // resuming mid-session after a restart.
    if history.is_empty() {
        let opening = if session.prompt_counter == 0 {
            prompts::init_prompt(&inner.mode, session)
        } else {
            prompts::continuation_prompt(&inner.mode, session, session.prompt_counter)
        };
        history.push(ChatMessage::user(opening));
        let reply = tokio::select! {
            result = inner.provider.run(&history) => result,
            _ = cancel.cancelled() => return Ok(()),
        };
        match reply {
            Ok(reply) => {
                let assigned = memory_session_id.clone().unwrap_or_else(|| {
                    reply
                        .provider_session_id
                        .clone()
                        .unwrap_or_else(|| Uuid::new_v4().to_string())
                });
                if memory_session_id.is_none() {
                    inner
                        .store
                        .set_memory_session_id(session.id, &assigned)
                        .await?;
                    memory_session_id = Some(assigned);
                }
                history.push(ChatMessage::assistant(reply.content));
                inner
                    .store
                    .save_conversation(&session.content_session_id, history.clone())
                    .await?;
            }
            Err(e) if e.is_recoverable() => {
                // Nothing claimed yet; drop the task and let the next
                // ingest respawn it.
                warn!(session = %session.content_session_id, error = %e, "init round failed, will retry on next event");
                return Ok(());
            }
            Err(e) => {
                error!(session = %session.content_session_id, error = %e, "init round failed unrecoverably");
                return Ok(());
            }
        }
    }

    let mut iterator = MessageIterator {
        store: inner.store.clone(),
        session_db_id: session.id,
        notify,
        cancel: cancel.clone(),
    };

    while let Some(message) = iterator.next().await? {
        let prompt = prompts::message_prompt(&inner.mode, &message);
        history.push(ChatMessage::user(prompt));

        let round = tokio::select! {
            result = inner.provider.run(&history) => Some(result),
            _ = cancel.cancelled() => None,
        };
        let Some(reply) = round else {
            // Cancelled mid-flight: return the claim so another supervisor
            // can pick it up.
            history.pop();
            inner
                .store
                .mark_failed(message.id, "cancelled", epoch_millis_now(), true)
                .await?;
            return Ok(());
        };

        match reply {
            Ok(reply) => {
                let assigned = memory_session_id.clone().unwrap_or_else(|| {
                    reply
                        .provider_session_id
                        .clone()
                        .unwrap_or_else(|| Uuid::new_v4().to_string())
                });
                if memory_session_id.is_none() {
                    inner
                        .store
                        .set_memory_session_id(session.id, &assigned)
                        .await?;
                    memory_session_id = Some(assigned.clone());
                }

                history.push(ChatMessage::assistant(reply.content.clone()));
                let outcome = inner
                    .processor
                    .process(session, &message, &assigned, &reply)
                    .await?;
                if outcome.needs_vector_repair {
                    inner
                        .repair_projects
                        .lock()
                        .await
                        .insert(session.project.clone());
                }
                inner
                    .store
                    .save_conversation(&session.content_session_id, history.clone())
                    .await?;
                debug!(
                    message = message.id,
                    observations = outcome.observation_ids.len(),
                    "message processed"
                );
            }
            Err(e) if e.is_recoverable() => {
                // The fallback chain (when configured) already ran inside
                // the provider; exhaustion parks the message retry-eligible
                // and ends the task.
                warn!(message = message.id, error = %e, "recoverable provider failure, requeueing");
                history.pop();
                inner
                    .store
                    .mark_failed(message.id, &e.to_string(), epoch_millis_now(), true)
                    .await?;
                return Ok(());
            }
            Err(e) => {
                error!(message = message.id, error = %e, "unrecoverable provider failure");
                history.pop();
                inner
                    .store
                    .mark_failed(message.id, &e.to_string(), epoch_millis_now(), false)
                    .await?;
                return Ok(());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use claude_mem_provider::{LlmReply, ProviderError, ProviderErrorKind};
    use claude_mem_schema::{MessageType, NewPendingMessage, PendingStatus, Visibility};
    use claude_mem_vector::{EmbeddedIndex, VectorIndex};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// First reply answers the init round; later replies carry one
    /// observation each.
    struct SequencedProvider {
        calls: AtomicUsize,
        fail_kind: Option<ProviderErrorKind>,
    }

    #[async_trait]
    impl LlmProvider for SequencedProvider {
        async fn run(&self, _history: &[ChatMessage]) -> Result<LlmReply, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call > 0 {
                if let Some(kind) = self.fail_kind {
                    return Err(ProviderError::new("scripted", kind, "scripted failure"));
                }
            }
            let content = if call == 0 {
                "ready".to_string()
            } else {
                format!(
                    "<memory><observation type=\"discovery\">\
                     <title>obs {call}</title><narrative>n</narrative>\
                     </observation></memory>"
                )
            };
            Ok(LlmReply {
                content,
                input_tokens: 10,
                output_tokens: 20,
                provider_session_id: None,
            })
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    async fn manager_with(
        fail_kind: Option<ProviderErrorKind>,
    ) -> (SessionManager, Store, CancellationToken) {
        let store = Store::open_in_memory().unwrap();
        let index: Arc<dyn VectorIndex> = Arc::new(EmbeddedIndex::open_in_memory().unwrap());
        let sync = VectorSync::new(index, store.clone());
        let processor = ResponseProcessor::new(store.clone(), sync.clone(), Visibility::Project);
        let shutdown = CancellationToken::new();
        let manager = SessionManager::new(
            store.clone(),
            Arc::new(SequencedProvider {
                calls: AtomicUsize::new(0),
                fail_kind,
            }),
            processor,
            sync,
            Mode::default(),
            shutdown.clone(),
        );
        (manager, store, shutdown)
    }

    async fn enqueue(store: &Store, session: &SessionRow, at: i64) -> i64 {
        store
            .enqueue_pending(
                NewPendingMessage {
                    session_db_id: session.id,
                    content_session_id: session.content_session_id.clone(),
                    message_type: MessageType::Observation,
                    tool_name: Some("Read".into()),
                    tool_input: Some("{}".into()),
                    tool_response: Some("ok".into()),
                    prompt_number: Some(1),
                    ..Default::default()
                },
                at,
            )
            .await
            .unwrap()
    }

    async fn wait_for_status(store: &Store, id: i64, status: PendingStatus) {
        for _ in 0..300 {
            let row = store.pending_message(id).await.unwrap().unwrap();
            if row.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("message {id} never reached {status:?}");
    }

    async fn wait_for_requeue(store: &Store, id: i64) {
        for _ in 0..300 {
            let row = store.pending_message(id).await.unwrap().unwrap();
            if row.status == PendingStatus::Pending && row.retry_count > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("message {id} never requeued");
    }

    #[tokio::test]
    async fn supervisor_processes_enqueued_messages_in_order() {
        let (manager, store, _shutdown) = manager_with(None).await;
        let session = store
            .create_session_if_absent("s1", "p", Some("go"), 1)
            .await
            .unwrap();
        let first = enqueue(&store, &session, 10).await;
        let second = enqueue(&store, &session, 20).await;
        manager.ensure_task_and_notify(&session).await;

        wait_for_status(&store, first, PendingStatus::Processed).await;
        wait_for_status(&store, second, PendingStatus::Processed).await;

        // The memory session id was assigned on the first round.
        let session = store.session_by_db_id(session.id).await.unwrap().unwrap();
        assert!(session.memory_session_id.is_some());

        let observations = store
            .recent_observations(vec!["p".into()], 10)
            .await
            .unwrap();
        assert_eq!(observations.len(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn conversation_is_persisted_for_resume() {
        let (manager, store, _shutdown) = manager_with(None).await;
        let session = store
            .create_session_if_absent("s1", "p", Some("go"), 1)
            .await
            .unwrap();
        let id = enqueue(&store, &session, 10).await;
        manager.ensure_task_and_notify(&session).await;
        wait_for_status(&store, id, PendingStatus::Processed).await;

        let history = store.load_conversation("s1").await.unwrap();
        // init user + init assistant + message user + message assistant
        assert!(history.len() >= 4);
        assert_eq!(history[0].role, claude_mem_schema::ChatRole::User);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn recoverable_failure_requeues_the_claim() {
        let (manager, store, _shutdown) =
            manager_with(Some(ProviderErrorKind::Timeout)).await;
        let session = store
            .create_session_if_absent("s1", "p", Some("go"), 1)
            .await
            .unwrap();
        let id = enqueue(&store, &session, 10).await;
        manager.ensure_task_and_notify(&session).await;

        wait_for_requeue(&store, id).await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unrecoverable_failure_parks_the_message() {
        let (manager, store, _shutdown) = manager_with(Some(ProviderErrorKind::Auth)).await;
        let session = store
            .create_session_if_absent("s1", "p", Some("go"), 1)
            .await
            .unwrap();
        let id = enqueue(&store, &session, 10).await;
        manager.ensure_task_and_notify(&session).await;

        wait_for_status(&store, id, PendingStatus::Failed).await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_idle_supervisors() {
        let (manager, store, _shutdown) = manager_with(None).await;
        let session = store
            .create_session_if_absent("s1", "p", Some("go"), 1)
            .await
            .unwrap();
        let id = enqueue(&store, &session, 10).await;
        manager.ensure_task_and_notify(&session).await;
        wait_for_status(&store, id, PendingStatus::Processed).await;
        assert_eq!(manager.active_session_count().await, 1);
        manager.shutdown().await;
        assert_eq!(manager.active_session_count().await, 0);
    }

    #[tokio::test]
    async fn complete_session_stops_the_iterator() {
        let (manager, store, _shutdown) = manager_with(None).await;
        let session = store
            .create_session_if_absent("s1", "p", Some("go"), 1)
            .await
            .unwrap();
        let id = enqueue(&store, &session, 10).await;
        manager.ensure_task_and_notify(&session).await;
        wait_for_status(&store, id, PendingStatus::Processed).await;

        manager.complete_session("s1").await.unwrap();
        let session = store.session_by_content_id("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(manager.active_session_count().await, 0);
    }
}

//! LLM response processing.
//!
//! Responses are plain text carrying a small custom XML vocabulary:
//! `<memory>` wraps `<observation type="…">` blocks, `<summary>` wraps the
//! session rollup fields, and `<private>` spans are stripped before anything
//! else looks at the text. The scanner is hand-written: unknown tags are
//! ignored, malformed observations are skipped with a warning, and nothing
//! here aborts a batch.

use claude_mem_schema::{
    MessageType, NewObservation, NewSessionSummary, Observation, ObservationType, PendingMessage,
    SessionRow, SessionSummary, Visibility,
};
use claude_mem_store::Store;
use claude_mem_provider::LlmReply;
use claude_mem_vector::VectorSync;
use tracing::{debug, warn};

use crate::CoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedObservation {
    pub kind: ObservationType,
    pub title: String,
    pub subtitle: Option<String>,
    pub narrative: Option<String>,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSummary {
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub notes: Option<String>,
}

impl ParsedSummary {
    pub fn is_empty(&self) -> bool {
        self.request.is_none()
            && self.investigated.is_none()
            && self.learned.is_none()
            && self.completed.is_none()
            && self.next_steps.is_none()
            && self.notes.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedResponse {
    pub observations: Vec<ParsedObservation>,
    pub summary: Option<ParsedSummary>,
}

/// Remove `<private>…</private>` spans. An unterminated tag swallows the
/// rest of the text; leaked private content is worse than lost public
/// content.
fn strip_private(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find("<private>") {
            Some(start) => {
                out.push_str(&rest[..start]);
                match rest[start..].find("</private>") {
                    Some(end) => rest = &rest[start + end + "</private>".len()..],
                    None => break,
                }
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out
}

/// All inner contents of `<tag …>…</tag>` blocks, in order.
fn tag_contents<'a>(text: &'a str, tag: &str) -> Vec<&'a str> {
    let open_plain = format!("<{tag}>");
    let open_attr = format!("<{tag} ");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut cursor = 0;
    while cursor < text.len() {
        let rest = &text[cursor..];
        let plain = rest.find(&open_plain);
        let attr = rest.find(&open_attr);
        let Some(open_at) = [plain, attr].into_iter().flatten().min() else {
            break;
        };
        let after_open = &rest[open_at..];
        let Some(open_end) = after_open.find('>') else {
            break;
        };
        let body_start = cursor + open_at + open_end + 1;
        let Some(close_at) = text[body_start..].find(&close) else {
            break;
        };
        out.push(&text[body_start..body_start + close_at]);
        cursor = body_start + close_at + close.len();
    }
    out
}

fn first_tag_content<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    tag_contents(text, tag).into_iter().next()
}

/// The value of `name="…"` (or single-quoted) in an observation open tag.
fn tag_attribute(text: &str, tag: &str, attribute: &str) -> Option<String> {
    let open = format!("<{tag} ");
    let start = text.find(&open)?;
    let rest = &text[start..];
    let end = rest.find('>')?;
    let attrs = &rest[..end];
    for quote in ['"', '\''] {
        let needle = format!("{attribute}={quote}");
        if let Some(at) = attrs.find(&needle) {
            let value_start = at + needle.len();
            if let Some(len) = attrs[value_start..].find(quote) {
                return Some(attrs[value_start..value_start + len].to_string());
            }
        }
    }
    None
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn clean(text: &str) -> String {
    unescape(text.trim())
}

fn clean_optional(text: Option<&str>) -> Option<String> {
    text.map(clean).filter(|s| !s.is_empty())
}

fn clean_all(items: Vec<&str>) -> Vec<String> {
    items
        .into_iter()
        .map(clean)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse one LLM response. Never fails; unparseable content degrades to an
/// empty result.
pub fn parse_response(raw: &str) -> ParsedResponse {
    let text = strip_private(raw);
    let mut response = ParsedResponse::default();

    for memory in tag_contents(&text, "memory") {
        // Walk observation blocks with their open tags intact so the type
        // attribute is still visible.
        let mut cursor = 0;
        while let Some(open_at) = memory[cursor..].find("<observation") {
            let block_start = cursor + open_at;
            let Some(close_at) = memory[block_start..].find("</observation>") else {
                warn!("unterminated observation block, skipping remainder");
                break;
            };
            let block = &memory[block_start..block_start + close_at + "</observation>".len()];
            cursor = block_start + close_at + "</observation>".len();

            let Some(kind_raw) = tag_attribute(block, "observation", "type") else {
                warn!("observation without a type attribute, skipping");
                continue;
            };
            let Some(kind) = ObservationType::parse(&kind_raw) else {
                warn!(kind = %kind_raw, "unknown observation type, skipping");
                continue;
            };
            let Some(title) = clean_optional(first_tag_content(block, "title")) else {
                warn!("observation without a title, skipping");
                continue;
            };
            response.observations.push(ParsedObservation {
                kind,
                title,
                subtitle: clean_optional(first_tag_content(block, "subtitle")),
                narrative: clean_optional(first_tag_content(block, "narrative")),
                facts: clean_all(tag_contents(block, "fact")),
                concepts: clean_all(tag_contents(block, "concept")),
                files_read: clean_all(tag_contents(block, "file_read")),
                files_modified: clean_all(tag_contents(block, "file_modified")),
            });
        }
    }

    if let Some(summary_block) = first_tag_content(&text, "summary") {
        let summary = ParsedSummary {
            request: clean_optional(first_tag_content(summary_block, "request")),
            investigated: clean_optional(first_tag_content(summary_block, "investigated")),
            learned: clean_optional(first_tag_content(summary_block, "learned")),
            completed: clean_optional(first_tag_content(summary_block, "completed")),
            next_steps: clean_optional(first_tag_content(summary_block, "next_steps")),
            notes: clean_optional(first_tag_content(summary_block, "notes")),
        };
        if !summary.is_empty() {
            response.summary = Some(summary);
        }
    }

    response
}

/// Outcome of one processed message.
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    pub observation_ids: Vec<i64>,
    pub summary_id: Option<i64>,
    /// Set when the store commit succeeded but the vector sync did not; the
    /// project needs `ensure_backfilled` at next session start.
    pub needs_vector_repair: bool,
}

#[derive(Clone)]
pub struct ResponseProcessor {
    store: Store,
    sync: VectorSync,
    default_visibility: Visibility,
}

impl ResponseProcessor {
    pub fn new(store: Store, sync: VectorSync, default_visibility: Visibility) -> Self {
        Self {
            store,
            sync,
            default_visibility,
        }
    }

    /// Parse the reply and commit: observations + optional summary + the
    /// `processing → processed` transition, all in one store transaction.
    /// Vector sync follows; its failure leaves the store authoritative and
    /// flags the project for repair.
    pub async fn process(
        &self,
        session: &SessionRow,
        message: &PendingMessage,
        memory_session_id: &str,
        reply: &LlmReply,
    ) -> Result<ProcessOutcome, CoreError> {
        let parsed = parse_response(&reply.content);

        if parsed.observations.is_empty() && parsed.summary.is_none() {
            warn!(
                message_id = message.id,
                "response contained no observations or summary, failing message"
            );
            self.store
                .mark_failed(
                    message.id,
                    "response contained no parseable output",
                    claude_mem_schema::epoch_millis_now(),
                    false,
                )
                .await?;
            return Ok(ProcessOutcome::default());
        }

        let observation_count = parsed.observations.len() as i64;
        let per_observation = if observation_count > 0 {
            i64::from(reply.output_tokens) / observation_count
        } else {
            0
        };
        let remainder = if observation_count > 0 {
            i64::from(reply.output_tokens) % observation_count
        } else {
            0
        };

        let created_at = message.created_at_epoch;
        let observations: Vec<NewObservation> = parsed
            .observations
            .into_iter()
            .enumerate()
            .map(|(i, obs)| NewObservation {
                memory_session_id: memory_session_id.to_string(),
                project: session.project.clone(),
                kind: obs.kind,
                title: obs.title,
                subtitle: obs.subtitle,
                narrative: obs.narrative,
                text: None,
                facts: obs.facts,
                concepts: obs.concepts,
                files_read: obs.files_read,
                files_modified: obs.files_modified,
                prompt_number: message.prompt_number,
                discovery_tokens: per_observation + if i == 0 { remainder } else { 0 },
                bead_id: message.bead_id.clone(),
                agent: "legacy".to_string(),
                department: "default".to_string(),
                visibility: self.default_visibility,
                created_at_epoch: created_at,
            })
            .collect();

        let summary = parsed.summary.map(|s| NewSessionSummary {
            memory_session_id: memory_session_id.to_string(),
            project: session.project.clone(),
            request: s.request,
            investigated: s.investigated,
            learned: s.learned,
            completed: s.completed,
            next_steps: s.next_steps,
            notes: s.notes,
            prompt_number: message.prompt_number,
            agent: "legacy".to_string(),
            department: "default".to_string(),
            visibility: self.default_visibility,
            created_at_epoch: created_at,
        });

        let expects_summary = message.message_type == MessageType::Summarize;
        if expects_summary && summary.is_none() {
            debug!(message_id = message.id, "summarize message produced no summary tag");
        }

        let (observation_ids, summary_id) = self
            .store
            .commit_batch(
                message.id,
                observations,
                summary,
                claude_mem_schema::epoch_millis_now(),
            )
            .await?;

        let mut outcome = ProcessOutcome {
            observation_ids,
            summary_id,
            needs_vector_repair: false,
        };

        let stored: Vec<Observation> = self
            .store
            .observations_by_ids(outcome.observation_ids.clone())
            .await?;
        for obs in &stored {
            if let Err(e) = self.sync.sync_observation(obs).await {
                warn!(observation = obs.id, error = %e, "vector sync failed");
                outcome.needs_vector_repair = true;
            }
        }
        if let Some(summary_id) = outcome.summary_id {
            let summaries: Vec<SessionSummary> =
                self.store.summaries_by_ids(vec![summary_id]).await?;
            for summary in &summaries {
                if let Err(e) = self.sync.sync_summary(summary).await {
                    warn!(summary = summary.id, error = %e, "vector sync failed");
                    outcome.needs_vector_repair = true;
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claude_mem_schema::NewPendingMessage;
    use claude_mem_vector::{EmbeddedIndex, VectorIndex};
    use std::sync::Arc;

    #[test]
    fn parses_a_full_observation() {
        let text = r#"Some preamble.
<memory>
  <observation type="discovery">
    <title>T</title>
    <subtitle>S</subtitle>
    <narrative>N</narrative>
    <fact>f1</fact>
    <fact>f2</fact>
    <concept>testing</concept>
    <file_read>/a.ts</file_read>
    <file_modified>/b.ts</file_modified>
  </observation>
</memory>"#;
        let parsed = parse_response(text);
        assert_eq!(parsed.observations.len(), 1);
        let obs = &parsed.observations[0];
        assert_eq!(obs.kind, ObservationType::Discovery);
        assert_eq!(obs.title, "T");
        assert_eq!(obs.subtitle.as_deref(), Some("S"));
        assert_eq!(obs.narrative.as_deref(), Some("N"));
        assert_eq!(obs.facts, vec!["f1", "f2"]);
        assert_eq!(obs.concepts, vec!["testing"]);
        assert_eq!(obs.files_read, vec!["/a.ts"]);
        assert_eq!(obs.files_modified, vec!["/b.ts"]);
        assert!(parsed.summary.is_none());
    }

    #[test]
    fn malformed_observations_are_skipped_not_fatal() {
        let text = r#"<memory>
  <observation type="nonsense"><title>bad kind</title></observation>
  <observation><title>no kind</title></observation>
  <observation type="bugfix"></observation>
  <observation type="bugfix"><title>good</title><narrative>n</narrative></observation>
</memory>"#;
        let parsed = parse_response(text);
        assert_eq!(parsed.observations.len(), 1);
        assert_eq!(parsed.observations[0].title, "good");
    }

    #[test]
    fn private_spans_are_stripped_before_parsing() {
        let text = r#"<private><memory><observation type="decision"><title>secret</title></observation></memory></private>
<memory><observation type="decision"><title>public</title></observation></memory>
<private>unclosed trailing secret"#;
        let parsed = parse_response(text);
        assert_eq!(parsed.observations.len(), 1);
        assert_eq!(parsed.observations[0].title, "public");
    }

    #[test]
    fn summary_fields_parse_as_a_subset() {
        let text = r#"<summary>
  <request>build the feature</request>
  <learned>the queue is FIFO</learned>
  <unknown_tag>ignored</unknown_tag>
</summary>"#;
        let parsed = parse_response(text);
        let summary = parsed.summary.unwrap();
        assert_eq!(summary.request.as_deref(), Some("build the feature"));
        assert_eq!(summary.learned.as_deref(), Some("the queue is FIFO"));
        assert!(summary.investigated.is_none());
    }

    #[test]
    fn empty_summary_is_none() {
        let parsed = parse_response("<summary>\n   \n</summary>");
        assert!(parsed.summary.is_none());
    }

    #[test]
    fn entities_are_unescaped() {
        let text = r#"<memory><observation type="change">
  <title>use &lt;Arc&gt; &amp; Mutex</title>
</observation></memory>"#;
        let parsed = parse_response(text);
        assert_eq!(parsed.observations[0].title, "use <Arc> & Mutex");
    }

    #[test]
    fn multiple_memory_blocks_accumulate() {
        let text = r#"<memory><observation type="decision"><title>one</title></observation></memory>
interleaved prose
<memory><observation type="change"><title>two</title></observation></memory>"#;
        let parsed = parse_response(text);
        assert_eq!(parsed.observations.len(), 2);
    }

    #[test]
    fn plain_text_parses_to_empty() {
        let parsed = parse_response("no tags here at all");
        assert!(parsed.observations.is_empty());
        assert!(parsed.summary.is_none());
    }

    async fn harness() -> (Store, ResponseProcessor, SessionRow, PendingMessage) {
        let store = Store::open_in_memory().unwrap();
        let index: Arc<dyn VectorIndex> = Arc::new(EmbeddedIndex::open_in_memory().unwrap());
        let sync = VectorSync::new(index, store.clone());
        let processor = ResponseProcessor::new(store.clone(), sync, Visibility::Project);

        let session = store
            .create_session_if_absent("s1", "example.com/o/r", Some("do it"), 10)
            .await
            .unwrap();
        let id = store
            .enqueue_pending(
                NewPendingMessage {
                    session_db_id: session.id,
                    content_session_id: "s1".into(),
                    message_type: MessageType::Observation,
                    tool_name: Some("Read".into()),
                    tool_input: Some(r#"{"file_path":"/a.ts"}"#.into()),
                    tool_response: Some("ok".into()),
                    prompt_number: Some(1),
                    ..Default::default()
                },
                100,
            )
            .await
            .unwrap();
        let message = store
            .claim_next_for_session(session.id, 200)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.id, id);
        (store, processor, session, message)
    }

    fn reply(content: &str, output_tokens: u32) -> LlmReply {
        LlmReply {
            content: content.to_string(),
            input_tokens: 50,
            output_tokens,
            provider_session_id: None,
        }
    }

    #[tokio::test]
    async fn process_commits_and_marks_processed() {
        let (store, processor, session, message) = harness().await;
        let outcome = processor
            .process(
                &session,
                &message,
                "mem-1",
                &reply(
                    "<memory><observation type=\"discovery\"><title>T</title>\
                     <narrative>N</narrative><fact>f1</fact></observation></memory>",
                    90,
                ),
            )
            .await
            .unwrap();

        assert_eq!(outcome.observation_ids.len(), 1);
        assert!(!outcome.needs_vector_repair);

        let obs = store
            .observation(outcome.observation_ids[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(obs.title, "T");
        assert_eq!(obs.narrative.as_deref(), Some("N"));
        assert_eq!(obs.facts, vec!["f1"]);
        assert_eq!(obs.visibility, Visibility::Project);
        assert_eq!(obs.agent, "legacy");
        assert_eq!(obs.discovery_tokens, 90);
        // The observation carries the message's original timestamp.
        assert_eq!(obs.created_at_epoch, message.created_at_epoch);

        let row = store.pending_message(message.id).await.unwrap().unwrap();
        assert_eq!(row.status, claude_mem_schema::PendingStatus::Processed);
    }

    #[tokio::test]
    async fn discovery_tokens_split_across_observations() {
        let (store, processor, session, message) = harness().await;
        let outcome = processor
            .process(
                &session,
                &message,
                "mem-1",
                &reply(
                    "<memory>\
                     <observation type=\"decision\"><title>a</title></observation>\
                     <observation type=\"change\"><title>b</title></observation>\
                     <observation type=\"change\"><title>c</title></observation>\
                     </memory>",
                    100,
                ),
            )
            .await
            .unwrap();
        let rows = store
            .observations_by_ids(outcome.observation_ids)
            .await
            .unwrap();
        let mut tokens: Vec<i64> = rows.iter().map(|o| o.discovery_tokens).collect();
        tokens.sort_unstable();
        assert_eq!(tokens, vec![33, 33, 34]);
    }

    #[tokio::test]
    async fn empty_response_fails_the_message_without_retry() {
        let (store, processor, session, message) = harness().await;
        let outcome = processor
            .process(&session, &message, "mem-1", &reply("nothing useful", 10))
            .await
            .unwrap();
        assert!(outcome.observation_ids.is_empty());

        let row = store.pending_message(message.id).await.unwrap().unwrap();
        assert_eq!(row.status, claude_mem_schema::PendingStatus::Failed);
    }

    #[tokio::test]
    async fn summary_alone_satisfies_the_commit() {
        let (store, processor, session, message) = harness().await;
        let outcome = processor
            .process(
                &session,
                &message,
                "mem-1",
                &reply(
                    "<summary><request>r</request><completed>done</completed></summary>",
                    10,
                ),
            )
            .await
            .unwrap();
        assert!(outcome.observation_ids.is_empty());
        let summary_id = outcome.summary_id.unwrap();
        let summaries = store.summaries_by_ids(vec![summary_id]).await.unwrap();
        assert_eq!(summaries[0].completed.as_deref(), Some("done"));

        let row = store.pending_message(message.id).await.unwrap().unwrap();
        assert_eq!(row.status, claude_mem_schema::PendingStatus::Processed);
    }
}

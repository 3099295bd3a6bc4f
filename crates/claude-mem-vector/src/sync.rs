//! Store-to-vector synchronization.
//!
//! The store is authoritative; the vector collection mirrors it. Writes sync
//! row-by-row after each commit, and `ensure_backfilled` repairs any drift by
//! diffing document ids against store ids and emitting the missing rows in
//! batches. Backfill failures abort loudly; a partial mirror that reports
//! success would poison search results.

use std::collections::HashSet;
use std::sync::Arc;

use claude_mem_schema::{Observation, SessionSummary, UserPromptRow};
use claude_mem_store::Store;
use tracing::{info, warn};

use crate::docs::{observation_documents, parse_doc_id, prompt_document, summary_documents};
use crate::{DocType, VectorDocument, VectorError, VectorIndex};

const BACKFILL_BATCH: usize = 100;
const LIST_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub observations_added: usize,
    pub summaries_added: usize,
    pub prompts_added: usize,
}

impl BackfillReport {
    pub fn total(&self) -> usize {
        self.observations_added + self.summaries_added + self.prompts_added
    }
}

#[derive(Clone)]
pub struct VectorSync {
    index: Arc<dyn VectorIndex>,
    store: Store,
}

impl VectorSync {
    pub fn new(index: Arc<dyn VectorIndex>, store: Store) -> Self {
        Self { index, store }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub async fn sync_observation(&self, obs: &Observation) -> Result<(), VectorError> {
        self.index
            .add_documents(&obs.project, &observation_documents(obs))
            .await
    }

    pub async fn sync_summary(&self, summary: &SessionSummary) -> Result<(), VectorError> {
        self.index
            .add_documents(&summary.project, &summary_documents(summary))
            .await
    }

    pub async fn sync_prompt(
        &self,
        prompt: &UserPromptRow,
        project: &str,
    ) -> Result<(), VectorError> {
        let Some(doc) = prompt_document(prompt, project) else {
            return Ok(());
        };
        self.index.add_documents(project, &[doc]).await
    }

    /// Bring the project's collection up to date with the store: enumerate
    /// existing document ids, partition by doc type, and emit documents for
    /// every store row whose id is missing.
    pub async fn ensure_backfilled(&self, project: &str) -> Result<BackfillReport, VectorError> {
        self.index.ensure_collection(project).await?;

        let existing = self.index.list_document_ids(project, LIST_PAGE_SIZE).await?;
        let mut have_observations = HashSet::new();
        let mut have_summaries = HashSet::new();
        let mut have_prompts = HashSet::new();
        for doc_id in &existing {
            match parse_doc_id(doc_id) {
                Some((DocType::Observation, id)) => {
                    have_observations.insert(id);
                }
                Some((DocType::SessionSummary, id)) => {
                    have_summaries.insert(id);
                }
                Some((DocType::UserPrompt, id)) => {
                    have_prompts.insert(id);
                }
                None => warn!(doc_id, "unrecognized vector document id, skipping"),
            }
        }

        let projects = vec![project.to_string()];
        let mut report = BackfillReport::default();

        let missing_observations: Vec<i64> = self
            .store
            .observation_ids_for_projects(projects.clone())
            .await?
            .into_iter()
            .filter(|id| !have_observations.contains(id))
            .collect();
        let observations = self.store.observations_by_ids(missing_observations).await?;
        report.observations_added = observations.len();
        let docs: Vec<VectorDocument> = observations
            .iter()
            .flat_map(observation_documents)
            .collect();
        self.add_batched(project, docs).await?;

        let missing_summaries: Vec<i64> = self
            .store
            .summary_ids_for_projects(projects.clone())
            .await?
            .into_iter()
            .filter(|id| !have_summaries.contains(id))
            .collect();
        let summaries = self.store.summaries_by_ids(missing_summaries).await?;
        report.summaries_added = summaries.len();
        let docs: Vec<VectorDocument> = summaries.iter().flat_map(summary_documents).collect();
        self.add_batched(project, docs).await?;

        let missing_prompts: Vec<i64> = self
            .store
            .prompt_ids_for_projects(projects)
            .await?
            .into_iter()
            .filter(|id| !have_prompts.contains(id))
            .collect();
        let prompts = self.store.prompts_by_ids(missing_prompts).await?;
        report.prompts_added = prompts.len();
        let docs: Vec<VectorDocument> = prompts
            .iter()
            .filter_map(|p| prompt_document(p, project))
            .collect();
        self.add_batched(project, docs).await?;

        if report.total() > 0 {
            info!(
                project,
                observations = report.observations_added,
                summaries = report.summaries_added,
                prompts = report.prompts_added,
                "vector backfill complete"
            );
        }
        Ok(report)
    }

    async fn add_batched(
        &self,
        project: &str,
        docs: Vec<VectorDocument>,
    ) -> Result<(), VectorError> {
        for chunk in docs.chunks(BACKFILL_BATCH) {
            self.index.add_documents(project, chunk).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EmbeddedIndex;
    use claude_mem_schema::{NewObservation, ObservationType};

    async fn store_with_observations(project: &str, count: usize) -> Store {
        let store = Store::open_in_memory().unwrap();
        for i in 0..count {
            let mut obs = NewObservation::basic(
                "mem-1",
                project,
                ObservationType::Discovery,
                format!("observation {i}"),
                (i as i64 + 1) * 10,
            );
            obs.narrative = Some(format!("narrative number {i}"));
            store.insert_observation(obs).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn backfill_emits_only_missing_rows() {
        let store = store_with_observations("p", 3).await;
        let index: Arc<dyn VectorIndex> = Arc::new(EmbeddedIndex::open_in_memory().unwrap());
        let sync = VectorSync::new(Arc::clone(&index), store.clone());

        // Pre-sync row 1 so the diff only has 2 and 3 left.
        let pre = store.observations_by_ids(vec![1]).await.unwrap();
        sync.sync_observation(&pre[0]).await.unwrap();

        let report = sync.ensure_backfilled("p").await.unwrap();
        assert_eq!(report.observations_added, 2);

        // Immediately re-running finds nothing to do.
        let report = sync.ensure_backfilled("p").await.unwrap();
        assert_eq!(report.total(), 0);
    }

    #[tokio::test]
    async fn backfill_covers_summaries_and_prompts() {
        let store = store_with_observations("p", 1).await;
        store
            .create_session_if_absent("s1", "p", None, 1)
            .await
            .unwrap();
        store
            .append_user_prompt("s1", "find the bug", None, None, 2)
            .await
            .unwrap();
        store
            .insert_summary(claude_mem_schema::NewSessionSummary {
                memory_session_id: "mem-1".into(),
                project: "p".into(),
                request: Some("requested".into()),
                investigated: None,
                learned: None,
                completed: None,
                next_steps: None,
                notes: None,
                prompt_number: None,
                agent: "legacy".into(),
                department: "default".into(),
                visibility: claude_mem_schema::Visibility::Project,
                created_at_epoch: 3,
            })
            .await
            .unwrap();

        let index: Arc<dyn VectorIndex> = Arc::new(EmbeddedIndex::open_in_memory().unwrap());
        let sync = VectorSync::new(Arc::clone(&index), store);
        let report = sync.ensure_backfilled("p").await.unwrap();
        assert_eq!(report.observations_added, 1);
        assert_eq!(report.summaries_added, 1);
        assert_eq!(report.prompts_added, 1);

        let ids = index.list_document_ids("p", 100).await.unwrap();
        assert!(ids.iter().any(|id| id.starts_with("obs_")));
        assert!(ids.iter().any(|id| id.starts_with("summary_")));
        assert!(ids.iter().any(|id| id.starts_with("prompt_")));
    }

    #[tokio::test]
    async fn subset_invariant_holds_after_backfill() {
        let store = store_with_observations("p", 2).await;
        let index: Arc<dyn VectorIndex> = Arc::new(EmbeddedIndex::open_in_memory().unwrap());
        let sync = VectorSync::new(Arc::clone(&index), store.clone());
        sync.ensure_backfilled("p").await.unwrap();

        let store_ids: HashSet<i64> = store
            .observation_ids_for_projects(vec!["p".into()])
            .await
            .unwrap()
            .into_iter()
            .collect();
        for doc_id in index.list_document_ids("p", 100).await.unwrap() {
            let (doc_type, id) = parse_doc_id(&doc_id).unwrap();
            if doc_type == DocType::Observation {
                assert!(store_ids.contains(&id));
            }
        }
    }
}

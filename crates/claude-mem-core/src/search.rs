//! Hybrid search, the timeline, and context-block rendering.
//!
//! A search combines an optional vector stage with structured filters that
//! always apply: the project filter expands through registered aliases, and
//! the caller's visibility context is enforced on every row. With a query,
//! results come back in vector-distance order; without one, newest first.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use claude_mem_schema::{AgentRecord, Observation, ObservationType, SessionSummary, UserPromptRow};
use claude_mem_schema::modes::Mode;
use claude_mem_store::{ObservationFilter, Store};
use claude_mem_vector::{DocType, VectorIndex};
use tracing::warn;

use crate::CoreError;

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: Option<String>,
    pub project: Option<String>,
    pub kinds: Vec<ObservationType>,
    pub concepts: Vec<String>,
    pub file_substring: Option<String>,
    pub from_epoch: Option<i64>,
    pub to_epoch: Option<i64>,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy)]
pub enum TimelineAnchor {
    ObservationId(i64),
    Epoch(i64),
}

#[derive(Debug, Clone)]
pub enum TimelineEntry {
    Observation(Observation),
    Summary(SessionSummary),
    Prompt(UserPromptRow),
}

impl TimelineEntry {
    pub fn epoch(&self) -> i64 {
        match self {
            TimelineEntry::Observation(o) => o.created_at_epoch,
            TimelineEntry::Summary(s) => s.created_at_epoch,
            TimelineEntry::Prompt(p) => p.created_at_epoch,
        }
    }
}

#[derive(Clone)]
pub struct SearchEngine {
    store: Store,
    index: Arc<dyn VectorIndex>,
    recency_days: i64,
    alias_cap: usize,
}

impl SearchEngine {
    pub fn new(store: Store, index: Arc<dyn VectorIndex>, recency_days: i64, alias_cap: usize) -> Self {
        Self {
            store,
            index,
            recency_days,
            alias_cap,
        }
    }

    async fn expand_projects(&self, project: Option<&str>) -> Result<Vec<String>, CoreError> {
        match project {
            Some(p) => Ok(self.store.projects_with_aliases(p, self.alias_cap).await?),
            None => Ok(Vec::new()),
        }
    }

    fn visibility_of(agent: Option<&AgentRecord>) -> (Option<String>, Option<String>) {
        match agent {
            Some(agent) => (Some(agent.id.clone()), Some(agent.department.clone())),
            None => (None, None),
        }
    }

    /// Ranked, deduplicated store ids from the vector stage. Duplicates from
    /// one record's several documents collapse onto the best distance.
    async fn vector_stage(
        &self,
        projects: &[String],
        query: &str,
        limit: usize,
    ) -> Result<Vec<i64>, CoreError> {
        let mut best: HashMap<i64, f64> = HashMap::new();
        for project in projects {
            let hits = match self
                .index
                .query(project, query, limit.saturating_mul(4).max(8), Some(DocType::Observation))
                .await
            {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(project, error = %e, "vector query failed, structured-only results");
                    continue;
                }
            };
            for hit in hits {
                let entry = best.entry(hit.metadata.sqlite_id).or_insert(hit.distance);
                if hit.distance < *entry {
                    *entry = hit.distance;
                }
            }
        }
        let mut ranked: Vec<(i64, f64)> = best.into_iter().collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(ranked.into_iter().map(|(id, _)| id).collect())
    }

    pub async fn search(
        &self,
        request: &SearchRequest,
        agent: Option<&AgentRecord>,
    ) -> Result<Vec<Observation>, CoreError> {
        let projects = self.expand_projects(request.project.as_deref()).await?;
        let (agent_id, department) = Self::visibility_of(agent);
        let limit = if request.limit == 0 { 20 } else { request.limit };

        let ranked = match request.query.as_deref().filter(|q| !q.trim().is_empty()) {
            Some(query) if !projects.is_empty() => {
                Some(self.vector_stage(&projects, query, limit).await?)
            }
            Some(_) | None => None,
        };

        let mut from_epoch = request.from_epoch;
        if self.recency_days > 0 {
            let cutoff = claude_mem_schema::epoch_millis_now() - self.recency_days * DAY_MILLIS;
            from_epoch = Some(from_epoch.map_or(cutoff, |f| f.max(cutoff)));
        }

        let filter = ObservationFilter {
            projects,
            kinds: request.kinds.clone(),
            concepts: request.concepts.clone(),
            file_substring: request.file_substring.clone(),
            from_epoch,
            to_epoch: request.to_epoch,
            ids: ranked.clone(),
            agent_id,
            department,
            limit: if ranked.is_some() { None } else { Some(limit) },
        };
        let rows = self.store.query_observations(filter).await?;

        match ranked {
            // Intersect with the vector ranking, preserving its order.
            Some(ranked_ids) => {
                let by_id: HashMap<i64, Observation> =
                    rows.into_iter().map(|o| (o.id, o)).collect();
                let mut ordered: Vec<Observation> = ranked_ids
                    .into_iter()
                    .filter_map(|id| by_id.get(&id).cloned())
                    .collect();
                ordered.truncate(limit);
                Ok(ordered)
            }
            None => Ok(rows),
        }
    }

    pub async fn observations_by_ids(
        &self,
        ids: Vec<i64>,
        agent: Option<&AgentRecord>,
    ) -> Result<Vec<Observation>, CoreError> {
        let (agent_id, department) = Self::visibility_of(agent);
        let filter = ObservationFilter {
            ids: Some(ids),
            agent_id,
            department,
            ..Default::default()
        };
        Ok(self.store.query_observations(filter).await?)
    }

    /// The window spans from the `before`-th observation older than the
    /// anchor to the `after`-th newer one; prompts and summaries falling
    /// inside ride along, merged chronologically.
    pub async fn timeline(
        &self,
        anchor: TimelineAnchor,
        before: usize,
        after: usize,
        project: Option<&str>,
        agent: Option<&AgentRecord>,
    ) -> Result<Vec<TimelineEntry>, CoreError> {
        let anchor_epoch = match anchor {
            TimelineAnchor::Epoch(epoch) => epoch,
            TimelineAnchor::ObservationId(id) => self
                .store
                .observation(id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("observation {id}")))?
                .created_at_epoch,
        };
        let projects = self.expand_projects(project).await?;
        let from = self
            .store
            .timeline_boundary_epoch(projects.clone(), anchor_epoch, before, true)
            .await?;
        let to = self
            .store
            .timeline_boundary_epoch(projects.clone(), anchor_epoch, after, false)
            .await?;

        let (agent_id, department) = Self::visibility_of(agent);
        let observations = self
            .store
            .query_observations(ObservationFilter {
                projects: projects.clone(),
                from_epoch: Some(from),
                to_epoch: Some(to),
                agent_id: agent_id.clone(),
                department: department.clone(),
                ..Default::default()
            })
            .await?;
        let summaries = self
            .store
            .summaries_between(projects.clone(), from, to, agent_id, department)
            .await?;
        let prompts = self.store.prompts_between(projects, from, to).await?;

        let mut entries: Vec<TimelineEntry> = observations
            .into_iter()
            .map(TimelineEntry::Observation)
            .chain(summaries.into_iter().map(TimelineEntry::Summary))
            .chain(prompts.into_iter().map(TimelineEntry::Prompt))
            .collect();
        entries.sort_by_key(TimelineEntry::epoch);
        Ok(entries)
    }

    /// The context block injected at session start: recent observations
    /// within the mode's vocabulary, a few summaries, and the last request.
    /// Deterministic for a given store state.
    pub async fn context_block(
        &self,
        project: &str,
        mode: &Mode,
        observation_count: usize,
        summary_count: usize,
        agent: Option<&AgentRecord>,
    ) -> Result<String, CoreError> {
        let projects = self.expand_projects(Some(project)).await?;
        let (agent_id, department) = Self::visibility_of(agent);

        let kinds: Vec<ObservationType> = mode
            .observation_types
            .iter()
            .filter_map(|t| ObservationType::parse(t))
            .collect();
        let observations = self
            .store
            .query_observations(ObservationFilter {
                projects: projects.clone(),
                kinds,
                agent_id: agent_id.clone(),
                department: department.clone(),
                limit: Some(observation_count),
                ..Default::default()
            })
            .await?;
        let summaries = self
            .store
            .recent_summaries(projects.clone(), agent_id, department, summary_count)
            .await?;
        let last_prompt = self.store.last_prompt_for_projects(projects).await?;

        let mut out = format!("# Project memory: {project}\n");
        if observations.is_empty() && summaries.is_empty() && last_prompt.is_none() {
            out.push_str("\nNo recorded history yet.\n");
            return Ok(out);
        }
        if !observations.is_empty() {
            out.push_str("\n## Recent observations\n");
            for obs in &observations {
                out.push_str(&format!(
                    "- [{}] {} ({})\n",
                    obs.kind.as_str(),
                    obs.title,
                    format_epoch(obs.created_at_epoch)
                ));
                if let Some(subtitle) = &obs.subtitle {
                    out.push_str(&format!("  {subtitle}\n"));
                }
                for fact in &obs.facts {
                    out.push_str(&format!("  * {fact}\n"));
                }
            }
        }
        if !summaries.is_empty() {
            out.push_str("\n## Session summaries\n");
            for summary in &summaries {
                out.push_str(&format!("- {}\n", format_epoch(summary.created_at_epoch)));
                for (label, value) in [
                    ("request", &summary.request),
                    ("learned", &summary.learned),
                    ("completed", &summary.completed),
                    ("next steps", &summary.next_steps),
                ] {
                    if let Some(value) = value {
                        out.push_str(&format!("  {label}: {value}\n"));
                    }
                }
            }
        }
        if let Some(prompt) = last_prompt {
            out.push_str("\n## Last request\n");
            out.push_str(&format!("> {}\n", prompt.prompt_text));
        }
        Ok(out)
    }
}

fn format_epoch(epoch_millis: i64) -> String {
    match Utc.timestamp_millis_opt(epoch_millis).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
        None => epoch_millis.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claude_mem_schema::{NewObservation, Visibility};
    use claude_mem_vector::{EmbeddedIndex, VectorSync};

    async fn engine_with_store() -> (SearchEngine, Store, VectorSync) {
        let store = Store::open_in_memory().unwrap();
        let index: Arc<dyn VectorIndex> = Arc::new(EmbeddedIndex::open_in_memory().unwrap());
        let sync = VectorSync::new(Arc::clone(&index), store.clone());
        let engine = SearchEngine::new(store.clone(), index, 0, 20);
        (engine, store, sync)
    }

    fn obs(project: &str, title: &str, at: i64) -> NewObservation {
        let mut o = NewObservation::basic("mem-1", project, ObservationType::Discovery, title, at);
        o.narrative = Some(title.to_string());
        o
    }

    fn agent(id: &str, department: &str) -> AgentRecord {
        AgentRecord {
            id: id.into(),
            department: department.into(),
            permissions: "read,write".into(),
            api_key_prefix: "cm_aaaaaaaaa".into(),
            api_key_hash: "h".into(),
            created_at_epoch: 0,
            last_seen_at_epoch: None,
            expires_at_epoch: None,
            verified: true,
            revoked: false,
            failed_attempts: 0,
            locked_until_epoch: None,
            spawned_by: None,
            bead_id: None,
            role: None,
        }
    }

    #[tokio::test]
    async fn alias_expansion_matches_legacy_rows() {
        let (engine, store, _sync) = engine_with_store().await;
        store
            .register_alias("mem-claude", "github.com/u/mem-claude", 1)
            .await
            .unwrap();
        store.insert_observation(obs("mem-claude", "legacy row", 10)).await.unwrap();
        store
            .insert_observation(obs("github.com/u/mem-claude", "current row", 20))
            .await
            .unwrap();

        let results = engine
            .search(
                &SearchRequest {
                    project: Some("github.com/u/mem-claude".into()),
                    limit: 10,
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn visibility_tiers_enforced_per_caller() {
        let (engine, store, _sync) = engine_with_store().await;
        let mut private = obs("p", "private", 1);
        private.visibility = Visibility::Private;
        private.agent = "alice@h".into();
        private.department = "eng".into();
        let mut dept = obs("p", "department", 2);
        dept.visibility = Visibility::Department;
        dept.department = "eng".into();
        let project = obs("p", "project", 3);
        for o in [private, dept, project] {
            store.insert_observation(o).await.unwrap();
        }

        let request = SearchRequest {
            project: Some("p".into()),
            limit: 10,
            ..Default::default()
        };
        let bob = agent("bob@h", "eng");
        let carol = agent("carol@h", "mkt");

        assert_eq!(engine.search(&request, Some(&bob)).await.unwrap().len(), 2);
        assert_eq!(engine.search(&request, Some(&carol)).await.unwrap().len(), 1);
        assert_eq!(engine.search(&request, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn query_orders_by_vector_distance() {
        let (engine, store, sync) = engine_with_store().await;
        store
            .insert_observation(obs("p", "sqlite write ahead logging details", 10))
            .await
            .unwrap();
        store
            .insert_observation(obs("p", "unrelated kitchen recipe notes", 20))
            .await
            .unwrap();
        sync.ensure_backfilled("p").await.unwrap();

        let results = engine
            .search(
                &SearchRequest {
                    query: Some("sqlite write ahead logging".into()),
                    project: Some("p".into()),
                    limit: 10,
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].title, "sqlite write ahead logging details");
    }

    #[tokio::test]
    async fn without_query_results_are_newest_first() {
        let (engine, store, _sync) = engine_with_store().await;
        for at in [10, 30, 20] {
            store.insert_observation(obs("p", &format!("at {at}"), at)).await.unwrap();
        }
        let results = engine
            .search(
                &SearchRequest {
                    project: Some("p".into()),
                    limit: 2,
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].created_at_epoch, 30);
        assert_eq!(results[1].created_at_epoch, 20);
    }

    #[tokio::test]
    async fn timeline_window_matches_neighbor_counts() {
        let (engine, store, _sync) = engine_with_store().await;
        let mut anchor_id = 0;
        for at in [10, 20, 30, 40, 50] {
            let id = store
                .insert_observation(obs("p", &format!("at {at}"), at))
                .await
                .unwrap();
            if at == 30 {
                anchor_id = id;
            }
        }

        let entries = engine
            .timeline(
                TimelineAnchor::ObservationId(anchor_id),
                1,
                1,
                Some("p"),
                None,
            )
            .await
            .unwrap();
        let epochs: Vec<i64> = entries.iter().map(TimelineEntry::epoch).collect();
        assert_eq!(epochs, vec![20, 30, 40]);
    }

    #[tokio::test]
    async fn timeline_includes_prompts_and_summaries_in_window() {
        let (engine, store, _sync) = engine_with_store().await;
        for at in [10, 30, 50] {
            store.insert_observation(obs("p", &format!("at {at}"), at)).await.unwrap();
        }
        store.create_session_if_absent("s1", "p", None, 5).await.unwrap();
        store
            .append_user_prompt("s1", "mid-window prompt", None, None, 25)
            .await
            .unwrap();

        let entries = engine
            .timeline(TimelineAnchor::Epoch(30), 1, 1, Some("p"), None)
            .await
            .unwrap();
        assert!(entries
            .iter()
            .any(|e| matches!(e, TimelineEntry::Prompt(p) if p.prompt_text == "mid-window prompt")));
        // Chronological ordering holds across entry kinds.
        let epochs: Vec<i64> = entries.iter().map(TimelineEntry::epoch).collect();
        let mut sorted = epochs.clone();
        sorted.sort_unstable();
        assert_eq!(epochs, sorted);
    }

    #[tokio::test]
    async fn timeline_unknown_anchor_errors() {
        let (engine, _store, _sync) = engine_with_store().await;
        let err = engine
            .timeline(TimelineAnchor::ObservationId(404), 1, 1, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn context_block_is_deterministic_and_complete() {
        let (engine, store, _sync) = engine_with_store().await;
        let mut o = obs("p", "chose rusqlite", 10);
        o.kind = ObservationType::Decision;
        o.facts = vec!["bundled sqlite".into()];
        store.insert_observation(o).await.unwrap();
        store.create_session_if_absent("s1", "p", None, 5).await.unwrap();
        store
            .append_user_prompt("s1", "add the store", None, None, 20)
            .await
            .unwrap();

        let mode = Mode::default();
        let a = engine.context_block("p", &mode, 10, 3, None).await.unwrap();
        let b = engine.context_block("p", &mode, 10, 3, None).await.unwrap();
        assert_eq!(a, b);
        assert!(a.contains("chose rusqlite"));
        assert!(a.contains("bundled sqlite"));
        assert!(a.contains("add the store"));
        assert!(a.starts_with("# Project memory: p"));
    }

    #[tokio::test]
    async fn empty_context_block_says_so() {
        let (engine, _store, _sync) = engine_with_store().await;
        let text = engine
            .context_block("fresh", &Mode::default(), 10, 3, None)
            .await
            .unwrap();
        assert!(text.contains("No recorded history yet"));
    }

    #[tokio::test]
    async fn recency_filter_zero_is_unlimited() {
        let (engine, store, _sync) = engine_with_store().await;
        store.insert_observation(obs("p", "ancient", 10)).await.unwrap();
        let results = engine
            .search(
                &SearchRequest {
                    project: Some("p".into()),
                    limit: 10,
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn recency_filter_restricts_old_rows() {
        let store = Store::open_in_memory().unwrap();
        let index: Arc<dyn VectorIndex> = Arc::new(EmbeddedIndex::open_in_memory().unwrap());
        let engine = SearchEngine::new(store.clone(), index, 7, 20);

        store.insert_observation(obs("p", "ancient", 10)).await.unwrap();
        let mut fresh = obs("p", "fresh", claude_mem_schema::epoch_millis_now());
        fresh.created_at_epoch = claude_mem_schema::epoch_millis_now();
        store.insert_observation(fresh).await.unwrap();

        let results = engine
            .search(
                &SearchRequest {
                    project: Some("p".into()),
                    limit: 10,
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "fresh");
    }
}

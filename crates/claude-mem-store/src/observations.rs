//! Observation and summary persistence, including the atomic batch commit
//! that ties derived rows to their originating pending message.

use claude_mem_schema::{
    NewObservation, NewSessionSummary, Observation, ObservationType, SessionSummary,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;

use crate::rows::{row_to_observation, row_to_summary};
use crate::{Store, StoreError};

const OBSERVATION_COLS: &str = "id, memory_session_id, project, kind, title, subtitle, \
     narrative, text, facts, concepts, files_read, files_modified, prompt_number, \
     discovery_tokens, bead_id, agent, department, visibility, created_at_epoch";

const SUMMARY_COLS: &str = "id, memory_session_id, project, request, investigated, learned, \
     completed, next_steps, notes, prompt_number, agent, department, visibility, \
     created_at_epoch";

/// Structured filters for observation queries. `projects` is expected to be
/// alias-expanded already; visibility enforcement happens here so no caller
/// can forget it.
#[derive(Debug, Clone, Default)]
pub struct ObservationFilter {
    pub projects: Vec<String>,
    pub kinds: Vec<ObservationType>,
    /// Any-of membership over the concept set.
    pub concepts: Vec<String>,
    /// Substring match against either file list.
    pub file_substring: Option<String>,
    pub from_epoch: Option<i64>,
    pub to_epoch: Option<i64>,
    /// Restrict to these row ids (the vector stage's output).
    pub ids: Option<Vec<i64>>,
    /// Visibility context of the caller; `None` means unauthenticated.
    pub agent_id: Option<String>,
    pub department: Option<String>,
    pub limit: Option<usize>,
}

impl ObservationFilter {
    pub fn for_projects(projects: Vec<String>) -> Self {
        Self {
            projects,
            ..Default::default()
        }
    }

    fn build_where(&self, sql: &mut String, args: &mut Vec<Box<dyn rusqlite::ToSql>>) {
        sql.push_str(" WHERE 1=1");
        if !self.projects.is_empty() {
            sql.push_str(&format!(
                " AND project IN ({})",
                vec!["?"; self.projects.len()].join(",")
            ));
            for p in &self.projects {
                args.push(Box::new(p.clone()));
            }
        }
        if !self.kinds.is_empty() {
            sql.push_str(&format!(
                " AND kind IN ({})",
                vec!["?"; self.kinds.len()].join(",")
            ));
            for k in &self.kinds {
                args.push(Box::new(k.as_str().to_string()));
            }
        }
        if !self.concepts.is_empty() {
            // Concepts are stored as a JSON array of strings; membership is a
            // substring match against the serialized element.
            let clauses = vec!["concepts LIKE ?"; self.concepts.len()].join(" OR ");
            sql.push_str(&format!(" AND ({clauses})"));
            for c in &self.concepts {
                args.push(Box::new(format!("%{}%", json!(c))));
            }
        }
        if let Some(fragment) = &self.file_substring {
            sql.push_str(" AND (files_read LIKE ? OR files_modified LIKE ?)");
            let pattern = format!("%{fragment}%");
            args.push(Box::new(pattern.clone()));
            args.push(Box::new(pattern));
        }
        if let Some(from) = self.from_epoch {
            sql.push_str(" AND created_at_epoch >= ?");
            args.push(Box::new(from));
        }
        if let Some(to) = self.to_epoch {
            sql.push_str(" AND created_at_epoch <= ?");
            args.push(Box::new(to));
        }
        if let Some(ids) = &self.ids {
            if ids.is_empty() {
                sql.push_str(" AND 0=1");
            } else {
                sql.push_str(&format!(
                    " AND id IN ({})",
                    vec!["?"; ids.len()].join(",")
                ));
                for id in ids {
                    args.push(Box::new(*id));
                }
            }
        }
        self.push_visibility(sql, args);
    }

    fn push_visibility(&self, sql: &mut String, args: &mut Vec<Box<dyn rusqlite::ToSql>>) {
        match (&self.agent_id, &self.department) {
            (Some(agent), Some(department)) => {
                sql.push_str(
                    " AND (visibility IN ('public','project')
                       OR (visibility = 'department' AND department = ?)
                       OR (visibility = 'private' AND agent = ?))",
                );
                args.push(Box::new(department.clone()));
                args.push(Box::new(agent.clone()));
            }
            (Some(agent), None) => {
                sql.push_str(
                    " AND (visibility IN ('public','project')
                       OR (visibility = 'private' AND agent = ?))",
                );
                args.push(Box::new(agent.clone()));
            }
            _ => {
                sql.push_str(" AND visibility IN ('public','project')");
            }
        }
    }
}

fn insert_observation_tx(
    conn: &Connection,
    obs: &NewObservation,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO observations
            (memory_session_id, project, kind, title, subtitle, narrative, text,
             facts, concepts, files_read, files_modified, prompt_number,
             discovery_tokens, bead_id, agent, department, visibility, created_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            obs.memory_session_id,
            obs.project,
            obs.kind.as_str(),
            obs.title,
            obs.subtitle,
            obs.narrative,
            obs.text,
            serde_json::to_string(&obs.facts)?,
            serde_json::to_string(&obs.concepts)?,
            serde_json::to_string(&obs.files_read)?,
            serde_json::to_string(&obs.files_modified)?,
            obs.prompt_number,
            obs.discovery_tokens,
            obs.bead_id,
            obs.agent,
            obs.department,
            obs.visibility.as_str(),
            obs.created_at_epoch
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_summary_tx(
    conn: &Connection,
    summary: &NewSessionSummary,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO session_summaries
            (memory_session_id, project, request, investigated, learned, completed,
             next_steps, notes, prompt_number, agent, department, visibility,
             created_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            summary.memory_session_id,
            summary.project,
            summary.request,
            summary.investigated,
            summary.learned,
            summary.completed,
            summary.next_steps,
            summary.notes,
            summary.prompt_number,
            summary.agent,
            summary.department,
            summary.visibility.as_str(),
            summary.created_at_epoch
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Store {
    pub async fn insert_observation(&self, obs: NewObservation) -> Result<i64, StoreError> {
        self.with_conn(move |conn| insert_observation_tx(conn, &obs)).await
    }

    pub async fn insert_summary(&self, summary: NewSessionSummary) -> Result<i64, StoreError> {
        self.with_conn(move |conn| insert_summary_tx(conn, &summary)).await
    }

    /// The consistency hinge: insert the parsed observations and optional
    /// summary, and flip the originating pending message to `processed`, in
    /// one transaction. Nothing becomes readable unless all of it does.
    pub async fn commit_batch(
        &self,
        pending_id: i64,
        observations: Vec<NewObservation>,
        summary: Option<NewSessionSummary>,
        now_epoch: i64,
    ) -> Result<(Vec<i64>, Option<i64>), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut observation_ids = Vec::with_capacity(observations.len());
            for obs in &observations {
                observation_ids.push(insert_observation_tx(&tx, obs)?);
            }
            let summary_id = match &summary {
                Some(s) => Some(insert_summary_tx(&tx, s)?),
                None => None,
            };
            let updated = tx.execute(
                "UPDATE pending_messages
                 SET status = 'processed', completed_at_epoch = ?1,
                     tool_input = NULL, tool_response = NULL
                 WHERE id = ?2 AND status = 'processing'",
                params![now_epoch, pending_id],
            )?;
            if updated == 0 {
                return Err(StoreError::InvalidState(format!(
                    "pending message {pending_id} is not processing"
                )));
            }
            tx.commit()?;
            Ok((observation_ids, summary_id))
        })
        .await
    }

    pub async fn observation(&self, id: i64) -> Result<Option<Observation>, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {OBSERVATION_COLS} FROM observations WHERE id = ?1"),
                    params![id],
                    row_to_observation,
                )
                .optional()?)
        })
        .await
    }

    pub async fn observations_by_ids(
        &self,
        ids: Vec<i64>,
    ) -> Result<Vec<Observation>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| {
            let placeholders = vec!["?"; ids.len()].join(",");
            let mut stmt = conn.prepare(&format!(
                "SELECT {OBSERVATION_COLS} FROM observations WHERE id IN ({placeholders})"
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(ids), row_to_observation)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Structured query, newest first unless the caller restricts to an id
    /// list (in which case ordering is the caller's concern).
    pub async fn query_observations(
        &self,
        filter: ObservationFilter,
    ) -> Result<Vec<Observation>, StoreError> {
        self.with_conn(move |conn| {
            let mut sql = format!("SELECT {OBSERVATION_COLS} FROM observations");
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            filter.build_where(&mut sql, &mut args);
            sql.push_str(" ORDER BY created_at_epoch DESC, id DESC");
            if let Some(limit) = filter.limit {
                sql.push_str(" LIMIT ?");
                args.push(Box::new(limit as i64));
            }
            let mut stmt = conn.prepare(&sql)?;
            let params = rusqlite::params_from_iter(args.iter().map(|b| b.as_ref()));
            let rows = stmt.query_map(params, row_to_observation)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn recent_observations(
        &self,
        projects: Vec<String>,
        limit: usize,
    ) -> Result<Vec<Observation>, StoreError> {
        let mut filter = ObservationFilter::for_projects(projects);
        filter.limit = Some(limit);
        self.query_observations(filter).await
    }

    pub async fn summaries_by_ids(
        &self,
        ids: Vec<i64>,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| {
            let placeholders = vec!["?"; ids.len()].join(",");
            let mut stmt = conn.prepare(&format!(
                "SELECT {SUMMARY_COLS} FROM session_summaries WHERE id IN ({placeholders})"
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(ids), row_to_summary)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn recent_summaries(
        &self,
        projects: Vec<String>,
        agent_id: Option<String>,
        department: Option<String>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        self.with_conn(move |conn| {
            let mut sql = format!("SELECT {SUMMARY_COLS} FROM session_summaries WHERE 1=1");
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if !projects.is_empty() {
                sql.push_str(&format!(
                    " AND project IN ({})",
                    vec!["?"; projects.len()].join(",")
                ));
                for p in &projects {
                    args.push(Box::new(p.clone()));
                }
            }
            match (&agent_id, &department) {
                (Some(agent), Some(dept)) => {
                    sql.push_str(
                        " AND (visibility IN ('public','project')
                           OR (visibility = 'department' AND department = ?)
                           OR (visibility = 'private' AND agent = ?))",
                    );
                    args.push(Box::new(dept.clone()));
                    args.push(Box::new(agent.clone()));
                }
                _ => sql.push_str(" AND visibility IN ('public','project')"),
            }
            sql.push_str(" ORDER BY created_at_epoch DESC, id DESC LIMIT ?");
            args.push(Box::new(limit as i64));
            let mut stmt = conn.prepare(&sql)?;
            let params = rusqlite::params_from_iter(args.iter().map(|b| b.as_ref()));
            let rows = stmt.query_map(params, row_to_summary)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Summaries inside a closed epoch window, visibility-filtered, oldest
    /// first. Used by the timeline.
    pub async fn summaries_between(
        &self,
        projects: Vec<String>,
        from_epoch: i64,
        to_epoch: i64,
        agent_id: Option<String>,
        department: Option<String>,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        self.with_conn(move |conn| {
            let mut sql = format!(
                "SELECT {SUMMARY_COLS} FROM session_summaries
                 WHERE created_at_epoch >= ? AND created_at_epoch <= ?"
            );
            let mut args: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(from_epoch), Box::new(to_epoch)];
            if !projects.is_empty() {
                sql.push_str(&format!(
                    " AND project IN ({})",
                    vec!["?"; projects.len()].join(",")
                ));
                for p in &projects {
                    args.push(Box::new(p.clone()));
                }
            }
            match (&agent_id, &department) {
                (Some(agent), Some(dept)) => {
                    sql.push_str(
                        " AND (visibility IN ('public','project')
                           OR (visibility = 'department' AND department = ?)
                           OR (visibility = 'private' AND agent = ?))",
                    );
                    args.push(Box::new(dept.clone()));
                    args.push(Box::new(agent.clone()));
                }
                _ => sql.push_str(" AND visibility IN ('public','project')"),
            }
            sql.push_str(" ORDER BY created_at_epoch, id");
            let mut stmt = conn.prepare(&sql)?;
            let params = rusqlite::params_from_iter(args.iter().map(|b| b.as_ref()));
            let rows = stmt.query_map(params, row_to_summary)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Ids of observation rows for the given projects, for vector backfill
    /// diffing.
    pub async fn observation_ids_for_projects(
        &self,
        projects: Vec<String>,
    ) -> Result<Vec<i64>, StoreError> {
        self.ids_for_projects("observations", projects).await
    }

    pub async fn summary_ids_for_projects(
        &self,
        projects: Vec<String>,
    ) -> Result<Vec<i64>, StoreError> {
        self.ids_for_projects("session_summaries", projects).await
    }

    pub async fn prompt_ids_for_projects(
        &self,
        projects: Vec<String>,
    ) -> Result<Vec<i64>, StoreError> {
        if projects.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| {
            let placeholders = vec!["?"; projects.len()].join(",");
            let mut stmt = conn.prepare(&format!(
                "SELECT p.id FROM user_prompts p
                 JOIN sessions s ON s.content_session_id = p.content_session_id
                 WHERE s.project IN ({placeholders})"
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(projects), |r| r.get(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn ids_for_projects(
        &self,
        table: &'static str,
        projects: Vec<String>,
    ) -> Result<Vec<i64>, StoreError> {
        if projects.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| {
            let placeholders = vec!["?"; projects.len()].join(",");
            let mut stmt = conn.prepare(&format!(
                "SELECT id FROM {table} WHERE project IN ({placeholders})"
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(projects), |r| r.get(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Epoch of the `n`-th observation strictly older (or newer) than the
    /// anchor epoch within the given projects. Falls back to the anchor when
    /// fewer rows exist.
    pub async fn timeline_boundary_epoch(
        &self,
        projects: Vec<String>,
        anchor_epoch: i64,
        n: usize,
        older: bool,
    ) -> Result<i64, StoreError> {
        if n == 0 {
            return Ok(anchor_epoch);
        }
        self.with_conn(move |conn| {
            let project_clause = if projects.is_empty() {
                String::new()
            } else {
                format!(" AND project IN ({})", vec!["?"; projects.len()].join(","))
            };
            let (cmp, dir) = if older { ("<", "DESC") } else { (">", "ASC") };
            let sql = format!(
                "SELECT created_at_epoch FROM observations
                 WHERE created_at_epoch {cmp} ?{project_clause}
                 ORDER BY created_at_epoch {dir}
                 LIMIT 1 OFFSET ?"
            );
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(anchor_epoch)];
            for p in &projects {
                args.push(Box::new(p.clone()));
            }
            args.push(Box::new(n as i64 - 1));
            let params = rusqlite::params_from_iter(args.iter().map(|b| b.as_ref()));
            let epoch: Option<i64> = conn.query_row(&sql, params, |r| r.get(0)).optional()?;
            Ok(epoch.unwrap_or(anchor_epoch))
        })
        .await
    }
}

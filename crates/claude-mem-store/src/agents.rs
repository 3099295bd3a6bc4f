//! Agent records, project aliases, the audit log, and the aggregate queries
//! behind `/api/metrics`.

use std::collections::HashMap;

use claude_mem_schema::AgentRecord;
use rusqlite::{params, OptionalExtension};

use crate::rows::row_to_agent;
use crate::{Store, StoreError};

const AGENT_COLS: &str = "id, department, permissions, api_key_prefix, api_key_hash, \
     created_at_epoch, last_seen_at_epoch, expires_at_epoch, verified, revoked, \
     failed_attempts, locked_until_epoch, spawned_by, bead_id, role";

#[derive(Debug, Clone)]
pub struct NewAgent {
    pub id: String,
    pub department: String,
    pub permissions: String,
    pub api_key_prefix: String,
    pub api_key_hash: String,
    pub expires_at_epoch: Option<i64>,
    pub spawned_by: Option<String>,
    pub bead_id: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewAuditEntry {
    pub agent_id: String,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub details: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentMetrics {
    pub total: i64,
    pub verified: i64,
    pub locked: i64,
    pub active_24h: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AliasMetrics {
    pub total: i64,
    pub per_project_avg: f64,
    pub per_project_max: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ObservationMetrics {
    pub total: i64,
    pub by_visibility: HashMap<String, i64>,
}

impl Store {
    /// Insert the agent, or return the existing record for its id. The
    /// caller (the registry) decides whether an existing record means
    /// success or a conflict.
    pub async fn register_or_get_agent(
        &self,
        agent: NewAgent,
        now_epoch: i64,
    ) -> Result<(AgentRecord, bool), StoreError> {
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO agents
                    (id, department, permissions, api_key_prefix, api_key_hash,
                     created_at_epoch, expires_at_epoch, spawned_by, bead_id, role)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    agent.id,
                    agent.department,
                    agent.permissions,
                    agent.api_key_prefix,
                    agent.api_key_hash,
                    now_epoch,
                    agent.expires_at_epoch,
                    agent.spawned_by,
                    agent.bead_id,
                    agent.role
                ],
            )?;
            let record = conn.query_row(
                &format!("SELECT {AGENT_COLS} FROM agents WHERE id = ?1"),
                params![agent.id],
                row_to_agent,
            )?;
            Ok((record, inserted > 0))
        })
        .await
    }

    pub async fn agent(&self, id: &str) -> Result<Option<AgentRecord>, StoreError> {
        let id = id.to_owned();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {AGENT_COLS} FROM agents WHERE id = ?1"),
                    params![id],
                    row_to_agent,
                )
                .optional()?)
        })
        .await
    }

    /// O(1) auth path: the first 12 key characters are indexed.
    pub async fn agent_by_key_prefix(
        &self,
        prefix: &str,
    ) -> Result<Option<AgentRecord>, StoreError> {
        let prefix = prefix.to_owned();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {AGENT_COLS} FROM agents
                         WHERE api_key_prefix = ?1 AND revoked = 0"
                    ),
                    params![prefix],
                    row_to_agent,
                )
                .optional()?)
        })
        .await
    }

    /// A successful verification clears the failure counters.
    pub async fn record_verify_success(&self, id: &str, now_epoch: i64) -> Result<(), StoreError> {
        let id = id.to_owned();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE agents
                 SET verified = 1, failed_attempts = 0, locked_until_epoch = NULL,
                     last_seen_at_epoch = ?1
                 WHERE id = ?2",
                params![now_epoch, id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("agent {id}")));
            }
            Ok(())
        })
        .await
    }

    /// Bump the failure counter; at `max_attempts` the agent locks until
    /// `now + lockout`. Returns the post-update record.
    pub async fn record_verify_failure(
        &self,
        id: &str,
        max_attempts: i64,
        lockout_millis: i64,
        now_epoch: i64,
    ) -> Result<AgentRecord, StoreError> {
        let id = id.to_owned();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let updated = tx.execute(
                "UPDATE agents SET failed_attempts = failed_attempts + 1 WHERE id = ?1",
                params![id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("agent {id}")));
            }
            tx.execute(
                "UPDATE agents SET locked_until_epoch = ?1
                 WHERE id = ?2 AND failed_attempts >= ?3",
                params![now_epoch + lockout_millis, id, max_attempts],
            )?;
            let record = tx.query_row(
                &format!("SELECT {AGENT_COLS} FROM agents WHERE id = ?1"),
                params![id],
                row_to_agent,
            )?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    /// Swap in a fresh key. The old hash stops matching immediately.
    pub async fn rotate_agent_key(
        &self,
        id: &str,
        new_prefix: &str,
        new_hash: &str,
        new_expiry_epoch: Option<i64>,
        now_epoch: i64,
    ) -> Result<(), StoreError> {
        let id = id.to_owned();
        let new_prefix = new_prefix.to_owned();
        let new_hash = new_hash.to_owned();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE agents
                 SET api_key_prefix = ?1, api_key_hash = ?2, expires_at_epoch = ?3,
                     revoked = 0, failed_attempts = 0, locked_until_epoch = NULL,
                     last_seen_at_epoch = ?4
                 WHERE id = ?5",
                params![new_prefix, new_hash, new_expiry_epoch, now_epoch, id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("agent {id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn revoke_agent(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_owned();
        self.with_conn(move |conn| {
            let updated = conn.execute("UPDATE agents SET revoked = 1 WHERE id = ?1", params![id])?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("agent {id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn agent_count(&self) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM agents WHERE revoked = 0", [], |r| r.get(0))?)
        })
        .await
    }

    // ── aliases ──────────────────────────────────────────────────────────

    /// Record `(old, new)` once; duplicates and self-references are no-ops.
    pub async fn register_alias(
        &self,
        old_project: &str,
        new_project: &str,
        now_epoch: i64,
    ) -> Result<(), StoreError> {
        if old_project == new_project || old_project.is_empty() {
            return Ok(());
        }
        let old_project = old_project.to_owned();
        let new_project = new_project.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO project_aliases
                    (old_project, new_project, created_at_epoch)
                 VALUES (?1, ?2, ?3)",
                params![old_project, new_project, now_epoch],
            )?;
            Ok(())
        })
        .await
    }

    /// `[project, old names…]` without duplicates, capped. The project
    /// itself always leads.
    pub async fn projects_with_aliases(
        &self,
        project: &str,
        cap: usize,
    ) -> Result<Vec<String>, StoreError> {
        let project = project.to_owned();
        self.with_conn(move |conn| {
            let mut projects = vec![project.clone()];
            let mut stmt = conn.prepare(
                "SELECT old_project FROM project_aliases
                 WHERE new_project = ?1
                 ORDER BY created_at_epoch, id",
            )?;
            let rows = stmt.query_map(params![project], |r| r.get::<_, String>(0))?;
            for row in rows {
                let old = row?;
                if projects.len() >= cap.max(1) {
                    break;
                }
                if !projects.contains(&old) {
                    projects.push(old);
                }
            }
            Ok(projects)
        })
        .await
    }

    pub async fn cleanup_aliases_before(&self, epoch: i64) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM project_aliases WHERE created_at_epoch < ?1",
                params![epoch],
            )?)
        })
        .await
    }

    // ── audit log ────────────────────────────────────────────────────────

    pub async fn append_audit(
        &self,
        entry: NewAuditEntry,
        now_epoch: i64,
    ) -> Result<i64, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO audit_log
                    (agent_id, action, resource_type, resource_id, details, ip_address,
                     created_at_epoch)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.agent_id,
                    entry.action,
                    entry.resource_type,
                    entry.resource_id,
                    entry.details,
                    entry.ip_address,
                    now_epoch
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn count_audit_actions_since(
        &self,
        action: &str,
        since_epoch: i64,
    ) -> Result<i64, StoreError> {
        let action = action.to_owned();
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM audit_log WHERE action = ?1 AND created_at_epoch >= ?2",
                params![action, since_epoch],
                |r| r.get(0),
            )?)
        })
        .await
    }

    pub async fn recent_audit(
        &self,
        limit: usize,
    ) -> Result<Vec<claude_mem_schema::AuditLogEntry>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, agent_id, action, resource_type, resource_id, details,
                        ip_address, created_at_epoch
                 FROM audit_log ORDER BY created_at_epoch DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], crate::rows::row_to_audit)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    // ── metrics ──────────────────────────────────────────────────────────

    pub async fn agent_metrics(&self, now_epoch: i64) -> Result<AgentMetrics, StoreError> {
        self.with_conn(move |conn| {
            let day_ago = now_epoch - 24 * 60 * 60 * 1000;
            let total: i64 =
                conn.query_row("SELECT COUNT(*) FROM agents WHERE revoked = 0", [], |r| r.get(0))?;
            let verified: i64 = conn.query_row(
                "SELECT COUNT(*) FROM agents WHERE revoked = 0 AND verified = 1",
                [],
                |r| r.get(0),
            )?;
            let locked: i64 = conn.query_row(
                "SELECT COUNT(*) FROM agents WHERE revoked = 0 AND locked_until_epoch > ?1",
                params![now_epoch],
                |r| r.get(0),
            )?;
            let active_24h: i64 = conn.query_row(
                "SELECT COUNT(*) FROM agents WHERE revoked = 0 AND last_seen_at_epoch >= ?1",
                params![day_ago],
                |r| r.get(0),
            )?;
            Ok(AgentMetrics {
                total,
                verified,
                locked,
                active_24h,
            })
        })
        .await
    }

    pub async fn alias_metrics(&self) -> Result<AliasMetrics, StoreError> {
        self.with_conn(|conn| {
            let total: i64 =
                conn.query_row("SELECT COUNT(*) FROM project_aliases", [], |r| r.get(0))?;
            let (avg, max): (f64, i64) = conn.query_row(
                "SELECT COALESCE(AVG(n), 0.0), COALESCE(MAX(n), 0) FROM
                    (SELECT COUNT(*) AS n FROM project_aliases GROUP BY new_project)",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            Ok(AliasMetrics {
                total,
                per_project_avg: avg,
                per_project_max: max,
            })
        })
        .await
    }

    pub async fn observation_metrics(&self) -> Result<ObservationMetrics, StoreError> {
        self.with_conn(|conn| {
            let total: i64 =
                conn.query_row("SELECT COUNT(*) FROM observations", [], |r| r.get(0))?;
            let mut by_visibility = HashMap::new();
            let mut stmt =
                conn.prepare("SELECT visibility, COUNT(*) FROM observations GROUP BY visibility")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
            for row in rows {
                let (visibility, count) = row?;
                by_visibility.insert(visibility, count);
            }
            Ok(ObservationMetrics {
                total,
                by_visibility,
            })
        })
        .await
    }
}

//! Schema migrations.
//!
//! Each migration runs inside its own transaction and records its version in
//! `schema_migrations`. Migrations are idempotent against the *actual*
//! schema, not just the recorded version: historical builds double-wrote
//! version numbers for different migrations, so every step probes table and
//! column existence before acting and tolerates partial prior application.

use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;

struct Migration {
    version: i64,
    name: &'static str,
    apply: fn(&rusqlite::Transaction<'_>) -> rusqlite::Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "base tables",
        apply: base_tables,
    },
    Migration {
        version: 2,
        name: "user prompt full-text index",
        apply: prompt_fts,
    },
    Migration {
        version: 3,
        name: "agents and audit log",
        apply: agents_and_audit,
    },
    Migration {
        version: 4,
        name: "project aliases",
        apply: project_aliases,
    },
    Migration {
        version: 5,
        name: "multi-agent visibility",
        apply: multi_agent_visibility,
    },
    Migration {
        version: 6,
        name: "rename tokens to discovery_tokens",
        apply: rename_tokens,
    },
    Migration {
        version: 7,
        name: "queue retry bookkeeping",
        apply: queue_retry_bookkeeping,
    },
];

pub(crate) fn run_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at_epoch INTEGER NOT NULL
        );",
    )?;

    let applied: std::collections::HashSet<i64> = {
        let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        rows.filter_map(|r| r.ok()).collect()
    };

    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }
        let tx = conn.transaction()?;
        if let Err(source) = (migration.apply)(&tx) {
            // The Drop of `tx` rolls the partial migration back.
            return Err(StoreError::Migration {
                version: migration.version,
                name: migration.name,
                source,
            });
        }
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at_epoch) VALUES (?1, ?2)",
            rusqlite::params![
                migration.version,
                claude_mem_schema::epoch_millis_now()
            ],
        )
        .map_err(|source| StoreError::Migration {
            version: migration.version,
            name: migration.name,
            source,
        })?;
        tx.commit().map_err(|source| StoreError::Migration {
            version: migration.version,
            name: migration.name,
            source,
        })?;
        info!(version = migration.version, name = migration.name, "applied migration");
    }

    Ok(())
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type IN ('table','view') AND name = ?1",
        [table],
        |r| r.get(0),
    )
}

pub(crate) fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn column_is_not_null(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            let notnull: i64 = row.get(3)?;
            return Ok(notnull != 0);
        }
    }
    Ok(false)
}

fn table_sql_contains(conn: &Connection, table: &str, needle: &str) -> rusqlite::Result<bool> {
    let sql: Option<String> = {
        use rusqlite::OptionalExtension;
        conn.query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |r| r.get(0),
        )
        .optional()?
    };
    Ok(sql.is_some_and(|s| s.contains(needle)))
}

fn base_tables(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_session_id TEXT NOT NULL UNIQUE,
            memory_session_id TEXT UNIQUE,
            project TEXT NOT NULL,
            user_prompt TEXT,
            started_at_epoch INTEGER NOT NULL,
            completed_at_epoch INTEGER,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active','completed','failed')),
            prompt_counter INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS user_prompts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_session_id TEXT NOT NULL,
            prompt_number INTEGER NOT NULL,
            prompt_text TEXT NOT NULL,
            agent_id TEXT,
            sender_id TEXT,
            created_at_epoch INTEGER NOT NULL,
            UNIQUE (content_session_id, prompt_number)
        );

        CREATE TABLE IF NOT EXISTS pending_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_db_id INTEGER NOT NULL REFERENCES sessions(id),
            content_session_id TEXT NOT NULL,
            message_type TEXT NOT NULL
                CHECK (message_type IN ('observation','summarize')),
            tool_name TEXT,
            tool_input TEXT NOT NULL DEFAULT '',
            tool_response TEXT NOT NULL DEFAULT '',
            cwd TEXT,
            last_user_message TEXT,
            last_assistant_message TEXT,
            prompt_number INTEGER,
            bead_id TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending','processing','processed','failed')),
            created_at_epoch INTEGER NOT NULL,
            started_processing_at_epoch INTEGER,
            completed_at_epoch INTEGER,
            failed_at_epoch INTEGER
        );

        CREATE TABLE IF NOT EXISTS observations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            memory_session_id TEXT NOT NULL,
            project TEXT NOT NULL,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            subtitle TEXT,
            narrative TEXT,
            text TEXT,
            facts TEXT NOT NULL DEFAULT '[]',
            concepts TEXT NOT NULL DEFAULT '[]',
            files_read TEXT NOT NULL DEFAULT '[]',
            files_modified TEXT NOT NULL DEFAULT '[]',
            prompt_number INTEGER,
            tokens INTEGER NOT NULL DEFAULT 0,
            bead_id TEXT,
            created_at_epoch INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_observations_project
            ON observations(project, created_at_epoch DESC);

        CREATE TABLE IF NOT EXISTS session_summaries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            memory_session_id TEXT NOT NULL,
            project TEXT NOT NULL,
            request TEXT,
            investigated TEXT,
            learned TEXT,
            completed TEXT,
            next_steps TEXT,
            notes TEXT,
            prompt_number INTEGER,
            created_at_epoch INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_session_summaries_memory_session
            ON session_summaries(memory_session_id);

        CREATE TABLE IF NOT EXISTS conversation_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_session_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            UNIQUE (content_session_id, seq)
        );
        "#,
    )
}

fn prompt_fts(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
    if !table_exists(tx, "user_prompts_fts")? {
        tx.execute_batch(
            "CREATE VIRTUAL TABLE user_prompts_fts USING fts5(
                prompt_text,
                prompt_id UNINDEXED,
                content_session_id UNINDEXED
            );",
        )?;
    }
    Ok(())
}

fn agents_and_audit(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            department TEXT NOT NULL DEFAULT 'default',
            permissions TEXT NOT NULL DEFAULT 'read,write',
            api_key_prefix TEXT NOT NULL,
            api_key_hash TEXT NOT NULL UNIQUE,
            created_at_epoch INTEGER NOT NULL,
            last_seen_at_epoch INTEGER,
            expires_at_epoch INTEGER,
            verified INTEGER NOT NULL DEFAULT 0,
            revoked INTEGER NOT NULL DEFAULT 0,
            failed_attempts INTEGER NOT NULL DEFAULT 0,
            locked_until_epoch INTEGER,
            spawned_by TEXT,
            bead_id TEXT,
            role TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_agents_key_prefix ON agents(api_key_prefix);

        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id TEXT NOT NULL,
            action TEXT NOT NULL,
            resource_type TEXT,
            resource_id TEXT,
            details TEXT,
            ip_address TEXT,
            created_at_epoch INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_log_created
            ON audit_log(created_at_epoch DESC);
        CREATE INDEX IF NOT EXISTS idx_audit_log_action
            ON audit_log(action, created_at_epoch DESC);
        "#,
    )
}

fn project_aliases(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS project_aliases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            old_project TEXT NOT NULL,
            new_project TEXT NOT NULL,
            created_at_epoch INTEGER NOT NULL,
            UNIQUE (old_project, new_project)
        );
        CREATE INDEX IF NOT EXISTS idx_project_aliases_new
            ON project_aliases(new_project);
        "#,
    )
}

/// Adds agent/department/visibility columns, then rebuilds the observation
/// and summary tables so the visibility and kind vocabularies are enforced by
/// CHECK constraints. The rebuild also drops the accidental unique index on
/// `session_summaries.memory_session_id`; summaries repeat as checkpoints.
fn multi_agent_visibility(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
    for table in ["observations", "session_summaries"] {
        if !column_exists(tx, table, "agent")? {
            tx.execute_batch(&format!(
                "ALTER TABLE {table} ADD COLUMN agent TEXT NOT NULL DEFAULT 'legacy';"
            ))?;
        }
        if !column_exists(tx, table, "department")? {
            tx.execute_batch(&format!(
                "ALTER TABLE {table} ADD COLUMN department TEXT NOT NULL DEFAULT 'default';"
            ))?;
        }
        if !column_exists(tx, table, "visibility")? {
            tx.execute_batch(&format!(
                "ALTER TABLE {table} ADD COLUMN visibility TEXT NOT NULL DEFAULT 'project';"
            ))?;
        }
    }

    if !table_sql_contains(tx, "observations", "visibility IN")? {
        let tokens_column = if column_exists(tx, "observations", "discovery_tokens")? {
            "discovery_tokens"
        } else {
            "tokens"
        };
        tx.execute_batch(&format!(
            r#"
            CREATE TABLE observations_rebuild (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                memory_session_id TEXT NOT NULL,
                project TEXT NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN
                    ('decision','bugfix','feature','refactor','discovery','change')),
                title TEXT NOT NULL,
                subtitle TEXT,
                narrative TEXT,
                text TEXT,
                facts TEXT NOT NULL DEFAULT '[]',
                concepts TEXT NOT NULL DEFAULT '[]',
                files_read TEXT NOT NULL DEFAULT '[]',
                files_modified TEXT NOT NULL DEFAULT '[]',
                prompt_number INTEGER,
                {tokens_column} INTEGER NOT NULL DEFAULT 0,
                bead_id TEXT,
                agent TEXT NOT NULL DEFAULT 'legacy',
                department TEXT NOT NULL DEFAULT 'default',
                visibility TEXT NOT NULL DEFAULT 'project'
                    CHECK (visibility IN ('private','department','project','public')),
                created_at_epoch INTEGER NOT NULL
            );
            INSERT INTO observations_rebuild (
                id, memory_session_id, project, kind, title, subtitle, narrative,
                text, facts, concepts, files_read, files_modified, prompt_number,
                {tokens_column}, bead_id, agent, department, visibility, created_at_epoch
            )
            SELECT id, memory_session_id, project, kind, title, subtitle, narrative,
                   text, facts, concepts, files_read, files_modified, prompt_number,
                   {tokens_column}, bead_id, agent, department, visibility, created_at_epoch
            FROM observations;
            DROP TABLE observations;
            ALTER TABLE observations_rebuild RENAME TO observations;
            CREATE INDEX IF NOT EXISTS idx_observations_project
                ON observations(project, created_at_epoch DESC);
            "#
        ))?;
    }

    if !table_sql_contains(tx, "session_summaries", "visibility IN")? {
        tx.execute_batch(
            r#"
            CREATE TABLE session_summaries_rebuild (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                memory_session_id TEXT NOT NULL,
                project TEXT NOT NULL,
                request TEXT,
                investigated TEXT,
                learned TEXT,
                completed TEXT,
                next_steps TEXT,
                notes TEXT,
                prompt_number INTEGER,
                agent TEXT NOT NULL DEFAULT 'legacy',
                department TEXT NOT NULL DEFAULT 'default',
                visibility TEXT NOT NULL DEFAULT 'project'
                    CHECK (visibility IN ('private','department','project','public')),
                created_at_epoch INTEGER NOT NULL
            );
            INSERT INTO session_summaries_rebuild (
                id, memory_session_id, project, request, investigated, learned,
                completed, next_steps, notes, prompt_number, agent, department,
                visibility, created_at_epoch
            )
            SELECT id, memory_session_id, project, request, investigated, learned,
                   completed, next_steps, notes, prompt_number, agent, department,
                   visibility, created_at_epoch
            FROM session_summaries;
            DROP TABLE session_summaries;
            ALTER TABLE session_summaries_rebuild RENAME TO session_summaries;
            DROP INDEX IF EXISTS idx_session_summaries_memory_session;
            CREATE INDEX IF NOT EXISTS idx_session_summaries_project
                ON session_summaries(project, created_at_epoch DESC);
            "#,
        )?;
    }

    Ok(())
}

fn rename_tokens(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
    if column_exists(tx, "observations", "tokens")?
        && !column_exists(tx, "observations", "discovery_tokens")?
    {
        tx.execute_batch("ALTER TABLE observations RENAME COLUMN tokens TO discovery_tokens;")?;
    }
    Ok(())
}

/// Adds retry bookkeeping and relaxes the tool payload columns to NULL so
/// `mark_processed` can reclaim their space.
fn queue_retry_bookkeeping(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
    if !column_exists(tx, "pending_messages", "retry_count")? {
        tx.execute_batch(
            "ALTER TABLE pending_messages ADD COLUMN retry_count INTEGER NOT NULL DEFAULT 0;",
        )?;
    }
    if !column_exists(tx, "pending_messages", "error")? {
        tx.execute_batch("ALTER TABLE pending_messages ADD COLUMN error TEXT;")?;
    }

    if column_is_not_null(tx, "pending_messages", "tool_input")? {
        tx.execute_batch(
            r#"
            CREATE TABLE pending_messages_rebuild (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_db_id INTEGER NOT NULL REFERENCES sessions(id),
                content_session_id TEXT NOT NULL,
                message_type TEXT NOT NULL
                    CHECK (message_type IN ('observation','summarize')),
                tool_name TEXT,
                tool_input TEXT,
                tool_response TEXT,
                cwd TEXT,
                last_user_message TEXT,
                last_assistant_message TEXT,
                prompt_number INTEGER,
                bead_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending','processing','processed','failed')),
                created_at_epoch INTEGER NOT NULL,
                started_processing_at_epoch INTEGER,
                completed_at_epoch INTEGER,
                failed_at_epoch INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error TEXT
            );
            INSERT INTO pending_messages_rebuild (
                id, session_db_id, content_session_id, message_type, tool_name,
                tool_input, tool_response, cwd, last_user_message,
                last_assistant_message, prompt_number, bead_id, status,
                created_at_epoch, started_processing_at_epoch, completed_at_epoch,
                failed_at_epoch, retry_count, error
            )
            SELECT id, session_db_id, content_session_id, message_type, tool_name,
                   tool_input, tool_response, cwd, last_user_message,
                   last_assistant_message, prompt_number, bead_id, status,
                   created_at_epoch, started_processing_at_epoch, completed_at_epoch,
                   failed_at_epoch, retry_count, error
            FROM pending_messages;
            DROP TABLE pending_messages;
            ALTER TABLE pending_messages_rebuild RENAME TO pending_messages;
            "#,
        )?;
    }

    tx.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_pending_messages_claim
            ON pending_messages(session_db_id, status, created_at_epoch);",
    )?;
    Ok(())
}

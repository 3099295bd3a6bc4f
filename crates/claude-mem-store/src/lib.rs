//! SQLite persistence for the worker.
//!
//! The store is the single source of truth: sessions, prompts, the pending
//! message queue, observations, summaries, agents, aliases, and the audit
//! log all live here. The vector index mirrors a subset of these rows and is
//! reconciled against this store, never the other way around.

mod agents;
mod error;
mod migrations;
mod observations;
mod queue;
mod rows;
mod sessions;

pub use agents::{AgentMetrics, AliasMetrics, NewAgent, NewAuditEntry, ObservationMetrics};
pub use error::StoreError;
pub use observations::ObservationFilter;

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tokio::task;

#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database and bring its schema up to date. A
    /// migration failure leaves the store unusable; callers must treat it as
    /// fatal and refuse to serve writes.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::InvalidState(format!("cannot create data dir: {e}"))
            })?;
        }
        let mut conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool. All public
    /// operations funnel through here; none of them hold the lock across an
    /// await point.
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| StoreError::Poisoned)?;
            f(&conn)
        })
        .await
        .map_err(|_| StoreError::TaskJoin)?
    }
}

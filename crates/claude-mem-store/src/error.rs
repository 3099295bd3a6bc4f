use thiserror::Error;

/// Typed failures surfaced by the store. Constraint violations are split out
/// so callers can map them to 400-class responses instead of server faults.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        version: i64,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("sqlite connection poisoned")]
    Poisoned,
    #[error("blocking task join failed")]
    TaskJoin,
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("corrupt json column: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(code, message)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint(
                    message
                        .clone()
                        .unwrap_or_else(|| "constraint violation".to_string()),
                )
            }
            _ => StoreError::Sqlite(e),
        }
    }
}

impl StoreError {
    /// True for caller errors (bad input, broken references), as opposed to
    /// faults in the store itself.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            StoreError::Constraint(_)
                | StoreError::InvalidValue { .. }
                | StoreError::NotFound(_)
                | StoreError::InvalidState(_)
        )
    }
}

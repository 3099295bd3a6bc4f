//! Semantic retrieval over observation, summary, and prompt text.
//!
//! Two real backends share one trait: an embedded sqlite-vec index under the
//! data directory, and an HTTP client for a standalone vector server. A
//! `disabled` backend turns every operation into a cheap no-op. The backend
//! is chosen once at startup; after that, errors surface instead of
//! downgrading silently.

pub mod docs;
mod embedded;
mod http;
mod sync;

pub use embedded::EmbeddedIndex;
pub use http::HttpIndex;
pub use sync::{BackfillReport, VectorSync};

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use claude_mem_schema::settings::VectorMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Collection names carry a fixed prefix so a shared vector server can hold
/// other tenants' collections without collisions.
pub const COLLECTION_PREFIX: &str = "cm__";

pub fn collection_name(project: &str) -> String {
    format!("{COLLECTION_PREFIX}{project}")
}

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("vector backend error: {0}")]
    Backend(String),
    #[error("vector http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("vector sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("vector metadata error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store error during sync: {0}")]
    Store(#[from] claude_mem_store::StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Observation,
    SessionSummary,
    UserPrompt,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Observation => "observation",
            DocType::SessionSummary => "session_summary",
            DocType::UserPrompt => "user_prompt",
        }
    }
}

/// Metadata attached to every vector document; enough to find the owning
/// store row without parsing the id, though the id encodes it too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocMetadata {
    pub sqlite_id: i64,
    pub doc_type: DocType,
    pub memory_session_id: Option<String>,
    pub project: String,
    pub created_at_epoch: i64,
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDocument {
    pub id: String,
    pub text: String,
    pub metadata: DocMetadata,
}

/// One ranked result. Distance is cosine-space: lower is closer.
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub doc_id: String,
    pub distance: f64,
    pub metadata: DocMetadata,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Idempotently create the project's collection.
    async fn ensure_collection(&self, project: &str) -> Result<(), VectorError>;

    async fn add_documents(
        &self,
        project: &str,
        docs: &[VectorDocument],
    ) -> Result<(), VectorError>;

    async fn query(
        &self,
        project: &str,
        query_text: &str,
        limit: usize,
        doc_type: Option<DocType>,
    ) -> Result<Vec<QueryHit>, VectorError>;

    /// Enumerate every document id in the collection, paging internally.
    async fn list_document_ids(
        &self,
        project: &str,
        page_size: usize,
    ) -> Result<Vec<String>, VectorError>;

    async fn close(&self) -> Result<(), VectorError>;
}

/// The `disabled` backend: every operation succeeds and returns nothing.
pub struct DisabledIndex;

#[async_trait]
impl VectorIndex for DisabledIndex {
    async fn ensure_collection(&self, _project: &str) -> Result<(), VectorError> {
        Ok(())
    }

    async fn add_documents(
        &self,
        _project: &str,
        _docs: &[VectorDocument],
    ) -> Result<(), VectorError> {
        Ok(())
    }

    async fn query(
        &self,
        _project: &str,
        _query_text: &str,
        _limit: usize,
        _doc_type: Option<DocType>,
    ) -> Result<Vec<QueryHit>, VectorError> {
        Ok(Vec::new())
    }

    async fn list_document_ids(
        &self,
        _project: &str,
        _page_size: usize,
    ) -> Result<Vec<String>, VectorError> {
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<(), VectorError> {
        Ok(())
    }
}

/// Pick the backend once at startup. `auto` probes the HTTP server and falls
/// back to the embedded index; every other mode is taken literally.
pub async fn resolve_index(
    mode: VectorMode,
    url: &str,
    data_dir: &Path,
) -> Result<Arc<dyn VectorIndex>, VectorError> {
    match mode {
        VectorMode::Disabled => Ok(Arc::new(DisabledIndex)),
        VectorMode::Http => Ok(Arc::new(HttpIndex::new(url))),
        VectorMode::Embedded => Ok(Arc::new(EmbeddedIndex::open(data_dir)?)),
        VectorMode::Auto => {
            let http = HttpIndex::new(url);
            if http.heartbeat().await {
                tracing::info!(url, "vector index: http backend");
                Ok(Arc::new(http))
            } else {
                tracing::info!(dir = %data_dir.display(), "vector index: embedded backend");
                Ok(Arc::new(EmbeddedIndex::open(data_dir)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_name_is_prefixed() {
        assert_eq!(collection_name("github.com/u/r"), "cm__github.com/u/r");
    }

    #[tokio::test]
    async fn disabled_backend_is_a_noop() {
        let index = DisabledIndex;
        index.ensure_collection("p").await.unwrap();
        index.add_documents("p", &[]).await.unwrap();
        assert!(index.query("p", "q", 5, None).await.unwrap().is_empty());
        assert!(index.list_document_ids("p", 100).await.unwrap().is_empty());
        index.close().await.unwrap();
    }
}

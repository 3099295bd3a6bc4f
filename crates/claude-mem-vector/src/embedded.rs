//! Embedded vector backend.
//!
//! Documents live in a dedicated SQLite file under the data directory with a
//! sqlite-vec `vec0` virtual table for nearest-neighbour lookup. Text is
//! embedded locally with a deterministic feature-hash embedder, so the
//! worker never needs an embedding API to run standalone. Distances are
//! cosine-space, matching the HTTP backend.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tokio::task;

use crate::{
    collection_name, DocMetadata, DocType, QueryHit, VectorDocument, VectorError, VectorIndex,
};

const EMBEDDING_DIMS: usize = 256;

/// Register sqlite-vec for every connection opened afterwards.
fn init_sqlite_vec() {
    use rusqlite::ffi::{sqlite3, sqlite3_api_routines, sqlite3_auto_extension};

    type Sqlite3AutoExtFn =
        unsafe extern "C" fn(*mut sqlite3, *mut *mut i8, *const sqlite3_api_routines) -> i32;

    unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute::<*const (), Sqlite3AutoExtFn>(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    }
}

/// Hash each token into a signed bucket and L2-normalize. Deterministic, so
/// re-indexing the same text always lands on the same vector.
pub(crate) fn embed(text: &str, dims: usize) -> Vec<f32> {
    let mut vector = vec![0.0_f32; dims];
    for token in text.to_lowercase().split_whitespace() {
        let digest = Sha256::digest(token.as_bytes());
        let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize % dims;
        let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 1.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 1.0;
    }
    let similarity = (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0);
    (1.0 - similarity) as f64
}

fn embedding_to_json(embedding: &[f32]) -> String {
    serde_json::to_string(embedding).unwrap_or_else(|_| "[]".to_string())
}

pub struct EmbeddedIndex {
    db: Arc<Mutex<Connection>>,
}

impl EmbeddedIndex {
    /// Open (or create) `vectors.db` under `dir`.
    pub fn open(dir: &Path) -> Result<Self, VectorError> {
        init_sqlite_vec();
        std::fs::create_dir_all(dir)
            .map_err(|e| VectorError::Backend(format!("cannot create vector dir: {e}")))?;
        let conn = Connection::open(dir.join("vectors.db"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, VectorError> {
        init_sqlite_vec();
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), VectorError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS collections (name TEXT PRIMARY KEY);
             CREATE TABLE IF NOT EXISTS documents (
                 id TEXT PRIMARY KEY,
                 collection TEXT NOT NULL,
                 doc_type TEXT NOT NULL,
                 text TEXT NOT NULL,
                 metadata TEXT NOT NULL,
                 embedding TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_documents_collection
                 ON documents(collection);",
        )?;
        let has_vec_table: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'doc_vectors'",
                [],
                |r| r.get(0),
            )
            .unwrap_or(false);
        if !has_vec_table {
            conn.execute_batch(&format!(
                "CREATE VIRTUAL TABLE doc_vectors USING vec0(
                     doc_id TEXT PRIMARY KEY,
                     embedding float[{EMBEDDING_DIMS}] distance_metric=cosine
                 );"
            ))?;
        }
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, VectorError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, VectorError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| VectorError::Backend("vector connection poisoned".into()))?;
            f(&conn)
        })
        .await
        .map_err(|_| VectorError::Backend("blocking task join failed".into()))?
    }
}

#[async_trait]
impl VectorIndex for EmbeddedIndex {
    async fn ensure_collection(&self, project: &str) -> Result<(), VectorError> {
        let name = collection_name(project);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO collections (name) VALUES (?1)",
                params![name],
            )?;
            Ok(())
        })
        .await
    }

    async fn add_documents(
        &self,
        project: &str,
        docs: &[VectorDocument],
    ) -> Result<(), VectorError> {
        if docs.is_empty() {
            return Ok(());
        }
        let name = collection_name(project);
        let docs = docs.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for doc in &docs {
                let embedding = embed(&doc.text, EMBEDDING_DIMS);
                let embedding_json = embedding_to_json(&embedding);
                tx.execute(
                    "INSERT OR REPLACE INTO documents
                        (id, collection, doc_type, text, metadata, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        doc.id,
                        name,
                        doc.metadata.doc_type.as_str(),
                        doc.text,
                        serde_json::to_string(&doc.metadata)?,
                        embedding_json
                    ],
                )?;
                tx.execute(
                    "INSERT OR REPLACE INTO doc_vectors (doc_id, embedding) VALUES (?1, ?2)",
                    params![doc.id, embedding_json],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn query(
        &self,
        project: &str,
        query_text: &str,
        limit: usize,
        doc_type: Option<DocType>,
    ) -> Result<Vec<QueryHit>, VectorError> {
        if query_text.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let name = collection_name(project);
        let query_embedding = embed(query_text, EMBEDDING_DIMS);
        self.with_conn(move |conn| {
            // The vec0 table is global, so over-fetch and filter down to the
            // collection (and optional doc_type) afterwards.
            let candidate_limit = (limit * 8).max(32);
            let mut stmt = conn.prepare(
                "SELECT v.doc_id, v.distance, d.metadata
                 FROM doc_vectors v
                 JOIN documents d ON d.id = v.doc_id
                 WHERE v.embedding MATCH ?1 AND k = ?2 AND d.collection = ?3",
            )?;
            let rows = stmt.query_map(
                params![embedding_to_json(&query_embedding), candidate_limit as i64, name],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, f64>(1)?,
                        r.get::<_, String>(2)?,
                    ))
                },
            )?;
            let mut hits = Vec::new();
            for row in rows {
                let (doc_id, distance, metadata_json) = row?;
                let metadata: DocMetadata = serde_json::from_str(&metadata_json)?;
                if doc_type.is_some_and(|t| metadata.doc_type != t) {
                    continue;
                }
                hits.push(QueryHit {
                    doc_id,
                    distance,
                    metadata,
                });
            }
            hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
            hits.truncate(limit);
            Ok(hits)
        })
        .await
    }

    async fn list_document_ids(
        &self,
        project: &str,
        page_size: usize,
    ) -> Result<Vec<String>, VectorError> {
        let name = collection_name(project);
        let page_size = page_size.max(1);
        self.with_conn(move |conn| {
            let mut ids = Vec::new();
            let mut offset = 0_i64;
            loop {
                let mut stmt = conn.prepare(
                    "SELECT id FROM documents WHERE collection = ?1
                     ORDER BY id LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt.query_map(params![name, page_size as i64, offset], |r| {
                    r.get::<_, String>(0)
                })?;
                let mut page = Vec::new();
                for row in rows {
                    page.push(row?);
                }
                let full = page.len() == page_size;
                offset += page.len() as i64;
                ids.extend(page);
                if !full {
                    break;
                }
            }
            Ok(ids)
        })
        .await
    }

    async fn close(&self) -> Result<(), VectorError> {
        // Dropping the last Arc closes the connection; flush WAL eagerly so
        // shutdown leaves a clean file behind.
        self.with_conn(|conn| {
            let _: Option<i64> = conn
                .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |r| r.get(0))
                .optional()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::prompt_doc_id;

    fn doc(id: &str, project: &str, text: &str) -> VectorDocument {
        VectorDocument {
            id: id.to_string(),
            text: text.to_string(),
            metadata: DocMetadata {
                sqlite_id: 1,
                doc_type: DocType::Observation,
                memory_session_id: Some("mem".into()),
                project: project.to_string(),
                created_at_epoch: 1,
                field_type: "narrative".into(),
                fact_index: None,
            },
        }
    }

    #[test]
    fn embedding_is_deterministic_and_normalized() {
        let a = embed("tokio async runtime", EMBEDDING_DIMS);
        let b = embed("tokio async runtime", EMBEDDING_DIMS);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn related_text_is_closer_than_unrelated() {
        let query = embed("tokio async runtime", EMBEDDING_DIMS);
        let related = embed("the tokio runtime drives async tasks", EMBEDDING_DIMS);
        let unrelated = embed("grocery list bananas milk", EMBEDDING_DIMS);
        assert!(cosine_distance(&query, &related) < cosine_distance(&query, &unrelated));
    }

    #[tokio::test]
    async fn add_query_round_trip() {
        let index = EmbeddedIndex::open_in_memory().unwrap();
        index.ensure_collection("p").await.unwrap();
        index
            .add_documents(
                "p",
                &[
                    doc("obs_1_narrative", "p", "sqlite write ahead logging"),
                    doc("obs_2_narrative", "p", "completely different topic entirely"),
                ],
            )
            .await
            .unwrap();

        let hits = index
            .query("p", "sqlite wal logging", 1, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "obs_1_narrative");
    }

    #[tokio::test]
    async fn query_is_scoped_to_the_collection() {
        let index = EmbeddedIndex::open_in_memory().unwrap();
        index
            .add_documents("p1", &[doc("obs_1_narrative", "p1", "shared words here")])
            .await
            .unwrap();
        index
            .add_documents("p2", &[doc("obs_2_narrative", "p2", "shared words here")])
            .await
            .unwrap();

        let hits = index.query("p1", "shared words", 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.project, "p1");
    }

    #[tokio::test]
    async fn doc_type_filter_applies() {
        let index = EmbeddedIndex::open_in_memory().unwrap();
        let mut prompt = doc(&prompt_doc_id(9), "p", "shared words here");
        prompt.metadata.doc_type = DocType::UserPrompt;
        index
            .add_documents("p", &[doc("obs_1_narrative", "p", "shared words here"), prompt])
            .await
            .unwrap();

        let hits = index
            .query("p", "shared words", 10, Some(DocType::UserPrompt))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "prompt_9");
    }

    #[tokio::test]
    async fn list_document_ids_pages_through_everything() {
        let index = EmbeddedIndex::open_in_memory().unwrap();
        let docs: Vec<VectorDocument> = (0..7)
            .map(|i| doc(&format!("obs_{i}_narrative"), "p", &format!("text {i}")))
            .collect();
        index.add_documents("p", &docs).await.unwrap();

        let ids = index.list_document_ids("p", 3).await.unwrap();
        assert_eq!(ids.len(), 7);
    }

    #[tokio::test]
    async fn add_documents_is_idempotent_per_id() {
        let index = EmbeddedIndex::open_in_memory().unwrap();
        let d = doc("obs_1_narrative", "p", "same doc");
        index.add_documents("p", &[d.clone()]).await.unwrap();
        index.add_documents("p", &[d]).await.unwrap();
        assert_eq!(index.list_document_ids("p", 100).await.unwrap().len(), 1);
    }
}

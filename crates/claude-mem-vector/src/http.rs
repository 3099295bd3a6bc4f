//! HTTP vector backend.
//!
//! Speaks the standard vector-DB REST shape: collection get-or-create, add,
//! get (with `where` filter and offset pagination), and query with
//! `query_texts`. Embedding happens server-side; this client only ships
//! text.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::{
    collection_name, DocMetadata, DocType, QueryHit, VectorDocument, VectorError, VectorIndex,
};

pub struct HttpIndex {
    client: reqwest::Client,
    base_url: String,
    /// collection name -> server-side collection id
    collections: Arc<RwLock<HashMap<String, String>>>,
}

#[derive(Deserialize)]
struct CollectionResponse {
    id: String,
}

#[derive(Deserialize, Default)]
struct GetResponse {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    ids: Vec<Vec<String>>,
    #[serde(default)]
    distances: Vec<Vec<f64>>,
    #[serde(default)]
    metadatas: Vec<Vec<Value>>,
}

impl HttpIndex {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Liveness probe used by `mode=auto` at startup.
    pub async fn heartbeat(&self) -> bool {
        let url = format!("{}/api/v1/heartbeat", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn collection_id(&self, project: &str) -> Result<String, VectorError> {
        let name = collection_name(project);
        if let Some(id) = self.collections.read().await.get(&name) {
            return Ok(id.clone());
        }
        let url = format!("{}/api/v1/collections", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "name": name, "get_or_create": true }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(VectorError::Backend(format!(
                "collection create failed: {} {}",
                resp.status(),
                resp.text().await.unwrap_or_default()
            )));
        }
        let body: CollectionResponse = resp.json().await?;
        self.collections
            .write()
            .await
            .insert(name, body.id.clone());
        Ok(body.id)
    }

    async fn post(&self, path: &str, body: Value) -> Result<reqwest::Response, VectorError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(VectorError::Backend(format!(
                "{path} failed: {} {}",
                resp.status(),
                resp.text().await.unwrap_or_default()
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl VectorIndex for HttpIndex {
    async fn ensure_collection(&self, project: &str) -> Result<(), VectorError> {
        self.collection_id(project).await.map(|_| ())
    }

    async fn add_documents(
        &self,
        project: &str,
        docs: &[VectorDocument],
    ) -> Result<(), VectorError> {
        if docs.is_empty() {
            return Ok(());
        }
        let id = self.collection_id(project).await?;
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        let documents: Vec<&str> = docs.iter().map(|d| d.text.as_str()).collect();
        let metadatas: Vec<Value> = docs
            .iter()
            .map(|d| serde_json::to_value(&d.metadata))
            .collect::<Result<_, _>>()?;
        self.post(
            &format!("/api/v1/collections/{id}/add"),
            json!({ "ids": ids, "documents": documents, "metadatas": metadatas }),
        )
        .await?;
        Ok(())
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
        let id = self.collection_id(project).await?;
        let mut body = json!({
            "query_texts": [query_text],
            "n_results": limit,
            "include": ["metadatas", "distances"],
        });
        if let Some(doc_type) = doc_type {
            body["where"] = json!({ "doc_type": doc_type.as_str() });
        }
        let resp = self
            .post(&format!("/api/v1/collections/{id}/query"), body)
            .await?;
        let parsed: QueryResponse = resp.json().await?;

        let ids = parsed.ids.into_iter().next().unwrap_or_default();
        let distances = parsed.distances.into_iter().next().unwrap_or_default();
        let metadatas = parsed.metadatas.into_iter().next().unwrap_or_default();

        let mut hits = Vec::with_capacity(ids.len());
        for (i, doc_id) in ids.into_iter().enumerate() {
            let Some(raw) = metadatas.get(i) else {
                continue;
            };
            let metadata: DocMetadata = serde_json::from_value(raw.clone())?;
            hits.push(QueryHit {
                doc_id,
                distance: distances.get(i).copied().unwrap_or(1.0),
                metadata,
            });
        }
        Ok(hits)
    }

    async fn list_document_ids(
        &self,
        project: &str,
        page_size: usize,
    ) -> Result<Vec<String>, VectorError> {
        let id = self.collection_id(project).await?;
        let page_size = page_size.max(1);
        let mut ids = Vec::new();
        let mut offset = 0_usize;
        loop {
            let resp = self
                .post(
                    &format!("/api/v1/collections/{id}/get"),
                    json!({ "limit": page_size, "offset": offset, "include": [] }),
                )
                .await?;
            let page: GetResponse = resp.json().await?;
            let count = page.ids.len();
            offset += count;
            ids.extend(page.ids);
            if count < page_size {
                break;
            }
        }
        Ok(ids)
    }

    async fn close(&self) -> Result<(), VectorError> {
        Ok(())
    }
}

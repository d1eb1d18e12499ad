//! Vector index adapters for long-term memory.
//!
//! Two implementations sit behind the `VectorIndex` trait: an HTTP client for
//! a Qdrant-compatible REST index, and an in-memory cosine index used when no
//! vector database is configured (and by the test suites). Query results are
//! always ordered by descending score with ties broken by record id, so
//! retrieval is deterministic regardless of backend.

use crate::shared::{MemoryRecord, RecordMetadata, EMBEDDING_DIM};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

/// Errors from the vector index adapters.
#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("indexing failed: {0}")]
    Index(String),

    #[error("query failed: {0}")]
    Query(String),
}

/// One retrieval hit: the stored record and its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    pub score: f32,
}

/// Nearest-neighbor store keyed by record id.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Inserts or replaces the record with the same id (idempotent re-index).
    async fn upsert(&self, record: MemoryRecord) -> Result<(), VectorError>;

    /// Top-`limit` records nearest to `vector`, restricted to records whose
    /// metadata `user_id` equals `user_id`. Descending score, id tie-break.
    async fn query(
        &self,
        vector: &[f32],
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>, VectorError>;
}

fn sort_hits(hits: &mut Vec<ScoredRecord>) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
}

// ---------------------------------------------------------------------------
// Qdrant-compatible REST index
// ---------------------------------------------------------------------------

/// REST client for a Qdrant-compatible vector database.
pub struct HttpVectorIndex {
    client: reqwest::Client,
    base_url: String,
    collection: String,
}

impl HttpVectorIndex {
    /// Connects to the index and ensures the collection exists with the
    /// expected schema (768-dim, cosine distance).
    pub async fn connect(base_url: &str, collection: &str) -> Result<Self, VectorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| VectorError::Index(e.to_string()))?;
        let index = Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
        };
        index.ensure_collection().await?;
        Ok(index)
    }

    async fn ensure_collection(&self) -> Result<(), VectorError> {
        let url = format!("{}/collections/{}", self.base_url, self.collection);
        let exists = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VectorError::Index(e.to_string()))?
            .status()
            .is_success();
        if exists {
            info!(target: "confab::vector", collection = %self.collection, "collection already exists");
            return Ok(());
        }

        let body = json!({
            "vectors": { "size": EMBEDDING_DIM, "distance": "Cosine" }
        });
        let response = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorError::Index(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(VectorError::Index(format!(
                "collection bootstrap failed ({}): {}",
                status, text
            )));
        }
        info!(
            target: "confab::vector",
            collection = %self.collection,
            "collection created ({}-dim, cosine)",
            EMBEDDING_DIM
        );
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    async fn upsert(&self, record: MemoryRecord) -> Result<(), VectorError> {
        let url = format!("{}/collections/{}/points", self.base_url, self.collection);
        let body = json!({
            "points": [{
                "id": record.id,
                "vector": record.vector,
                "payload": {
                    "conversationId": record.metadata.conversation_id,
                    "userId": record.metadata.user_id,
                    "text": record.metadata.text,
                },
            }]
        });
        let response = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorError::Index(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(VectorError::Index(format!("upsert failed ({}): {}", status, text)));
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>, VectorError> {
        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection
        );
        let body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
            "with_vector": true,
            "filter": {
                "must": [{ "key": "userId", "match": { "value": user_id } }]
            },
        });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorError::Query(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(VectorError::Query(format!("search failed ({}): {}", status, text)));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VectorError::Query(e.to_string()))?;
        let empty = Vec::new();
        let raw_hits = parsed["result"].as_array().unwrap_or(&empty);

        let mut hits = Vec::with_capacity(raw_hits.len());
        for hit in raw_hits {
            let payload = &hit["payload"];
            let record = MemoryRecord {
                id: hit["id"].as_str().unwrap_or_default().to_string(),
                vector: hit["vector"]
                    .as_array()
                    .map(|v| v.iter().filter_map(|x| x.as_f64()).map(|x| x as f32).collect())
                    .unwrap_or_default(),
                metadata: RecordMetadata {
                    conversation_id: payload["conversationId"].as_str().unwrap_or_default().to_string(),
                    user_id: payload["userId"].as_str().unwrap_or_default().to_string(),
                    text: payload["text"].as_str().unwrap_or_default().to_string(),
                },
            };
            hits.push(ScoredRecord {
                record,
                score: hit["score"].as_f64().unwrap_or(0.0) as f32,
            });
        }
        sort_hits(&mut hits);
        Ok(hits)
    }
}

// ---------------------------------------------------------------------------
// In-memory fallback index
// ---------------------------------------------------------------------------

/// Cosine-similarity index held in process memory. Used when
/// `CONFAB_VECTOR_DB_URL` is unset and throughout the test suites.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    records: DashMap<String, MemoryRecord>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        warn!(target: "confab::vector", "no vector database configured; using in-memory index");
        Self::default()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, record: MemoryRecord) -> Result<(), VectorError> {
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>, VectorError> {
        let mut hits: Vec<ScoredRecord> = self
            .records
            .iter()
            .filter(|entry| entry.value().metadata.user_id == user_id)
            .map(|entry| ScoredRecord {
                score: cosine(vector, &entry.value().vector),
                record: entry.value().clone(),
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }
}

//! Vector index abstraction.
//!
//! The [`VectorStore`] trait is the only view either pipeline has of the
//! index: ingestion writes through [`upsert`](VectorStore::upsert), the
//! query path reads through [`query`](VectorStore::query). Two backends:
//!
//! - **[`PineconeStore`]** — a managed Pinecone index over its REST API.
//! - **[`InMemoryVectorStore`]** — brute-force cosine search behind a
//!   `RwLock`, for tests and offline runs.
//!
//! Records carry their chunk text in metadata under the `text` key, next to
//! `source` and `chunkIndex`, so a query result is self-contained.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::config::{Credentials, VectorStoreConfig};
use crate::embedding::cosine_similarity;
use crate::http::send_with_retry;
use crate::models::{RetrievedChunk, VectorRecord};

const PINECONE_API_VERSION: &str = "2024-07";

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or overwrite records by id. Returns the number written.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize>;

    /// Return up to `top_k` records most similar to `vector`, best first.
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<RetrievedChunk>>;
}

// ============ Pinecone ============

pub struct PineconeStore {
    client: reqwest::Client,
    api_key: String,
    index_name: String,
    control_plane_url: String,
    namespace: Option<String>,
    /// Data-plane host, resolved from the control plane on first use.
    host: OnceCell<String>,
}

impl PineconeStore {
    pub fn new(config: &VectorStoreConfig, credentials: &Credentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key: credentials.pinecone_api_key.clone(),
            index_name: credentials.pinecone_index.clone(),
            control_plane_url: config.control_plane_url.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            host: OnceCell::new(),
        })
    }

    async fn data_plane(&self) -> Result<&str> {
        let host = self
            .host
            .get_or_try_init(|| async {
                let url = format!("{}/indexes/{}", self.control_plane_url, self.index_name);
                let response = send_with_retry("Pinecone describe_index", 0, || {
                    self.client
                        .get(&url)
                        .header("Api-Key", &self.api_key)
                        .header("X-Pinecone-API-Version", PINECONE_API_VERSION)
                })
                .await?;
                let json: Value = response.json().await?;
                let host = json
                    .get("host")
                    .and_then(|h| h.as_str())
                    .ok_or_else(|| anyhow!("Pinecone index '{}' has no host", self.index_name))?;
                tracing::debug!(index = %self.index_name, host, "resolved pinecone host");
                Ok::<_, anyhow::Error>(normalize_host(host))
            })
            .await?;
        Ok(host.as_str())
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.data_plane().await?, path);
        let response = send_with_retry("Pinecone", 0, || {
            self.client
                .post(&url)
                .header("Api-Key", &self.api_key)
                .header("X-Pinecone-API-Version", PINECONE_API_VERSION)
                .json(body)
        })
        .await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl VectorStore for PineconeStore {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let vectors: Vec<Value> = records.iter().map(record_to_json).collect();
        let mut body = json!({ "vectors": vectors });
        if let Some(ns) = &self.namespace {
            body["namespace"] = json!(ns);
        }

        let json = self
            .post("/vectors/upsert", &body)
            .await
            .with_context(|| format!("upsert of {} vectors failed", records.len()))?;

        Ok(json
            .get("upsertedCount")
            .and_then(|c| c.as_u64())
            .map(|c| c as usize)
            .unwrap_or(records.len()))
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<RetrievedChunk>> {
        let mut body = json!({
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
            "includeValues": false,
        });
        if let Some(ns) = &self.namespace {
            body["namespace"] = json!(ns);
        }

        let json = self.post("/query", &body).await?;
        parse_matches(&json)
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}

fn record_to_json(record: &VectorRecord) -> Value {
    json!({
        "id": record.id,
        "values": record.values,
        "metadata": {
            "text": record.text,
            "source": record.metadata.source,
            "chunkIndex": record.metadata.chunk_index,
            "start": record.metadata.start,
            "end": record.metadata.end,
        }
    })
}

fn parse_matches(json: &Value) -> Result<Vec<RetrievedChunk>> {
    let matches = json
        .get("matches")
        .and_then(|m| m.as_array())
        .ok_or_else(|| anyhow!("Invalid Pinecone response: missing matches array"))?;

    Ok(matches
        .iter()
        .map(|m| {
            let metadata = m.get("metadata");
            let field = |key: &str| metadata.and_then(|md| md.get(key));
            RetrievedChunk {
                id: m.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                text: field("text").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                score: m.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32,
                source: field("source").and_then(|v| v.as_str()).map(str::to_string),
                chunk_index: field("chunkIndex").and_then(|v| v.as_u64()).map(|v| v as u32),
            }
        })
        .collect())
}

// ============ In-memory ============

/// Brute-force cosine-similarity store.
#[derive(Default)]
pub struct InMemoryVectorStore {
    records: RwLock<Vec<VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored record, in insertion order.
    pub fn records(&self) -> Vec<VectorRecord> {
        self.records.read().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
        let mut stored = self
            .records
            .write()
            .map_err(|_| anyhow!("vector store lock poisoned"))?;
        for record in records {
            match stored.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record.clone(),
                None => stored.push(record.clone()),
            }
        }
        Ok(records.len())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<RetrievedChunk>> {
        let stored = self
            .records
            .read()
            .map_err(|_| anyhow!("vector store lock poisoned"))?;
        let mut scored: Vec<RetrievedChunk> = stored
            .iter()
            .map(|r| RetrievedChunk {
                id: r.id.clone(),
                text: r.text.clone(),
                score: cosine_similarity(vector, &r.values),
                source: Some(r.metadata.source.clone()),
                chunk_index: Some(r.metadata.chunk_index),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}

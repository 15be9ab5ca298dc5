//! Default vector backend: embeds on upsert, scores with cosine similarity
//! and answers queries after ANDing the similarity threshold with the
//! metadata/time filter. Rows are snapshotted to JSON like the KV backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{StorageContext, VectorHit, VectorRecord, VectorStorage};
use crate::embedding::{cosine_similarity, BatchingEmbedder};
use crate::error::{RagError, Result};
use crate::filter::VectorFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVector {
    content: String,
    metadata: Value,
    fields: Map<String, Value>,
    vector: Vec<f32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

pub struct SimpleVectorStorage {
    namespace: String,
    path: PathBuf,
    embedder: Arc<BatchingEmbedder>,
    threshold: f32,
    rows: RwLock<HashMap<String, StoredVector>>,
}

impl SimpleVectorStorage {
    pub fn open(ctx: &StorageContext) -> Result<Self> {
        let embedder = ctx
            .embedder
            .clone()
            .ok_or_else(|| RagError::storage_fatal("vector storage requires an embedder"))?;
        let path = ctx.snapshot_path("vdb");
        let rows: HashMap<String, StoredVector> = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).map_err(|e| {
                RagError::StorageFatal(anyhow::anyhow!("corrupt snapshot {path:?}: {e}"))
            })?
        } else {
            HashMap::new()
        };
        Ok(Self {
            namespace: ctx.namespace.clone(),
            path,
            embedder,
            threshold: ctx.config.cosine_better_than_threshold,
            rows: RwLock::new(rows),
        })
    }
}

#[async_trait]
impl VectorStorage for SimpleVectorStorage {
    async fn upsert(&self, data: HashMap<String, VectorRecord>) -> Result<()> {
        if data.is_empty() {
            tracing::warn!(namespace = %self.namespace, "vector upsert called with no rows");
            return Ok(());
        }
        let mut ids = Vec::with_capacity(data.len());
        let mut contents = Vec::with_capacity(data.len());
        let mut records = Vec::with_capacity(data.len());
        for (id, record) in data {
            ids.push(id);
            contents.push(record.content.clone());
            records.push(record);
        }
        let vectors = self.embedder.embed(&contents).await?;

        let now = Utc::now();
        let mut rows = self.rows.write();
        for ((id, record), vector) in ids.into_iter().zip(records).zip(vectors) {
            let created_at = rows.get(&id).map(|r| r.created_at).unwrap_or(now);
            rows.insert(
                id,
                StoredVector {
                    content: record.content,
                    metadata: record.metadata,
                    fields: record.fields,
                    vector,
                    created_at,
                    updated_at: now,
                },
            );
        }
        tracing::debug!(namespace = %self.namespace, rows = rows.len(), "vector upsert complete");
        Ok(())
    }

    async fn query(
        &self,
        query: &str,
        top_k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>> {
        let query_vector = self.embedder.embed_one(query).await?;

        let rows = self.rows.read();
        let mut hits: Vec<VectorHit> = rows
            .iter()
            .filter_map(|(id, row)| {
                let distance = cosine_similarity(&query_vector, &row.vector);
                if distance <= self.threshold {
                    return None;
                }
                if !filter.matches(&row.metadata, Some(row.updated_at)) {
                    return None;
                }
                Some(VectorHit {
                    id: id.clone(),
                    distance,
                    content: row.content.clone(),
                    metadata: row.metadata.clone(),
                    fields: row.fields.clone(),
                    updated_at: Some(row.updated_at),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.distance
                .partial_cmp(&a.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        tracing::debug!(
            namespace = %self.namespace,
            hits = hits.len(),
            threshold = self.threshold,
            "vector query complete"
        );
        Ok(hits)
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
        let mut rows = self.rows.write();
        for id in ids {
            rows.remove(id);
        }
        Ok(())
    }

    async fn delete_by_doc_ids(&self, doc_ids: &[String]) -> Result<()> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|_, row| {
            row.fields
                .get("full_doc_id")
                .and_then(|v| v.as_str())
                .map(|doc_id| !doc_ids.iter().any(|d| d == doc_id))
                .unwrap_or(true)
        });
        tracing::info!(
            namespace = %self.namespace,
            deleted = before - rows.len(),
            "deleted vector rows by doc ids"
        );
        Ok(())
    }

    async fn delete_entity(&self, entity_name: &str) -> Result<()> {
        let mut rows = self.rows.write();
        rows.retain(|_, row| {
            row.fields
                .get("entity_name")
                .and_then(|v| v.as_str())
                .map(|name| name != entity_name)
                .unwrap_or(true)
        });
        Ok(())
    }

    async fn delete_relation(&self, entity_name: &str) -> Result<()> {
        let mut rows = self.rows.write();
        rows.retain(|_, row| {
            let src = row.fields.get("src_id").and_then(|v| v.as_str());
            let tgt = row.fields.get("tgt_id").and_then(|v| v.as_str());
            src != Some(entity_name) && tgt != Some(entity_name)
        });
        Ok(())
    }

    async fn index_done_callback(&self) -> Result<()> {
        let rows = self.rows.read();
        super::json_kv::write_snapshot(&self.path, &*rows)
    }
}

//! Default doc-status backend. Same JSON-snapshot substrate as the KV store,
//! but rows are typed [`DocStatusRecord`]s and upsert preserves `created_at`
//! while stamping `updated_at`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{DocStatusStorage, StorageContext};
use crate::error::{RagError, Result};
use crate::types::{DocStatus, DocStatusRecord};

pub struct JsonDocStatusStorage {
    path: PathBuf,
    data: RwLock<HashMap<String, DocStatusRecord>>,
}

impl JsonDocStatusStorage {
    pub fn open(ctx: &StorageContext) -> Result<Self> {
        let path = ctx.snapshot_path("doc_status");
        let data: HashMap<String, DocStatusRecord> = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).map_err(|e| {
                RagError::StorageFatal(anyhow::anyhow!("corrupt snapshot {path:?}: {e}"))
            })?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }
}

#[async_trait]
impl DocStatusStorage for JsonDocStatusStorage {
    async fn filter_keys(&self, keys: &[String]) -> Result<HashSet<String>> {
        let data = self.data.read();
        Ok(keys
            .iter()
            .filter(|k| !data.contains_key(*k))
            .cloned()
            .collect())
    }

    async fn get_docs_by_status(
        &self,
        status: DocStatus,
    ) -> Result<HashMap<String, DocStatusRecord>> {
        let data = self.data.read();
        Ok(data
            .iter()
            .filter(|(_, record)| record.status == status)
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect())
    }

    async fn get_status_counts(&self) -> Result<HashMap<String, usize>> {
        let data = self.data.read();
        let mut counts = HashMap::new();
        for record in data.values() {
            *counts.entry(record.status.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn upsert(&self, rows: HashMap<String, DocStatusRecord>) -> Result<()> {
        let now = Utc::now();
        let mut data = self.data.write();
        for (id, mut record) in rows {
            if let Some(existing) = data.get(&id) {
                record.created_at = existing.created_at;
            }
            record.updated_at = now;
            data.insert(id, record);
        }
        Ok(())
    }

    async fn index_done_callback(&self) -> Result<()> {
        let data = self.data.read();
        super::json_kv::write_snapshot(&self.path, &*data)
    }
}

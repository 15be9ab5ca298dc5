//! Default key-value backend: an in-memory map snapshotted to one JSON file
//! per (namespace, workspace) under the working directory. Reloads the
//! snapshot on open, writes it back in `index_done_callback`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{KvStorage, StorageContext};
use crate::error::{RagError, Result};

pub struct JsonKvStorage {
    namespace: String,
    path: PathBuf,
    data: RwLock<HashMap<String, Value>>,
}

impl JsonKvStorage {
    pub fn open(ctx: &StorageContext) -> Result<Self> {
        let path = ctx.snapshot_path("kv_store");
        let data = load_snapshot(&path)?;
        tracing::debug!(
            namespace = %ctx.namespace,
            workspace = %ctx.workspace,
            rows = data.len(),
            "opened kv storage"
        );
        Ok(Self {
            namespace: ctx.namespace.clone(),
            path,
            data: RwLock::new(data),
        })
    }
}

pub(crate) fn load_snapshot(path: &PathBuf) -> Result<HashMap<String, Value>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| RagError::StorageFatal(anyhow::anyhow!("corrupt snapshot {path:?}: {e}")))
}

pub(crate) fn write_snapshot<T: serde::Serialize>(path: &PathBuf, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string(data)?;
    std::fs::write(path, raw)?;
    Ok(())
}

#[async_trait]
impl KvStorage for JsonKvStorage {
    async fn get_by_id(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.data.read().get(id).cloned())
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<Value>>> {
        let data = self.data.read();
        Ok(ids.iter().map(|id| data.get(id).cloned()).collect())
    }

    async fn filter_keys(&self, keys: &[String]) -> Result<HashSet<String>> {
        let data = self.data.read();
        Ok(keys
            .iter()
            .filter(|k| !data.contains_key(*k))
            .cloned()
            .collect())
    }

    async fn upsert(&self, rows: HashMap<String, Value>) -> Result<()> {
        let mut data = self.data.write();
        for (k, v) in rows {
            data.insert(k, v);
        }
        Ok(())
    }

    async fn delete_by_doc_ids(&self, doc_ids: &[String]) -> Result<()> {
        let targets: HashSet<&String> = doc_ids.iter().collect();
        let mut data = self.data.write();
        let before = data.len();
        data.retain(|key, value| {
            if targets.contains(key) {
                return false;
            }
            match value.get("full_doc_id").and_then(|v| v.as_str()) {
                Some(doc_id) => !doc_ids.iter().any(|d| d == doc_id),
                None => true,
            }
        });
        tracing::info!(
            namespace = %self.namespace,
            deleted = before - data.len(),
            "deleted kv rows by doc ids"
        );
        Ok(())
    }

    async fn get_chunk_ids_by_doc_ids(&self, doc_ids: &[String]) -> Result<Vec<String>> {
        let data = self.data.read();
        let mut ids: Vec<String> = data
            .iter()
            .filter(|(_, value)| {
                value
                    .get("full_doc_id")
                    .and_then(|v| v.as_str())
                    .map(|doc_id| doc_ids.iter().any(|d| d == doc_id))
                    .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn index_done_callback(&self) -> Result<()> {
        let data = self.data.read();
        write_snapshot(&self.path, &*data)
    }
}

//! Storage abstraction: four capabilities (key-value, vector, graph,
//! doc-status), each scoped to a namespace within a workspace. Backends
//! register by name; selection is config-driven. The built-ins keep state
//! in process and persist JSON snapshots under the working directory.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::GlobalConfig;
use crate::embedding::BatchingEmbedder;
use crate::error::{RagError, Result};
use crate::types::{DocStatus, DocStatusRecord, EdgeData, NodeData};

pub mod doc_status;
pub mod json_kv;
pub mod memory_graph;
pub mod memory_vector;

pub use doc_status::JsonDocStatusStorage;
pub use json_kv::JsonKvStorage;
pub use memory_graph::PetgraphStorage;
pub use memory_vector::SimpleVectorStorage;

/// Everything a backend constructor gets to work with.
#[derive(Clone)]
pub struct StorageContext {
    pub namespace: String,
    pub workspace: String,
    pub working_dir: PathBuf,
    pub config: Arc<GlobalConfig>,
    /// Present for vector storages only.
    pub embedder: Option<Arc<BatchingEmbedder>>,
}

impl StorageContext {
    /// Snapshot file for a built-in backend: `<kind>_<namespace>_<workspace>.json`.
    pub fn snapshot_path(&self, kind: &str) -> PathBuf {
        self.working_dir
            .join(format!("{}_{}_{}.json", kind, self.namespace, self.workspace))
    }
}

#[async_trait]
pub trait KvStorage: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<Value>>;
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<Value>>>;
    /// Subset of `keys` not yet stored.
    async fn filter_keys(&self, keys: &[String]) -> Result<HashSet<String>>;
    async fn upsert(&self, data: HashMap<String, Value>) -> Result<()>;
    /// Remove rows keyed by a doc id or referencing one through `full_doc_id`.
    async fn delete_by_doc_ids(&self, doc_ids: &[String]) -> Result<()>;
    /// text_chunks only: chunk ids whose `full_doc_id` is in `doc_ids`.
    async fn get_chunk_ids_by_doc_ids(&self, doc_ids: &[String]) -> Result<Vec<String>>;
    async fn index_done_callback(&self) -> Result<()>;
}

/// Row handed to a vector storage upsert. `fields` carries namespace-specific
/// columns (entity_name, src_id/tgt_id, full_doc_id, …) next to the embedded
/// content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    /// Cosine similarity; higher is closer.
    pub distance: f32,
    pub content: String,
    pub metadata: Value,
    pub fields: Map<String, Value>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl VectorHit {
    fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    pub fn entity_name(&self) -> Option<&str> {
        self.field_str("entity_name")
    }

    pub fn src_id(&self) -> Option<&str> {
        self.field_str("src_id")
    }

    pub fn tgt_id(&self) -> Option<&str> {
        self.field_str("tgt_id")
    }
}

#[async_trait]
pub trait VectorStorage: Send + Sync {
    /// Embed and store; overwrites rows with the same id.
    async fn upsert(&self, data: HashMap<String, VectorRecord>) -> Result<()>;
    /// Similarity search ANDed with the filter and the configured threshold,
    /// ordered by descending similarity, limited to `top_k`.
    async fn query(
        &self,
        query: &str,
        top_k: usize,
        filter: &crate::filter::VectorFilter,
    ) -> Result<Vec<VectorHit>>;
    async fn delete_by_ids(&self, ids: &[String]) -> Result<()>;
    async fn delete_by_doc_ids(&self, doc_ids: &[String]) -> Result<()>;
    /// Remove rows whose `entity_name` equals the canonical name.
    async fn delete_entity(&self, entity_name: &str) -> Result<()>;
    /// Remove relationship rows touching the canonical name on either side.
    async fn delete_relation(&self, entity_name: &str) -> Result<()>;
    async fn index_done_callback(&self) -> Result<()>;
}

#[async_trait]
pub trait GraphStorage: Send + Sync {
    async fn has_node(&self, node_id: &str) -> Result<bool>;
    async fn has_edge(&self, src_id: &str, tgt_id: &str) -> Result<bool>;
    async fn get_node(&self, node_id: &str) -> Result<Option<NodeData>>;
    async fn get_edge(&self, src_id: &str, tgt_id: &str) -> Result<Option<EdgeData>>;
    async fn node_degree(&self, node_id: &str) -> Result<usize>;
    async fn edge_degree(&self, src_id: &str, tgt_id: &str) -> Result<usize>;
    /// Incident edges as (source, connected) pairs.
    async fn get_node_edges(&self, node_id: &str) -> Result<Vec<(String, String)>>;
    async fn upsert_node(&self, node_id: &str, data: NodeData) -> Result<()>;
    async fn upsert_edge(&self, src_id: &str, tgt_id: &str, data: EdgeData) -> Result<()>;
    async fn delete_node(&self, node_id: &str) -> Result<()>;
    /// Strip `chunk_ids` from every node/edge `source_id` set and delete the
    /// ones whose set becomes empty. Returns (removed entity names, removed
    /// edge pairs sorted within each pair).
    async fn delete_by_chunk_ids(
        &self,
        chunk_ids: &[String],
    ) -> Result<(Vec<String>, Vec<(String, String)>)>;
    /// Distinct entity types: (lowercased pool, as-stored pool).
    async fn get_types(&self) -> Result<(Vec<String>, Vec<String>)>;
    /// Nodes whose entity type matches any of `types` (case-insensitive,
    /// quote-insensitive).
    async fn get_node_from_types(&self, types: &[String]) -> Result<Vec<(String, NodeData)>>;
    /// Edge pairs lying on paths of length ≤ k starting at `node_id`.
    async fn get_neighbors_within_k_hops(
        &self,
        node_id: &str,
        k: usize,
    ) -> Result<Vec<(String, String)>>;
    async fn index_done_callback(&self) -> Result<()>;
}

#[async_trait]
pub trait DocStatusStorage: Send + Sync {
    async fn filter_keys(&self, keys: &[String]) -> Result<HashSet<String>>;
    async fn get_docs_by_status(&self, status: DocStatus)
        -> Result<HashMap<String, DocStatusRecord>>;
    async fn get_status_counts(&self) -> Result<HashMap<String, usize>>;
    async fn upsert(&self, data: HashMap<String, DocStatusRecord>) -> Result<()>;
    async fn index_done_callback(&self) -> Result<()>;
}

type KvFactory = Box<dyn Fn(&StorageContext) -> Result<Arc<dyn KvStorage>> + Send + Sync>;
type VectorFactory = Box<dyn Fn(&StorageContext) -> Result<Arc<dyn VectorStorage>> + Send + Sync>;
type GraphFactory = Box<dyn Fn(&StorageContext) -> Result<Arc<dyn GraphStorage>> + Send + Sync>;
type DocStatusFactory =
    Box<dyn Fn(&StorageContext) -> Result<Arc<dyn DocStatusStorage>> + Send + Sync>;

/// Name-keyed backend registry. Unknown names are a fatal storage error.
#[derive(Default)]
pub struct StorageRegistry {
    kv: HashMap<String, KvFactory>,
    vector: HashMap<String, VectorFactory>,
    graph: HashMap<String, GraphFactory>,
    doc_status: HashMap<String, DocStatusFactory>,
}

impl StorageRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register_kv("JsonKvStorage", |ctx| {
            Ok(Arc::new(JsonKvStorage::open(ctx)?) as Arc<dyn KvStorage>)
        });
        registry.register_vector("SimpleVectorStorage", |ctx| {
            Ok(Arc::new(SimpleVectorStorage::open(ctx)?) as Arc<dyn VectorStorage>)
        });
        registry.register_graph("PetgraphStorage", |ctx| {
            Ok(Arc::new(PetgraphStorage::open(ctx)?) as Arc<dyn GraphStorage>)
        });
        registry.register_doc_status("JsonDocStatusStorage", |ctx| {
            Ok(Arc::new(JsonDocStatusStorage::open(ctx)?) as Arc<dyn DocStatusStorage>)
        });
        registry
    }

    pub fn register_kv(
        &mut self,
        name: &str,
        factory: impl Fn(&StorageContext) -> Result<Arc<dyn KvStorage>> + Send + Sync + 'static,
    ) {
        self.kv.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_vector(
        &mut self,
        name: &str,
        factory: impl Fn(&StorageContext) -> Result<Arc<dyn VectorStorage>> + Send + Sync + 'static,
    ) {
        self.vector.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_graph(
        &mut self,
        name: &str,
        factory: impl Fn(&StorageContext) -> Result<Arc<dyn GraphStorage>> + Send + Sync + 'static,
    ) {
        self.graph.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_doc_status(
        &mut self,
        name: &str,
        factory: impl Fn(&StorageContext) -> Result<Arc<dyn DocStatusStorage>> + Send + Sync + 'static,
    ) {
        self.doc_status.insert(name.to_string(), Box::new(factory));
    }

    pub fn build_kv(&self, name: &str, ctx: &StorageContext) -> Result<Arc<dyn KvStorage>> {
        let factory = self
            .kv
            .get(name)
            .ok_or_else(|| RagError::storage_fatal(format!("unknown kv storage '{name}'")))?;
        factory(ctx)
    }

    pub fn build_vector(&self, name: &str, ctx: &StorageContext) -> Result<Arc<dyn VectorStorage>> {
        let factory = self
            .vector
            .get(name)
            .ok_or_else(|| RagError::storage_fatal(format!("unknown vector storage '{name}'")))?;
        factory(ctx)
    }

    pub fn build_graph(&self, name: &str, ctx: &StorageContext) -> Result<Arc<dyn GraphStorage>> {
        let factory = self
            .graph
            .get(name)
            .ok_or_else(|| RagError::storage_fatal(format!("unknown graph storage '{name}'")))?;
        factory(ctx)
    }

    pub fn build_doc_status(
        &self,
        name: &str,
        ctx: &StorageContext,
    ) -> Result<Arc<dyn DocStatusStorage>> {
        let factory = self.doc_status.get(name).ok_or_else(|| {
            RagError::storage_fatal(format!("unknown doc status storage '{name}'"))
        })?;
        factory(ctx)
    }
}

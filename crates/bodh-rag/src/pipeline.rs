//! Engine façade and pipeline coordinator: construction over the storage
//! registry, enqueue → cascade-delete → process → finalize, and the public
//! insert/query entry points.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};

use crate::config::GlobalConfig;
use crate::embedding::{BatchingEmbedder, EmbeddingClient, EmbeddingProgress};
use crate::error::{RagError, Result};
use crate::extract::extract_entities;
use crate::chunker::chunk_by_token_size;
use crate::ids::{clean_text, compute_mdhash_id, content_summary, PREFIX_CHUNK, PREFIX_DOC};
use crate::ingest::{
    extract_text_fields, generate_chunks_per_field, prepare_insert_payload, ORIGINAL_DATA_KEY,
};
use crate::llm::{CachedLlm, LlmClient};
use crate::storage::{
    DocStatusStorage, GraphStorage, KvStorage, StorageContext, StorageRegistry, VectorRecord,
    VectorStorage,
};
use crate::tokenize::{BpeTokenizer, Tokenizer};
use crate::types::{
    ChunkRecord, DocStatus, DocStatusRecord, DocumentRecord, InsertInput, InsertOptions,
    QueryParam, QueryResponse, StructuredRow, TableSchema,
};

const SUMMARY_MAX_CHARS: usize = 100;
const RETRY_ATTEMPTS: usize = 3;

/// Optional collaborator receiving the tabular projection of structured
/// inserts. The engine ships no SQL driver; a host wires one in here.
#[async_trait]
pub trait StructuredSink: Send + Sync {
    async fn write_rows(&self, schema: &TableSchema, rows: &[StructuredRow]) -> Result<()>;
}

pub struct RagEngine {
    pub(crate) config: Arc<GlobalConfig>,
    pub(crate) tokenizer: Arc<dyn Tokenizer>,
    pub(crate) llm: CachedLlm,
    pub(crate) embedder: Arc<BatchingEmbedder>,
    pub(crate) full_docs: Arc<dyn KvStorage>,
    pub(crate) text_chunks: Arc<dyn KvStorage>,
    pub(crate) llm_response_cache: Option<Arc<dyn KvStorage>>,
    pub(crate) chunks_vdb: Arc<dyn VectorStorage>,
    pub(crate) entities_vdb: Arc<dyn VectorStorage>,
    pub(crate) entity_name_vdb: Arc<dyn VectorStorage>,
    pub(crate) relationships_vdb: Arc<dyn VectorStorage>,
    pub(crate) graph: Arc<dyn GraphStorage>,
    pub(crate) doc_status: Arc<dyn DocStatusStorage>,
    structured_sink: Option<Arc<dyn StructuredSink>>,
}

static LOG_INIT: Once = Once::new();

fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_ansi(false)
            .try_init();
    });
}

impl RagEngine {
    pub fn new(
        config: GlobalConfig,
        llm: Arc<dyn LlmClient>,
        embedding: Arc<dyn EmbeddingClient>,
    ) -> Result<Self> {
        Self::with_registry(config, llm, embedding, &StorageRegistry::with_builtins())
    }

    pub fn with_registry(
        config: GlobalConfig,
        llm: Arc<dyn LlmClient>,
        embedding: Arc<dyn EmbeddingClient>,
        registry: &StorageRegistry,
    ) -> Result<Self> {
        init_logging();
        config
            .validate()
            .map_err(RagError::Validation)?;
        std::fs::create_dir_all(&config.working_dir)?;
        tracing::info!(working_dir = %config.working_dir.display(), workspace = %config.workspace, "initializing engine");

        let config = Arc::new(config);
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(BpeTokenizer::for_model(
            &config.chunking.tokenizer_model_name,
        )?);
        let embedder = Arc::new(BatchingEmbedder::new(
            embedding,
            config.embedding.embedding_batch_num,
            config.embedding.embedding_func_max_async,
            config.embedding.embedding_cache_size,
        ));

        let ctx = |namespace: &str, with_embedder: bool| StorageContext {
            namespace: namespace.to_string(),
            workspace: config.workspace.clone(),
            working_dir: config.working_dir.clone(),
            config: config.clone(),
            embedder: with_embedder.then(|| embedder.clone()),
        };

        let kv_name = &config.storage.kv_storage;
        let vec_name = &config.storage.vector_storage;
        let full_docs = registry.build_kv(kv_name, &ctx("full_docs", false))?;
        let text_chunks = registry.build_kv(kv_name, &ctx("text_chunks", false))?;
        let llm_response_cache = if config.llm.enable_llm_cache {
            Some(registry.build_kv(kv_name, &ctx("llm_response_cache", false))?)
        } else {
            None
        };
        let chunks_vdb = registry.build_vector(vec_name, &ctx("chunks", true))?;
        let entities_vdb = registry.build_vector(vec_name, &ctx("entities", true))?;
        let entity_name_vdb = registry.build_vector(vec_name, &ctx("entities_name", true))?;
        let relationships_vdb = registry.build_vector(vec_name, &ctx("relationships", true))?;
        let graph = registry.build_graph(
            &config.storage.graph_storage,
            &ctx("chunk_entity_relation", false),
        )?;
        let doc_status = registry.build_doc_status(
            &config.storage.doc_status_storage,
            &ctx("doc_status", false),
        )?;

        let llm = CachedLlm::new(llm, llm_response_cache.clone(), config.llm.llm_model_max_async);

        Ok(Self {
            config,
            tokenizer,
            llm,
            embedder,
            full_docs,
            text_chunks,
            llm_response_cache,
            chunks_vdb,
            entities_vdb,
            entity_name_vdb,
            relationships_vdb,
            graph,
            doc_status,
            structured_sink: None,
        })
    }

    pub fn with_structured_sink(mut self, sink: Arc<dyn StructuredSink>) -> Self {
        self.structured_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    pub fn text_chunks(&self) -> &Arc<dyn KvStorage> {
        &self.text_chunks
    }

    pub fn full_docs(&self) -> &Arc<dyn KvStorage> {
        &self.full_docs
    }

    pub fn graph(&self) -> &Arc<dyn GraphStorage> {
        &self.graph
    }

    pub fn chunks_index(&self) -> &Arc<dyn VectorStorage> {
        &self.chunks_vdb
    }

    pub fn entities_index(&self) -> &Arc<dyn VectorStorage> {
        &self.entities_vdb
    }

    pub fn entity_names_index(&self) -> &Arc<dyn VectorStorage> {
        &self.entity_name_vdb
    }

    pub fn relationships_index(&self) -> &Arc<dyn VectorStorage> {
        &self.relationships_vdb
    }

    pub fn embedding_progress(&self) -> EmbeddingProgress {
        self.embedder.progress()
    }

    /// Ingest: plan → enqueue → process → sideload structured rows →
    /// finalize. Returns the structured side-output rows.
    pub async fn insert(
        &self,
        input: InsertInput,
        options: InsertOptions,
    ) -> Result<Vec<StructuredRow>> {
        let payload = prepare_insert_payload(&self.config, input, &options)?;
        tracing::info!(
            documents = payload.documents.len(),
            overwrite = options.overwrite,
            "insert called"
        );

        self.enqueue_documents(
            payload.documents,
            payload.ids,
            payload.metadatas,
            options.overwrite,
        )
        .await?;
        self.process_enqueued().await?;

        if !payload.structured_rows.is_empty() {
            if let Some(schema) = &options.schema {
                if let Some(sink) = &self.structured_sink {
                    if schema.table.is_none() {
                        return Err(RagError::Validation(
                            "schema.table is required for structured writes".to_string(),
                        ));
                    }
                    sink.write_rows(schema, &payload.structured_rows).await?;
                } else {
                    tracing::warn!("no structured sink configured; skipping structured insert");
                }
            }
        }

        self.finalize_insert().await;
        Ok(payload.structured_rows)
    }

    /// Stage documents into doc-status as PENDING. With `overwrite` the
    /// already-known check is skipped and existing state is cascade-deleted.
    pub async fn enqueue_documents(
        &self,
        documents: Vec<String>,
        ids: Option<Vec<String>>,
        metadatas: Option<Vec<Map<String, Value>>>,
        overwrite: bool,
    ) -> Result<usize> {
        if documents.is_empty() {
            tracing::info!("no documents to enqueue");
            return Ok(0);
        }
        if let Some(ids) = &ids {
            if ids.len() != documents.len() {
                return Err(RagError::Validation(
                    "number of ids must match the number of documents".to_string(),
                ));
            }
            let unique: HashSet<&String> = ids.iter().collect();
            if unique.len() != ids.len() {
                return Err(RagError::Validation("ids must be unique".to_string()));
            }
        }
        if let Some(metadatas) = &metadatas {
            if metadatas.len() != documents.len() {
                return Err(RagError::Validation(
                    "number of metadatas must match the number of documents".to_string(),
                ));
            }
        }

        // (id, content, metadata) triples; without explicit ids the content is
        // cleaned and deduplicated before hashing.
        let mut entries: Vec<(String, String, Map<String, Value>)> = Vec::new();
        match ids {
            Some(ids) => {
                for (i, (id, content)) in ids.into_iter().zip(documents).enumerate() {
                    let metadata = metadatas
                        .as_ref()
                        .map(|m| m[i].clone())
                        .unwrap_or_default();
                    entries.push((id, content, metadata));
                }
            }
            None => {
                let mut seen = HashSet::new();
                for content in documents {
                    let cleaned = clean_text(&content);
                    if cleaned.is_empty() || !seen.insert(cleaned.clone()) {
                        continue;
                    }
                    let id = compute_mdhash_id(&cleaned, PREFIX_DOC);
                    entries.push((id, cleaned, Map::new()));
                }
            }
        }

        let now = Utc::now();
        let mut new_docs: HashMap<String, DocStatusRecord> = entries
            .into_iter()
            .map(|(id, content, metadata)| {
                let record = DocStatusRecord {
                    content_summary: content_summary(&content, SUMMARY_MAX_CHARS),
                    content_length: content.chars().count(),
                    content,
                    status: DocStatus::Pending,
                    chunks_count: None,
                    metadata: Value::Object(metadata),
                    created_at: now,
                    updated_at: now,
                };
                (id, record)
            })
            .collect();

        let all_ids: Vec<String> = new_docs.keys().cloned().collect();
        let keep: HashSet<String> = if overwrite {
            tracing::info!(count = all_ids.len(), "overwrite mode: processing all documents");
            all_ids.iter().cloned().collect()
        } else {
            let fresh = self.doc_status.filter_keys(&all_ids).await?;
            tracing::info!(
                fresh = fresh.len(),
                total = all_ids.len(),
                "normal mode: filtered already-known documents"
            );
            fresh
        };
        new_docs.retain(|id, _| keep.contains(id));
        if new_docs.is_empty() {
            tracing::info!("no new unique documents were found");
            return Ok(0);
        }

        if overwrite {
            let doc_ids: Vec<String> = new_docs.keys().cloned().collect();
            self.cascade_delete(&doc_ids).await;
        }

        let count = new_docs.len();
        let doc_status = self.doc_status.clone();
        with_retry("doc_status.upsert", || {
            let rows = new_docs.clone();
            let doc_status = doc_status.clone();
            async move { doc_status.upsert(rows).await }
        })
        .await?;
        tracing::info!(count, overwrite, "documents enqueued");
        Ok(count)
    }

    /// Cascade-delete every chunk, graph element and vector row derived from
    /// the given documents. Failures are logged; the surrounding upsert
    /// proceeds and the stores become consistent on the next overwrite.
    async fn cascade_delete(&self, doc_ids: &[String]) {
        if let Err(e) = self.cascade_delete_inner(doc_ids).await {
            tracing::error!(error = %e, "cascade delete failed, proceeding with upsert");
        }
    }

    async fn cascade_delete_inner(&self, doc_ids: &[String]) -> Result<()> {
        let chunk_ids = self.text_chunks.get_chunk_ids_by_doc_ids(doc_ids).await?;
        if chunk_ids.is_empty() {
            tracing::info!(?doc_ids, "no chunks found, skipping cascade delete");
            return Ok(());
        }

        let (removed_entities, removed_pairs) =
            self.graph.delete_by_chunk_ids(&chunk_ids).await?;

        let ent_ids: Vec<String> = removed_entities
            .iter()
            .map(|e| crate::ids::entity_vector_id(e))
            .collect();
        let ename_ids: Vec<String> = removed_entities
            .iter()
            .map(|e| crate::ids::entity_name_vector_id(e))
            .collect();
        let rel_ids: Vec<String> = removed_pairs
            .iter()
            .map(|(s, t)| crate::ids::relation_vector_id(s, t))
            .collect();

        let (a, b, c, d, e) = futures::join!(
            self.entities_vdb.delete_by_ids(&ent_ids),
            self.entity_name_vdb.delete_by_ids(&ename_ids),
            self.relationships_vdb.delete_by_ids(&rel_ids),
            self.chunks_vdb.delete_by_doc_ids(doc_ids),
            self.text_chunks.delete_by_doc_ids(doc_ids),
        );
        for result in [a, b, c, d, e] {
            if let Err(err) = result {
                tracing::error!(error = %err, "partial cascade delete failure");
            }
        }

        tracing::info!(
            docs = doc_ids.len(),
            chunks = chunk_ids.len(),
            entities = removed_entities.len(),
            relations = removed_pairs.len(),
            "cascade delete complete"
        );
        Ok(())
    }

    /// Drain PENDING/PROCESSING/FAILED documents in id order, with
    /// `max_parallel_insert` documents in flight per batch.
    pub async fn process_enqueued(&self) -> Result<()> {
        let (processing, failed, pending) = futures::try_join!(
            self.doc_status.get_docs_by_status(DocStatus::Processing),
            self.doc_status.get_docs_by_status(DocStatus::Failed),
            self.doc_status.get_docs_by_status(DocStatus::Pending),
        )?;

        let mut to_process: BTreeMap<String, DocStatusRecord> = BTreeMap::new();
        to_process.extend(processing);
        to_process.extend(failed);
        to_process.extend(pending);
        if to_process.is_empty() {
            tracing::info!("no documents to process");
            return Ok(());
        }

        let docs: Vec<(String, DocStatusRecord)> = to_process.into_iter().collect();
        let batches: Vec<&[(String, DocStatusRecord)]> =
            docs.chunks(self.config.max_parallel_insert).collect();
        tracing::info!(batches = batches.len(), docs = docs.len(), "processing document batches");

        for batch in batches {
            futures::future::join_all(
                batch
                    .iter()
                    .map(|(doc_id, record)| self.process_single_document(doc_id, record)),
            )
            .await;
        }
        tracing::info!("document processing pipeline completed");
        Ok(())
    }

    /// Chunk, index and extract one document. Errors downgrade the document
    /// to FAILED without poisoning the batch.
    async fn process_single_document(&self, doc_id: &str, record: &DocStatusRecord) {
        let mut processing = record.clone();
        processing.status = DocStatus::Processing;
        if let Err(e) = self
            .doc_status
            .upsert(HashMap::from([(doc_id.to_string(), processing)]))
            .await
        {
            tracing::error!(doc = doc_id, error = %e, "failed to mark document processing");
        }

        match self.run_document_pipeline(doc_id, record).await {
            Ok(chunks_count) => {
                let mut done = record.clone();
                done.status = DocStatus::Processed;
                done.chunks_count = Some(chunks_count);
                done.metadata = normalize_metadata(&record.metadata);
                done.updated_at = Utc::now();
                if let Err(e) = self
                    .doc_status
                    .upsert(HashMap::from([(doc_id.to_string(), done)]))
                    .await
                {
                    tracing::error!(doc = doc_id, error = %e, "failed to mark document processed");
                }
            }
            Err(e) => {
                tracing::error!(doc = doc_id, error = %e, "document processing failed");
                let mut failed = record.clone();
                failed.status = DocStatus::Failed;
                failed.updated_at = Utc::now();
                if let Err(err) = self
                    .doc_status
                    .upsert(HashMap::from([(doc_id.to_string(), failed)]))
                    .await
                {
                    tracing::error!(doc = doc_id, error = %err, "failed to mark document failed");
                }
            }
        }
    }

    async fn run_document_pipeline(
        &self,
        doc_id: &str,
        record: &DocStatusRecord,
    ) -> Result<usize> {
        let metadata = normalize_metadata(&record.metadata);
        let metadata_map = metadata.as_object().cloned().unwrap_or_default();

        let chunks = self.plan_document_chunks(doc_id, &record.content, &metadata_map)?;
        tracing::info!(doc = doc_id, chunks = chunks.len(), "chunked document");

        let now = Utc::now();
        let mut vector_rows = HashMap::new();
        let mut kv_rows = HashMap::new();
        for (chunk_id, chunk) in &chunks {
            let mut fields = Map::new();
            fields.insert("full_doc_id".to_string(), Value::String(chunk.full_doc_id.clone()));
            fields.insert("tokens".to_string(), Value::from(chunk.tokens));
            fields.insert(
                "chunk_order_index".to_string(),
                Value::from(chunk.chunk_order_index),
            );
            vector_rows.insert(
                chunk_id.clone(),
                VectorRecord {
                    content: chunk.content.clone(),
                    metadata: chunk.metadata.clone(),
                    fields,
                },
            );
            let mut stored = chunk.clone();
            stored.updated_at = Some(now);
            kv_rows.insert(chunk_id.clone(), serde_json::to_value(stored)?);
        }
        let doc_row = serde_json::to_value(DocumentRecord {
            content: record.content.clone(),
            metadata: metadata.clone(),
        })?;

        let chunks_vdb = self.chunks_vdb.clone();
        let full_docs = self.full_docs.clone();
        let text_chunks = self.text_chunks.clone();
        let (a, b, c) = futures::join!(
            with_retry("chunks_vdb.upsert", || {
                let rows = vector_rows.clone();
                let chunks_vdb = chunks_vdb.clone();
                async move { chunks_vdb.upsert(rows).await }
            }),
            with_retry("full_docs.upsert", || {
                let row = doc_row.clone();
                let full_docs = full_docs.clone();
                let doc_id = doc_id.to_string();
                async move { full_docs.upsert(HashMap::from([(doc_id, row)])).await }
            }),
            with_retry("text_chunks.upsert", || {
                let rows = kv_rows.clone();
                let text_chunks = text_chunks.clone();
                async move { text_chunks.upsert(rows).await }
            }),
        );
        a?;
        b?;
        c?;

        if !chunks.is_empty() {
            tracing::info!(doc = doc_id, chunks = chunks.len(), "running entity extraction");
            extract_entities(
                &chunks,
                &self.graph,
                &self.entities_vdb,
                &self.entity_name_vdb,
                &self.relationships_vdb,
                &self.llm,
                &self.config,
            )
            .await?;
        }
        Ok(chunks.len())
    }

    /// Field-split chunk planning when the original record is available,
    /// otherwise a single `_all` population over the document content.
    fn plan_document_chunks(
        &self,
        doc_id: &str,
        content: &str,
        metadata: &Map<String, Value>,
    ) -> Result<HashMap<String, ChunkRecord>> {
        if self.config.field_split.enable_field_splitting {
            if let Some(Value::Object(original)) = metadata.get(ORIGINAL_DATA_KEY) {
                let (text_fields, merged_metadata) =
                    extract_text_fields(original, &self.config.field_split.text_field_keys);
                return generate_chunks_per_field(
                    &self.config,
                    self.tokenizer.as_ref(),
                    doc_id,
                    &text_fields,
                    &merged_metadata,
                );
            }
        }

        let pieces = chunk_by_token_size(
            self.tokenizer.as_ref(),
            content,
            self.config.chunking.chunk_overlap_token_size,
            self.config.chunking.chunk_token_size,
        )?;
        let mut chunks = HashMap::new();
        for piece in pieces {
            let mut chunk_metadata = metadata.clone();
            chunk_metadata.insert("text_field".to_string(), Value::String("_all".to_string()));
            chunks.insert(
                compute_mdhash_id(&piece.content, PREFIX_CHUNK),
                ChunkRecord {
                    tokens: piece.tokens,
                    content: piece.content,
                    chunk_order_index: piece.chunk_order_index,
                    full_doc_id: doc_id.to_string(),
                    metadata: Value::Object(chunk_metadata),
                    updated_at: None,
                },
            );
        }
        Ok(chunks)
    }

    /// Flush every storage; per-store failures are isolated.
    async fn finalize_insert(&self) {
        let mut callbacks: Vec<(&str, futures::future::BoxFuture<'_, Result<()>>)> = vec![
            ("full_docs", Box::pin(self.full_docs.index_done_callback())),
            ("text_chunks", Box::pin(self.text_chunks.index_done_callback())),
            ("chunks_vdb", Box::pin(self.chunks_vdb.index_done_callback())),
            ("entities_vdb", Box::pin(self.entities_vdb.index_done_callback())),
            ("entity_name_vdb", Box::pin(self.entity_name_vdb.index_done_callback())),
            ("relationships_vdb", Box::pin(self.relationships_vdb.index_done_callback())),
            ("graph", Box::pin(self.graph.index_done_callback())),
            ("doc_status", Box::pin(self.doc_status.index_done_callback())),
        ];
        if let Some(cache) = &self.llm_response_cache {
            callbacks.push(("llm_response_cache", Box::pin(cache.index_done_callback())));
        }
        let names: Vec<&str> = callbacks.iter().map(|(n, _)| *n).collect();
        let results =
            futures::future::join_all(callbacks.into_iter().map(|(_, fut)| fut)).await;
        for (name, result) in names.into_iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(store = name, error = %e, "index_done_callback failed");
            }
        }
    }

    pub async fn query(&self, query: &str, param: QueryParam) -> Result<QueryResponse> {
        let response = crate::query::dispatch(self, query, param).await?;
        // Only the response cache mutates during a query.
        if let Some(cache) = &self.llm_response_cache {
            if let Err(e) = cache.index_done_callback().await {
                tracing::error!(error = %e, "llm cache flush failed");
            }
        }
        Ok(response)
    }

    /// Remove one entity (canonicalized) from the graph and every vector
    /// index, together with its relationships.
    pub async fn delete_by_entity(&self, entity_name: &str) -> Result<()> {
        let name = crate::ids::canonical_entity_name(entity_name);
        self.entities_vdb.delete_entity(&name).await?;
        self.entity_name_vdb.delete_entity(&name).await?;
        self.relationships_vdb.delete_relation(&name).await?;
        self.graph.delete_node(&name).await?;
        tracing::info!(entity = %name, "entity and its relationships deleted");

        for (store, result) in [
            ("entities_vdb", self.entities_vdb.index_done_callback().await),
            ("entity_name_vdb", self.entity_name_vdb.index_done_callback().await),
            ("relationships_vdb", self.relationships_vdb.index_done_callback().await),
            ("graph", self.graph.index_done_callback().await),
        ] {
            if let Err(e) = result {
                tracing::error!(store, error = %e, "index_done_callback failed");
            }
        }
        Ok(())
    }

    pub async fn status_counts(&self) -> Result<HashMap<String, usize>> {
        self.doc_status.get_status_counts().await
    }
}

/// JSON-decode metadata that arrived as a string; anything non-object
/// becomes an empty map.
fn normalize_metadata(metadata: &Value) -> Value {
    match metadata {
        Value::Object(_) => metadata.clone(),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(m)) => Value::Object(m),
            _ => {
                tracing::warn!("failed to parse metadata as json, using empty map");
                Value::Object(Map::new())
            }
        },
        _ => Value::Object(Map::new()),
    }
}

/// Retry transient storage errors with exponential backoff; validation and
/// fatal errors surface immediately.
async fn with_retry<T, F, Fut>(op: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Err(e) if e.is_transient() && attempt + 1 < RETRY_ATTEMPTS => {
                attempt += 1;
                let delay = Duration::from_millis(100 * (1 << attempt));
                tracing::warn!(op, attempt, error = %e, "transient storage error, retrying");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_metadata_variants() {
        let obj = serde_json::json!({"a": 1});
        assert_eq!(normalize_metadata(&obj), obj);
        let encoded = Value::String("{\"a\":1}".to_string());
        assert_eq!(normalize_metadata(&encoded), obj);
        let broken = Value::String("not json".to_string());
        assert_eq!(normalize_metadata(&broken), serde_json::json!({}));
        assert_eq!(normalize_metadata(&Value::Null), serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_with_retry_retries_transient_only() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = AtomicUsize::new(0);
        let result: Result<u32> = with_retry("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RagError::storage_transient("flaky"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicUsize::new(0);
        let result: Result<u32> = with_retry("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RagError::Validation("bad".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(RagError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

//! End-to-end pipeline scenarios over the built-in storages, with a scripted
//! LLM and a deterministic n-gram embedder.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use bodh_rag::config::GlobalConfig;
use bodh_rag::embedding::EmbeddingClient;
use bodh_rag::error::{RagError, Result};
use bodh_rag::llm::{ChatTurn, LlmClient};
use bodh_rag::types::{
    FieldSpec, InsertInput, InsertOptions, Metadatas, QueryMode, QueryParam, TableSchema,
};
use bodh_rag::RagEngine;

const TUPLE: &str = "<|>";
const RECORD: &str = "##";
const COMPLETE: &str = "<|COMPLETE|>";

/// Scripted LLM: first rule whose marker appears in the prompt or system
/// prompt wins; unmatched calls return an empty string. Every *uncached*
/// call is recorded.
struct MockLlm {
    rules: Vec<(String, String)>,
    calls: Mutex<Vec<String>>,
}

impl MockLlm {
    fn new(rules: Vec<(&str, String)>) -> Arc<Self> {
        let mut all: Vec<(String, String)> =
            vec![("Answer YES | NO".to_string(), "no".to_string())];
        all.extend(rules.into_iter().map(|(m, r)| (m.to_string(), r)));
        Arc::new(Self {
            rules: all,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls_containing(&self, marker: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.contains(marker))
            .count()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(
        &self,
        prompt: &str,
        _history: &[ChatTurn],
        system_prompt: Option<&str>,
    ) -> Result<String> {
        let combined = format!("{}\n{}", system_prompt.unwrap_or(""), prompt);
        self.calls.lock().push(combined.clone());
        for (marker, reply) in &self.rules {
            if combined.contains(marker) {
                return Ok(reply.clone());
            }
        }
        Ok(String::new())
    }
}

/// Character-trigram hashing embedder: texts sharing substrings land close
/// in cosine space, and identical texts embed identically.
struct NgramEmbedder;

#[async_trait]
impl EmbeddingClient for NgramEmbedder {
    fn embedding_dim(&self) -> usize {
        256
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; 256];
                let chars: Vec<char> = text.chars().collect();
                for window in chars.windows(3.min(chars.len().max(1))) {
                    let mut hasher = DefaultHasher::new();
                    window.hash(&mut hasher);
                    vector[(hasher.finish() % 256) as usize] += 1.0;
                }
                vector
            })
            .collect())
    }
}

fn test_config(dir: &std::path::Path) -> GlobalConfig {
    let mut config = GlobalConfig::default();
    config.working_dir = dir.to_path_buf();
    config.workspace = "test".to_string();
    // Let the metadata filters do the discriminating.
    config.cosine_better_than_threshold = -1.0;
    config
}

fn extraction_reply(records: &[String]) -> String {
    format!("{}{RECORD}{COMPLETE}", records.join(RECORD))
}

fn entity(name: &str, entity_type: &str, description: &str) -> String {
    format!("(\"entity\"{TUPLE}{name}{TUPLE}{entity_type}{TUPLE}{description})")
}

fn relationship(src: &str, tgt: &str, description: &str, keywords: &str, weight: &str) -> String {
    format!(
        "(\"relationship\"{TUPLE}{src}{TUPLE}{tgt}{TUPLE}{description}{TUPLE}{keywords}{TUPLE}{weight})"
    )
}

fn order_schema() -> TableSchema {
    TableSchema {
        table: Some("public.customer_orders".to_string()),
        id_column: "doc_id".to_string(),
        fields: vec![
            ("doc_id".to_string(), FieldSpec::text(false)),
            ("title".to_string(), FieldSpec::text(true)),
            ("summary".to_string(), FieldSpec::text(true)),
            ("body".to_string(), FieldSpec::text(true)),
            ("region".to_string(), FieldSpec::text(true)),
            (
                "priority".to_string(),
                FieldSpec {
                    field_type: "integer".to_string(),
                    nullable: true,
                },
            ),
        ],
        conflict_columns: None,
    }
}

fn order_record() -> Map<String, Value> {
    json!({
        "doc_id": "order-2025-002",
        "title": "北米向けサプライ契約",
        "summary": "北米市場での調達条件を整理したサマリー。",
        "body": ["詳細1: 北米主要ベンダーの評価結果。", "詳細2: リスクと緩和策の一覧。"],
        "region": "APAC",
        "priority": 1,
        "metadata": {"region": "APAC", "category": "supply"},
    })
    .as_object()
    .unwrap()
    .clone()
}

fn naive_param(fields: &[&str], filter: Value) -> QueryParam {
    QueryParam {
        mode: QueryMode::Naive,
        only_need_context: true,
        target_fields: Some(fields.iter().map(|s| s.to_string()).collect()),
        metadata_filter: filter.as_object().cloned(),
        top_k: 5,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_structured_insert_and_field_scoped_naive_query() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new(vec![(
        "北米",
        extraction_reply(&[
            entity("調達計画", "event", "北米市場の調達計画"),
            entity("サプライヤ", "organization", "北米の主要ベンダー"),
            relationship("調達計画", "サプライヤ", "計画がベンダーを評価する", "調達", "1.0"),
        ]),
    )]);
    let engine = RagEngine::new(test_config(dir.path()), llm, Arc::new(NgramEmbedder)).unwrap();

    let rows = engine
        .insert(
            InsertInput::Record(order_record()),
            InsertOptions {
                schema: Some(order_schema()),
                text_fields: Some(vec![
                    "title".to_string(),
                    "summary".to_string(),
                    "body".to_string(),
                ]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Structured side-output carries the declared columns.
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["doc_id"], json!("order-2025-002"));
    assert_eq!(rows[0]["priority"], json!(1));

    // A summary-population chunk exists and carries the record metadata.
    let chunk_ids = engine
        .text_chunks()
        .get_chunk_ids_by_doc_ids(&["order-2025-002".to_string()])
        .await
        .unwrap();
    assert!(!chunk_ids.is_empty());
    let mut found_summary_chunk = false;
    for chunk_id in &chunk_ids {
        let row = engine.text_chunks().get_by_id(chunk_id).await.unwrap().unwrap();
        let metadata = &row["metadata"];
        if metadata["text_field"] == json!("summary") {
            assert!(chunk_id.starts_with("chunk-summary-"));
            assert_eq!(metadata["region"], json!("APAC"));
            found_summary_chunk = true;
        }
    }
    assert!(found_summary_chunk);

    // Field-scoped query with a matching metadata filter hits the summary.
    let response = engine
        .query(
            "調達条件",
            naive_param(&["summary"], json!({"region": "APAC"})),
        )
        .await
        .unwrap();
    assert!(response.content.contains("北米市場での調達条件"));
    assert!(!response.sources.is_empty());
    assert!(response
        .sources
        .iter()
        .all(|s| !s.contains("北米向けサプライ契約")));

    // A non-matching filter yields the canned fail response and no sources.
    let response = engine
        .query(
            "調達条件",
            naive_param(&["summary"], json!({"region": "EMEA"})),
        )
        .await
        .unwrap();
    assert!(response.sources.is_empty());
    assert!(response.content.contains("Sorry"));
}

#[tokio::test]
async fn test_overwrite_cascades_across_all_stores() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new(vec![
        (
            "first revision",
            extraction_reply(&[
                entity("E1", "organization", "first supplier"),
                entity("E2", "organization", "first customer"),
                relationship("E1", "E2", "E1 ships to E2", "shipping", "1.0"),
            ]),
        ),
        (
            "second revision",
            extraction_reply(&[entity("E3", "organization", "replacement vendor")]),
        ),
    ]);
    let engine = RagEngine::new(test_config(dir.path()), llm, Arc::new(NgramEmbedder)).unwrap();

    engine
        .insert(
            InsertInput::Text("first revision about E1 and E2".to_string()),
            InsertOptions {
                ids: Some(vec!["doc-fixed".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(engine.graph().has_node("\"E1\"").await.unwrap());
    assert!(engine.graph().has_edge("\"E1\"", "\"E2\"").await.unwrap());

    engine
        .insert(
            InsertInput::Text("second revision mentioning only E3".to_string()),
            InsertOptions {
                ids: Some(vec!["doc-fixed".to_string()]),
                overwrite: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // E1, E2 and their edge are unreachable everywhere.
    assert!(!engine.graph().has_node("\"E1\"").await.unwrap());
    assert!(!engine.graph().has_node("\"E2\"").await.unwrap());
    assert!(!engine.graph().has_edge("\"E1\"", "\"E2\"").await.unwrap());
    assert!(engine.graph().has_node("\"E3\"").await.unwrap());

    let filter = bodh_rag::VectorFilter::default();
    let entity_hits = engine.entities_index().query("E1", 20, &filter).await.unwrap();
    assert!(entity_hits
        .iter()
        .all(|h| h.entity_name() != Some("\"E1\"") && h.entity_name() != Some("\"E2\"")));
    let name_hits = engine
        .entity_names_index()
        .query("E1", 20, &filter)
        .await
        .unwrap();
    assert!(name_hits.iter().all(|h| h.entity_name() != Some("\"E1\"")));
    let rel_hits = engine
        .relationships_index()
        .query("shipping", 20, &filter)
        .await
        .unwrap();
    assert!(rel_hits.is_empty());

    // Old chunks are gone from both chunk stores.
    let chunk_ids = engine
        .text_chunks()
        .get_chunk_ids_by_doc_ids(&["doc-fixed".to_string()])
        .await
        .unwrap();
    for chunk_id in &chunk_ids {
        let row = engine.text_chunks().get_by_id(chunk_id).await.unwrap().unwrap();
        assert!(row["content"].as_str().unwrap().contains("second revision"));
    }
}

#[tokio::test]
async fn test_descriptions_merge_sorted_and_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new(vec![
        (
            "doc one",
            extraction_reply(&[
                entity("ACME", "organization", "a supplier"),
                relationship("ACME", "BOLT", "acme supplies bolt", "supply", "1.0"),
            ]),
        ),
        (
            "doc two",
            extraction_reply(&[
                entity("ACME", "organization", "a customer"),
                relationship("ACME", "BOLT", "acme buys from bolt", "purchasing", "1.0"),
            ]),
        ),
    ]);
    let engine = RagEngine::new(test_config(dir.path()), llm, Arc::new(NgramEmbedder)).unwrap();

    engine
        .insert(InsertInput::Text("doc one about acme".to_string()), InsertOptions::default())
        .await
        .unwrap();
    engine
        .insert(InsertInput::Text("doc two about acme".to_string()), InsertOptions::default())
        .await
        .unwrap();

    let node = engine.graph().get_node("\"ACME\"").await.unwrap().unwrap();
    assert_eq!(node.description, "a customer<SEP>a supplier");

    // Both documents contributed a source chunk.
    assert_eq!(node.source_id.split("<SEP>").count(), 2);

    let edge = engine.graph().get_edge("\"ACME\"", "\"BOLT\"").await.unwrap().unwrap();
    assert!((edge.weight - 2.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_reinserting_known_document_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new(vec![(
        "stable text",
        extraction_reply(&[
            entity("A", "organization", "org a"),
            relationship("A", "B", "a to b", "link", "1.0"),
        ]),
    )]);
    let engine = RagEngine::new(test_config(dir.path()), llm.clone(), Arc::new(NgramEmbedder))
        .unwrap();

    engine
        .insert(InsertInput::Text("stable text".to_string()), InsertOptions::default())
        .await
        .unwrap();
    let extraction_calls = llm.calls_containing("stable text");

    // Same content again: filtered out at enqueue, no further LLM work.
    engine
        .insert(InsertInput::Text("stable text".to_string()), InsertOptions::default())
        .await
        .unwrap();
    assert_eq!(llm.calls_containing("stable text"), extraction_calls);

    let counts = engine.status_counts().await.unwrap();
    assert_eq!(counts.get("PROCESSED"), Some(&1));
}

#[tokio::test]
async fn test_hybrid_query_deduplicates_sources() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new(vec![
        (
            "ACME supplies BOLT",
            extraction_reply(&[
                entity("ACME", "organization", "precision parts maker"),
                entity("BOLT", "organization", "assembly plant"),
                relationship("ACME", "BOLT", "acme supplies bolt", "supply chain", "2.0"),
            ]),
        ),
        (
            "high-level and low-level keywords",
            json!({
                "high_level_keywords": ["supply chain"],
                "low_level_keywords": ["ACME"],
            })
            .to_string(),
        ),
    ]);
    let engine = RagEngine::new(test_config(dir.path()), llm, Arc::new(NgramEmbedder)).unwrap();

    engine
        .insert(
            InsertInput::Text("ACME supplies BOLT with precision parts.".to_string()),
            InsertOptions::default(),
        )
        .await
        .unwrap();

    let response = engine
        .query(
            "who supplies bolt?",
            QueryParam {
                mode: QueryMode::Light,
                only_need_context: true,
                top_k: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Local and global branches both resolve the same chunk; set semantics
    // keep one copy.
    assert_eq!(response.sources.len(), 1);
    assert!(response.sources[0].contains("ACME supplies BOLT"));
    assert!(response.content.contains("-----Entities-----"));
    assert!(response.content.contains("-----Relationships-----"));
    assert!(response.content.contains("-----Sources-----"));
}

#[tokio::test]
async fn test_mini_query_returns_sources_and_provenance() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new(vec![
        (
            "ACME supplies BOLT",
            extraction_reply(&[
                entity("ACME", "organization", "precision parts maker"),
                entity("BOLT", "organization", "assembly plant"),
                relationship("ACME", "BOLT", "acme supplies bolt", "supply chain", "2.0"),
            ]),
        ),
        (
            "answer_type_keywords",
            json!({
                "answer_type_keywords": ["organization"],
                "entities_from_query": ["ACME"],
            })
            .to_string(),
        ),
    ]);
    let engine = RagEngine::new(test_config(dir.path()), llm, Arc::new(NgramEmbedder)).unwrap();

    engine
        .insert(
            InsertInput::Text("ACME supplies BOLT with precision parts.".to_string()),
            InsertOptions::default(),
        )
        .await
        .unwrap();

    let response = engine
        .query(
            "who supplies bolt?",
            QueryParam {
                mode: QueryMode::Mini,
                only_need_context: true,
                include_provenance: true,
                top_k: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!response.sources.is_empty());
    assert!(response.content.contains("-----Entities-----"));
    assert!(response.content.contains("-----Sources-----"));

    let provenance = response.provenance.unwrap();
    assert!(provenance
        .entities
        .iter()
        .any(|e| e.entity_name == "\"ACME\""));
    assert!(!provenance.chunks.is_empty());
    assert!(provenance.chunks.iter().all(|c| c.chunk_id.starts_with("chunk-")));
}

#[tokio::test]
async fn test_mini_query_applies_metadata_filter_to_path_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new(vec![
        (
            "APAC region",
            extraction_reply(&[
                entity("ACME", "organization", "apac supplier"),
                entity("BOLT", "organization", "apac plant"),
                relationship("ACME", "BOLT", "acme supplies bolt in apac", "supply chain", "2.0"),
            ]),
        ),
        (
            "EMEA region",
            extraction_reply(&[
                entity("ACME", "organization", "emea supplier"),
                entity("BOLT", "organization", "emea plant"),
                relationship("ACME", "BOLT", "acme supplies bolt in emea", "supply chain", "2.0"),
            ]),
        ),
        (
            "answer_type_keywords",
            json!({
                "answer_type_keywords": ["organization"],
                "entities_from_query": ["ACME"],
            })
            .to_string(),
        ),
    ]);
    let engine = RagEngine::new(test_config(dir.path()), llm, Arc::new(NgramEmbedder)).unwrap();

    // Both documents feed the same entities and edge, so both regions' chunks
    // sit on the reasoning path.
    engine
        .insert(
            InsertInput::Texts(vec![
                "ACME supplies BOLT from the APAC region.".to_string(),
                "ACME supplies BOLT from the EMEA region.".to_string(),
            ]),
            InsertOptions {
                ids: Some(vec!["doc-apac".to_string(), "doc-emea".to_string()]),
                metadatas: Some(Metadatas::PerItem(vec![
                    json!({"region": "APAC"}).as_object().unwrap().clone(),
                    json!({"region": "EMEA"}).as_object().unwrap().clone(),
                ])),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mini_param = |filter: Value| QueryParam {
        mode: QueryMode::Mini,
        only_need_context: true,
        metadata_filter: filter.as_object().cloned(),
        top_k: 10,
        ..Default::default()
    };

    // A matching filter keeps only the APAC chunk even though the EMEA chunk
    // is reachable through the same path.
    let response = engine
        .query("who supplies bolt?", mini_param(json!({"region": "APAC"})))
        .await
        .unwrap();
    assert!(!response.sources.is_empty());
    assert!(response.sources.iter().all(|s| s.contains("APAC region")));
    assert!(response.sources.iter().all(|s| !s.contains("EMEA region")));

    // A non-matching filter drops every path-derived chunk.
    let response = engine
        .query("who supplies bolt?", mini_param(json!({"region": "LATAM"})))
        .await
        .unwrap();
    assert!(response.sources.is_empty());
}

#[tokio::test]
async fn test_llm_cache_dedupes_identical_calls() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new(vec![
        // The answer prompt embeds the chunk text, so match it first.
        ("-Documents-", "The answer.".to_string()),
        (
            "cached doc",
            extraction_reply(&[
                entity("A", "organization", "org a"),
                relationship("A", "B", "a to b", "link", "1.0"),
            ]),
        ),
    ]);
    let engine = RagEngine::new(test_config(dir.path()), llm.clone(), Arc::new(NgramEmbedder))
        .unwrap();

    engine
        .insert(InsertInput::Text("cached doc body".to_string()), InsertOptions::default())
        .await
        .unwrap();

    let param = QueryParam {
        mode: QueryMode::Naive,
        only_need_context: false,
        top_k: 5,
        ..Default::default()
    };
    let first = engine.query("what is in the doc?", param.clone()).await.unwrap();
    let second = engine.query("what is in the doc?", param).await.unwrap();
    assert_eq!(first.content, "The answer.");
    assert_eq!(second.content, "The answer.");

    // The second answer came out of the response cache.
    assert_eq!(llm.calls_containing("-Documents-"), 1);
}

#[tokio::test]
async fn test_relationship_between_unknown_entities_creates_stubs() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new(vec![(
        "mystery pact",
        extraction_reply(&[relationship("FOO", "BAR", "a secret pact", "pact", "1.0")]),
    )]);
    let engine = RagEngine::new(test_config(dir.path()), llm, Arc::new(NgramEmbedder)).unwrap();

    engine
        .insert(
            InsertInput::Text("mystery pact between foo and bar".to_string()),
            InsertOptions::default(),
        )
        .await
        .unwrap();

    for name in ["\"FOO\"", "\"BAR\""] {
        let node = engine.graph().get_node(name).await.unwrap().unwrap();
        assert_eq!(node.entity_type, "\"UNKNOWN\"");
    }
    assert!(engine.graph().has_edge("\"BAR\"", "\"FOO\"").await.unwrap());
}

#[tokio::test]
async fn test_empty_input_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new(vec![]);
    let engine = RagEngine::new(test_config(dir.path()), llm, Arc::new(NgramEmbedder)).unwrap();

    engine
        .insert(InsertInput::Texts(Vec::new()), InsertOptions::default())
        .await
        .unwrap();
    assert!(engine.status_counts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_ids_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new(vec![]);
    let engine = RagEngine::new(test_config(dir.path()), llm, Arc::new(NgramEmbedder)).unwrap();

    let err = engine
        .insert(
            InsertInput::Texts(vec!["a".to_string(), "b".to_string()]),
            InsertOptions {
                ids: Some(vec!["dup".to_string(), "dup".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Validation(_)));
}

#[tokio::test]
async fn test_state_survives_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new(vec![(
        "persisted doc",
        extraction_reply(&[
            entity("A", "organization", "org a"),
            relationship("A", "B", "a to b", "link", "1.0"),
        ]),
    )]);

    {
        let engine =
            RagEngine::new(test_config(dir.path()), llm.clone(), Arc::new(NgramEmbedder)).unwrap();
        engine
            .insert(InsertInput::Text("persisted doc".to_string()), InsertOptions::default())
            .await
            .unwrap();
    }

    let engine = RagEngine::new(test_config(dir.path()), llm, Arc::new(NgramEmbedder)).unwrap();
    // The restarted engine sees the document as already known.
    let enqueued = engine
        .enqueue_documents(vec!["persisted doc".to_string()], None, None, false)
        .await
        .unwrap();
    assert_eq!(enqueued, 0);
    assert!(engine.graph().has_node("\"A\"").await.unwrap());
}

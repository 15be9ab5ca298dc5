//! Entity/relationship extraction: prompt the LLM per chunk (with bounded
//! gleaning rounds), parse the delimited records, merge them into the
//! knowledge graph and refresh the entity/relation vector indexes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::config::GlobalConfig;
use crate::error::Result;
use crate::ids::{
    canonical_entity_name, clean_text, entity_name_vector_id, entity_vector_id,
    relation_vector_id,
};
use crate::llm::{CachedLlm, ChatTurn};
use crate::prompts::{
    self, GRAPH_FIELD_SEP,
};
use crate::storage::{GraphStorage, VectorRecord, VectorStorage};
use crate::types::{ChunkRecord, EdgeData, NodeData};

#[derive(Debug, Clone)]
struct EntityRecord {
    entity_name: String,
    entity_type: String,
    description: String,
    source_id: String,
}

#[derive(Debug, Clone)]
struct RelationRecord {
    src_id: String,
    tgt_id: String,
    weight: f64,
    description: String,
    keywords: String,
    source_id: String,
}

pub async fn extract_entities(
    chunks: &HashMap<String, ChunkRecord>,
    graph: &Arc<dyn GraphStorage>,
    entities_vdb: &Arc<dyn VectorStorage>,
    entity_name_vdb: &Arc<dyn VectorStorage>,
    relationships_vdb: &Arc<dyn VectorStorage>,
    llm: &CachedLlm,
    config: &GlobalConfig,
) -> Result<()> {
    let mut ordered: Vec<(&String, &ChunkRecord)> = chunks.iter().collect();
    ordered.sort_by(|a, b| a.0.cmp(b.0));

    let extractions = futures::future::join_all(
        ordered
            .iter()
            .map(|&(chunk_id, chunk)| extract_single_chunk(chunk_id, chunk, llm, config)),
    )
    .await;

    let mut nodes: HashMap<String, Vec<EntityRecord>> = HashMap::new();
    let mut edges: HashMap<(String, String), Vec<RelationRecord>> = HashMap::new();
    for result in extractions {
        let (chunk_nodes, chunk_edges) = result?;
        for record in chunk_nodes {
            nodes.entry(record.entity_name.clone()).or_default().push(record);
        }
        for record in chunk_edges {
            let key = sorted_pair(&record.src_id, &record.tgt_id);
            edges.entry(key).or_default().push(record);
        }
    }

    let mut entity_names: Vec<&String> = nodes.keys().collect();
    entity_names.sort();
    let mut all_entities = Vec::with_capacity(entity_names.len());
    for name in entity_names {
        all_entities.push(merge_node_then_upsert(name, &nodes[name], graph.as_ref()).await?);
    }

    let mut edge_keys: Vec<&(String, String)> = edges.keys().collect();
    edge_keys.sort();
    let mut all_relations = Vec::with_capacity(edge_keys.len());
    for key in edge_keys {
        all_relations
            .push(merge_edge_then_upsert(&key.0, &key.1, &edges[key], graph.as_ref()).await?);
    }

    if all_entities.is_empty() {
        tracing::warn!("didn't extract any entities, maybe the llm is not working");
        return Ok(());
    }
    if all_relations.is_empty() {
        tracing::warn!("didn't extract any relationships, maybe the llm is not working");
        return Ok(());
    }

    let chunk_metadata = |source_id: &str| -> Value {
        let first = source_id.split(GRAPH_FIELD_SEP).next().unwrap_or_default();
        chunks
            .get(first)
            .map(|c| c.metadata.clone())
            .unwrap_or_else(|| json!({}))
    };

    let mut entity_rows = HashMap::new();
    let mut entity_name_rows = HashMap::new();
    for (name, data) in &all_entities {
        let mut fields = Map::new();
        fields.insert("entity_name".to_string(), json!(name));
        entity_rows.insert(
            entity_vector_id(name),
            VectorRecord {
                content: format!("{} {}", name, data.description),
                metadata: chunk_metadata(&data.source_id),
                fields: fields.clone(),
            },
        );
        entity_name_rows.insert(
            entity_name_vector_id(name),
            VectorRecord {
                content: name.clone(),
                metadata: chunk_metadata(&data.source_id),
                fields,
            },
        );
    }

    let mut relation_rows = HashMap::new();
    for (src, tgt, data) in &all_relations {
        let mut fields = Map::new();
        fields.insert("src_id".to_string(), json!(src));
        fields.insert("tgt_id".to_string(), json!(tgt));
        relation_rows.insert(
            relation_vector_id(src, tgt),
            VectorRecord {
                content: format!("{} {} {} {}", data.keywords, src, tgt, data.description),
                metadata: chunk_metadata(&data.source_id),
                fields,
            },
        );
    }

    tracing::info!(
        entities = entity_rows.len(),
        relations = relation_rows.len(),
        "extraction merged into graph, refreshing vector indexes"
    );
    entities_vdb.upsert(entity_rows).await?;
    entity_name_vdb.upsert(entity_name_rows).await?;
    relationships_vdb.upsert(relation_rows).await?;
    Ok(())
}

async fn extract_single_chunk(
    chunk_id: &str,
    chunk: &ChunkRecord,
    llm: &CachedLlm,
    config: &GlobalConfig,
) -> Result<(Vec<EntityRecord>, Vec<RelationRecord>)> {
    let hint_prompt = prompts::render(
        prompts::ENTITY_EXTRACTION,
        &[
            ("entity_types", &prompts::DEFAULT_ENTITY_TYPES.join(", ")),
            ("tuple_delimiter", prompts::DEFAULT_TUPLE_DELIMITER),
            ("record_delimiter", prompts::DEFAULT_RECORD_DELIMITER),
            ("completion_delimiter", prompts::DEFAULT_COMPLETION_DELIMITER),
            ("input_text", &chunk.content),
        ],
    );

    let mut final_result = llm.complete(&hint_prompt, &[], None).await?;
    let mut history = vec![
        ChatTurn::user(hint_prompt.clone()),
        ChatTurn::assistant(final_result.clone()),
    ];

    for glean_index in 0..config.extraction.entity_extract_max_gleaning {
        // A failure mid-glean keeps what we already have.
        let glean_result = match llm
            .complete(prompts::ENTITY_CONTINUE_EXTRACTION, &history, None)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(chunk = chunk_id, error = %e, "gleaning round failed, stopping early");
                break;
            }
        };
        history.push(ChatTurn::user(prompts::ENTITY_CONTINUE_EXTRACTION));
        history.push(ChatTurn::assistant(glean_result.clone()));
        final_result.push_str(&glean_result);

        if glean_index + 1 == config.extraction.entity_extract_max_gleaning {
            break;
        }
        let should_continue = match llm
            .complete(prompts::ENTITY_IF_LOOP_EXTRACTION, &history, None)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(chunk = chunk_id, error = %e, "continuation probe failed, stopping early");
                break;
            }
        };
        let answer = should_continue
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .to_lowercase();
        if answer != "yes" {
            break;
        }
    }

    Ok(parse_extraction_records(&final_result, chunk_id))
}

fn parse_extraction_records(text: &str, chunk_key: &str) -> (Vec<EntityRecord>, Vec<RelationRecord>) {
    let mut entities = Vec::new();
    let mut relations = Vec::new();

    for raw in split_by_markers(
        text,
        &[prompts::DEFAULT_RECORD_DELIMITER, prompts::DEFAULT_COMPLETION_DELIMITER],
    ) {
        let Some(inner) = extract_parenthesized(&raw) else {
            continue;
        };
        let attributes: Vec<String> = split_by_markers(&inner, &[prompts::DEFAULT_TUPLE_DELIMITER]);
        if attributes.is_empty() {
            continue;
        }
        match attributes[0].trim().trim_matches('"') {
            "entity" if attributes.len() >= 4 => {
                let entity_name = canonical_entity_name(&clean_text(&attributes[1]));
                if entity_name == "\"\"" {
                    continue;
                }
                entities.push(EntityRecord {
                    entity_name,
                    entity_type: clean_text(&attributes[2]).to_uppercase(),
                    description: clean_text(&attributes[3]),
                    source_id: chunk_key.to_string(),
                });
            }
            "relationship" if attributes.len() >= 5 => {
                let src_id = canonical_entity_name(&clean_text(&attributes[1]));
                let tgt_id = canonical_entity_name(&clean_text(&attributes[2]));
                if src_id == "\"\"" || tgt_id == "\"\"" {
                    continue;
                }
                let weight = attributes
                    .last()
                    .and_then(|w| w.trim().parse::<f64>().ok())
                    .unwrap_or(1.0);
                relations.push(RelationRecord {
                    src_id,
                    tgt_id,
                    weight,
                    description: clean_text(&attributes[3]),
                    keywords: clean_text(&attributes[4]),
                    source_id: chunk_key.to_string(),
                });
            }
            _ => {}
        }
    }
    (entities, relations)
}

fn split_by_markers(text: &str, markers: &[&str]) -> Vec<String> {
    let mut pieces = vec![text.to_string()];
    for marker in markers {
        pieces = pieces
            .into_iter()
            .flat_map(|piece| {
                piece
                    .split(marker)
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .collect();
    }
    pieces
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn extract_parenthesized(record: &str) -> Option<String> {
    let start = record.find('(')?;
    let end = record.rfind(')')?;
    (end > start).then(|| record[start + 1..end].to_string())
}

fn sorted_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn split_field(joined: &str) -> Vec<String> {
    joined
        .split(GRAPH_FIELD_SEP)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn join_sorted_dedup(values: Vec<String>) -> String {
    let mut values: Vec<String> = values
        .into_iter()
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    values.sort();
    values.join(GRAPH_FIELD_SEP)
}

async fn merge_node_then_upsert(
    entity_name: &str,
    records: &[EntityRecord],
    graph: &dyn GraphStorage,
) -> Result<(String, NodeData)> {
    let existing = graph.get_node(entity_name).await?;

    let mut type_votes: Vec<String> = records.iter().map(|r| r.entity_type.clone()).collect();
    let mut descriptions: Vec<String> = records.iter().map(|r| r.description.clone()).collect();
    let mut source_ids: Vec<String> = records.iter().map(|r| r.source_id.clone()).collect();
    if let Some(node) = &existing {
        type_votes.push(node.entity_type.clone());
        descriptions.extend(split_field(&node.description));
        source_ids.extend(split_field(&node.source_id));
    }

    // Mode of the type votes; ties broken by first appearance.
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for vote in &type_votes {
        *counts.entry(vote.as_str()).or_insert(0) += 1;
    }
    let mut entity_type = String::new();
    let mut best_count = 0usize;
    let mut seen = HashSet::new();
    for vote in &type_votes {
        if !seen.insert(vote.as_str()) {
            continue;
        }
        let count = counts[vote.as_str()];
        if count > best_count {
            best_count = count;
            entity_type = vote.clone();
        }
    }

    let data = NodeData {
        entity_type,
        description: join_sorted_dedup(descriptions),
        source_id: join_sorted_dedup(source_ids),
    };
    graph.upsert_node(entity_name, data.clone()).await?;
    Ok((entity_name.to_string(), data))
}

async fn merge_edge_then_upsert(
    src_id: &str,
    tgt_id: &str,
    records: &[RelationRecord],
    graph: &dyn GraphStorage,
) -> Result<(String, String, EdgeData)> {
    let existing = graph.get_edge(src_id, tgt_id).await?;
    let existing_sources: HashSet<String> = existing
        .as_ref()
        .map(|e| split_field(&e.source_id).into_iter().collect())
        .unwrap_or_default();

    // Weight contributions are deduplicated on source chunk: re-running the
    // same extraction must not inflate the edge.
    let new_weight: f64 = records
        .iter()
        .filter(|r| !existing_sources.contains(&r.source_id))
        .map(|r| r.weight)
        .sum();
    let weight = new_weight + existing.as_ref().map(|e| e.weight).unwrap_or(0.0);

    let mut descriptions: Vec<String> = records.iter().map(|r| r.description.clone()).collect();
    let mut keywords: Vec<String> = records.iter().map(|r| r.keywords.clone()).collect();
    let mut source_ids: Vec<String> = records.iter().map(|r| r.source_id.clone()).collect();
    if let Some(edge) = &existing {
        descriptions.extend(split_field(&edge.description));
        keywords.extend(split_field(&edge.keywords));
        source_ids.extend(split_field(&edge.source_id));
    }

    let data = EdgeData {
        weight,
        description: join_sorted_dedup(descriptions),
        keywords: join_sorted_dedup(keywords),
        source_id: join_sorted_dedup(source_ids),
    };

    for node_id in [src_id, tgt_id] {
        if !graph.has_node(node_id).await? {
            graph
                .upsert_node(
                    node_id,
                    NodeData {
                        entity_type: "\"UNKNOWN\"".to_string(),
                        description: "Auto-generated node.".to_string(),
                        source_id: data.source_id.clone(),
                    },
                )
                .await?;
        }
    }

    graph.upsert_edge(src_id, tgt_id, data.clone()).await?;
    Ok((src_id.to_string(), tgt_id.to_string(), data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entity_and_relationship_records() {
        let reply = concat!(
            "(\"entity\"<|>Acme<|>organization<|>A supplier of parts)##",
            "(\"entity\"<|>Bolt Co<|>organization<|>A customer)##",
            "(\"relationship\"<|>Acme<|>Bolt Co<|>Acme supplies Bolt Co<|>supply chain<|>2.0)##",
            "<|COMPLETE|>"
        );
        let (entities, relations) = parse_extraction_records(reply, "chunk-x");
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].entity_name, "\"ACME\"");
        assert_eq!(entities[0].entity_type, "ORGANIZATION");
        assert_eq!(entities[0].source_id, "chunk-x");
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].src_id, "\"ACME\"");
        assert_eq!(relations[0].tgt_id, "\"BOLT CO\"");
        assert!((relations[0].weight - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_drops_empty_names_and_garbage() {
        let reply = "(\"entity\"<|><|>organization<|>desc)##not a record##<|COMPLETE|>";
        let (entities, relations) = parse_extraction_records(reply, "chunk-x");
        assert!(entities.is_empty());
        assert!(relations.is_empty());
    }

    #[test]
    fn test_missing_weight_defaults_to_one() {
        let reply = "(\"relationship\"<|>A<|>B<|>desc<|>kw)##";
        let (_, relations) = parse_extraction_records(reply, "c");
        assert_eq!(relations.len(), 1);
        assert!((relations[0].weight - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_join_sorted_dedup() {
        let joined = join_sorted_dedup(vec![
            "b".to_string(),
            "a".to_string(),
            "b".to_string(),
        ]);
        assert_eq!(joined, format!("a{}b", GRAPH_FIELD_SEP));
    }

    #[tokio::test]
    async fn test_edge_merge_is_idempotent_per_source_chunk() {
        use crate::config::GlobalConfig;
        use crate::storage::{PetgraphStorage, StorageContext};

        let dir = tempfile::tempdir().unwrap();
        let ctx = StorageContext {
            namespace: "chunk_entity_relation".to_string(),
            workspace: "test".to_string(),
            working_dir: dir.path().to_path_buf(),
            config: Arc::new(GlobalConfig::default()),
            embedder: None,
        };
        let graph = PetgraphStorage::open(&ctx).unwrap();

        let records = vec![RelationRecord {
            src_id: "\"A\"".to_string(),
            tgt_id: "\"B\"".to_string(),
            weight: 2.0,
            description: "a supplies b".to_string(),
            keywords: "supply".to_string(),
            source_id: "chunk-1".to_string(),
        }];

        let (_, _, first) = merge_edge_then_upsert("\"A\"", "\"B\"", &records, &graph)
            .await
            .unwrap();
        assert!((first.weight - 2.0).abs() < 1e-9);

        // Same extraction again: the contribution is already present.
        let (_, _, second) = merge_edge_then_upsert("\"A\"", "\"B\"", &records, &graph)
            .await
            .unwrap();
        assert!((second.weight - 2.0).abs() < 1e-9);
        assert_eq!(second.description, first.description);
        assert_eq!(second.source_id, "chunk-1");

        // A genuinely new chunk still adds weight.
        let more = vec![RelationRecord {
            source_id: "chunk-2".to_string(),
            ..records[0].clone()
        }];
        let (_, _, third) = merge_edge_then_upsert("\"A\"", "\"B\"", &more, &graph)
            .await
            .unwrap();
        assert!((third.weight - 4.0).abs() < 1e-9);
    }
}

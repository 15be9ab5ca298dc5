//! Hybrid (light) strategy: LLM keyword extraction feeds two branches — a
//! local context grown from entity matches and a global context grown from
//! relationship matches — which are combined into one deduplicated context.
//!
//! The entity/relationship vector queries deliberately push down only the
//! time window: their rows inherit metadata from a single source chunk, so
//! the metadata clause is applied to the fetched chunks instead.

use std::collections::{HashMap, HashSet};

use crate::context::{combine_sections, truncate_list_by_token_size, ContextSections};
use crate::error::Result;
use crate::filter::{metadata_matches, VectorFilter};
use crate::pipeline::RagEngine;
use crate::prompts::{self, GRAPH_FIELD_SEP};
use crate::query::keywords::{parse_keywords_reply, string_list};
use crate::types::{ChunkRecord, EdgeData, NodeData, QueryParam, QueryResponse};

struct NodeView {
    name: String,
    data: NodeData,
    rank: usize,
}

struct EdgeView {
    src: String,
    tgt: String,
    data: EdgeData,
    rank: usize,
}

struct TextUnit {
    id: String,
    chunk: ChunkRecord,
}

pub(crate) async fn hybrid_query(
    engine: &RagEngine,
    query: &str,
    param: &QueryParam,
) -> Result<QueryResponse> {
    let kw_prompt = prompts::render(prompts::KEYWORDS_EXTRACTION, &[("query", query)]);
    let reply = engine
        .llm
        .complete_with_mode(&kw_prompt, &[], None, "keywords")
        .await?;
    let Some(parsed) = parse_keywords_reply(&reply, &kw_prompt) else {
        tracing::warn!("keyword extraction reply was not decodable json");
        return Ok(QueryResponse::failed(prompts::FAIL_RESPONSE));
    };
    let ll_keywords = string_list(&parsed, "low_level_keywords").join(", ");
    let hl_keywords = string_list(&parsed, "high_level_keywords").join(", ");

    let low = if ll_keywords.is_empty() {
        None
    } else {
        build_local_context(engine, &ll_keywords, param).await?
    };
    let high = if hl_keywords.is_empty() {
        None
    } else {
        build_global_context(engine, &hl_keywords, param).await?
    };
    if low.is_none() && high.is_none() {
        return Ok(QueryResponse::failed(prompts::FAIL_RESPONSE));
    }

    let combined = combine_sections(high, low);
    let sources = combined.sources.clone();
    let context = combined.render();
    tracing::info!(
        entities = combined.entities.len(),
        relations = combined.relationships.len(),
        sources = sources.len(),
        "hybrid context assembled"
    );

    if param.only_need_context {
        return Ok(QueryResponse {
            content: context,
            sources,
            provenance: None,
        });
    }

    let system_prompt = prompts::render(
        prompts::RAG_RESPONSE,
        &[
            ("context_data", &context),
            ("response_type", &param.response_type),
        ],
    );
    let response = engine.llm.complete(query, &[], Some(&system_prompt)).await?;
    let answer = super::strip_prompt_echo(&response, &system_prompt, query);
    Ok(QueryResponse {
        content: answer,
        sources,
        provenance: None,
    })
}

/// Local branch: entity similarity → candidate chunks weighted by one-hop
/// connectivity → post-filter → entity descriptions rebuilt from surviving
/// chunks → related edges.
async fn build_local_context(
    engine: &RagEngine,
    keywords: &str,
    param: &QueryParam,
) -> Result<Option<ContextSections>> {
    let filter = VectorFilter {
        metadata: param.metadata_filter.clone(),
        start_time: param.start_time,
        end_time: param.end_time,
    };
    let hits = engine
        .entities_vdb
        .query(keywords, param.top_k, &filter.time_only())
        .await?;
    if hits.is_empty() {
        return Ok(None);
    }

    let mut nodes = Vec::new();
    for hit in &hits {
        let Some(name) = hit.entity_name() else { continue };
        let Some(data) = engine.graph.get_node(name).await? else {
            tracing::warn!(entity = name, "entity vector row without graph node");
            continue;
        };
        let rank = engine.graph.node_degree(name).await?;
        nodes.push(NodeView {
            name: name.to_string(),
            data,
            rank,
        });
    }
    if nodes.is_empty() {
        return Ok(None);
    }

    let mut units = most_related_text_units_from_entities(engine, &nodes, param).await?;
    apply_chunk_post_filter(&mut units, param);

    // Rebuild entity descriptions from the chunks that survived filtering.
    let surviving: HashMap<&str, &str> = units
        .iter()
        .map(|u| (u.id.as_str(), u.chunk.content.as_str()))
        .collect();
    let mut kept_nodes = Vec::new();
    for mut node in nodes {
        let relevant: Vec<&str> = node
            .data
            .source_id
            .split(GRAPH_FIELD_SEP)
            .filter_map(|sid| surviving.get(sid.trim()).copied())
            .collect();
        if relevant.is_empty() {
            continue;
        }
        node.data.description = relevant.join(GRAPH_FIELD_SEP);
        kept_nodes.push(node);
    }

    let edges = most_related_edges_from_entities(engine, &kept_nodes, param).await?;
    tracing::info!(
        entities = kept_nodes.len(),
        relations = edges.len(),
        text_units = units.len(),
        "local context"
    );

    Ok(Some(ContextSections {
        entities: kept_nodes.iter().map(entity_row).collect(),
        relationships: edges.iter().map(edge_row).collect(),
        sources: units.into_iter().map(|u| u.chunk.content).collect(),
    }))
}

/// Global branch: relationship similarity → edges ranked by (degree, weight)
/// → related entities and chunks → post-filter → descriptions rebuilt.
async fn build_global_context(
    engine: &RagEngine,
    keywords: &str,
    param: &QueryParam,
) -> Result<Option<ContextSections>> {
    let filter = VectorFilter {
        metadata: param.metadata_filter.clone(),
        start_time: param.start_time,
        end_time: param.end_time,
    };
    let hits = engine
        .relationships_vdb
        .query(keywords, param.top_k, &filter.time_only())
        .await?;
    if hits.is_empty() {
        return Ok(None);
    }

    let mut edges = Vec::new();
    for hit in &hits {
        let (Some(src), Some(tgt)) = (hit.src_id(), hit.tgt_id()) else {
            continue;
        };
        let Some(data) = engine.graph.get_edge(src, tgt).await? else {
            tracing::warn!(src, tgt, "relationship vector row without graph edge");
            continue;
        };
        let rank = engine.graph.edge_degree(src, tgt).await?;
        edges.push(EdgeView {
            src: src.to_string(),
            tgt: tgt.to_string(),
            data,
            rank,
        });
    }
    if edges.is_empty() {
        return Ok(None);
    }
    sort_edges(&mut edges);
    let mut edges = truncate_list_by_token_size(
        edges,
        |e| e.data.description.as_str(),
        param.max_token_for_global_context,
        engine.tokenizer.as_ref(),
    );

    let mut entities = most_related_entities_from_relationships(engine, &edges, param).await?;
    let mut units = related_text_units_from_relationships(engine, &edges, param).await?;
    apply_chunk_post_filter(&mut units, param);

    let surviving: HashMap<&str, &str> = units
        .iter()
        .map(|u| (u.id.as_str(), u.chunk.content.as_str()))
        .collect();
    entities.retain_mut(|node| {
        let relevant: Vec<&str> = node
            .data
            .source_id
            .split(GRAPH_FIELD_SEP)
            .filter_map(|sid| surviving.get(sid.trim()).copied())
            .collect();
        if relevant.is_empty() {
            return false;
        }
        node.data.description = relevant.join(GRAPH_FIELD_SEP);
        true
    });
    edges.retain_mut(|edge| {
        let relevant: Vec<&str> = edge
            .data
            .source_id
            .split(GRAPH_FIELD_SEP)
            .filter_map(|sid| surviving.get(sid.trim()).copied())
            .collect();
        if relevant.is_empty() {
            return false;
        }
        edge.data.description = relevant.join(GRAPH_FIELD_SEP);
        true
    });

    tracing::info!(
        entities = entities.len(),
        relations = edges.len(),
        text_units = units.len(),
        "global context"
    );

    Ok(Some(ContextSections {
        entities: entities.iter().map(entity_row).collect(),
        relationships: edges.iter().map(edge_row).collect(),
        sources: units.into_iter().map(|u| u.chunk.content).collect(),
    }))
}

/// Candidate chunks referenced by the entities' `source_id` sets, ordered by
/// (entity order, one-hop connectivity), truncated to the text-unit budget
/// and time-filtered.
async fn most_related_text_units_from_entities(
    engine: &RagEngine,
    nodes: &[NodeView],
    param: &QueryParam,
) -> Result<Vec<TextUnit>> {
    let mut node_edges = Vec::with_capacity(nodes.len());
    for node in nodes {
        node_edges.push(engine.graph.get_node_edges(&node.name).await?);
    }

    let mut one_hop: HashSet<String> = HashSet::new();
    for edges in &node_edges {
        one_hop.extend(edges.iter().map(|(_, other)| other.clone()));
    }
    let mut one_hop_sources: HashMap<String, HashSet<String>> = HashMap::new();
    for name in one_hop {
        if let Some(data) = engine.graph.get_node(&name).await? {
            one_hop_sources.insert(
                name,
                data.source_id
                    .split(GRAPH_FIELD_SEP)
                    .map(|s| s.trim().to_string())
                    .collect(),
            );
        }
    }

    struct Candidate {
        id: String,
        chunk: ChunkRecord,
        order: usize,
        relation_counts: usize,
    }
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for (order, (node, edges)) in nodes.iter().zip(&node_edges).enumerate() {
        for chunk_id in node.data.source_id.split(GRAPH_FIELD_SEP) {
            let chunk_id = chunk_id.trim();
            if chunk_id.is_empty() || !seen.insert(chunk_id.to_string()) {
                continue;
            }
            let relation_counts = edges
                .iter()
                .filter(|(_, other)| {
                    one_hop_sources
                        .get(other)
                        .map(|sources| sources.contains(chunk_id))
                        .unwrap_or(false)
                })
                .count();
            let Some(row) = engine.text_chunks.get_by_id(chunk_id).await? else {
                tracing::warn!(chunk = chunk_id, "entity references a missing chunk");
                continue;
            };
            let Ok(chunk) = serde_json::from_value::<ChunkRecord>(row) else {
                continue;
            };
            candidates.push(Candidate {
                id: chunk_id.to_string(),
                chunk,
                order,
                relation_counts,
            });
        }
    }
    if candidates.is_empty() {
        tracing::warn!("no valid text units found");
        return Ok(Vec::new());
    }

    candidates.sort_by(|a, b| {
        a.order
            .cmp(&b.order)
            .then(b.relation_counts.cmp(&a.relation_counts))
    });
    let candidates = truncate_list_by_token_size(
        candidates,
        |c| c.chunk.content.as_str(),
        param.max_token_for_text_unit,
        engine.tokenizer.as_ref(),
    );

    Ok(apply_time_filter(candidates, param, |c| c.chunk.updated_at)
        .into_iter()
        .map(|c| TextUnit {
            id: c.id,
            chunk: c.chunk,
        })
        .collect())
}

/// Edges incident to the local entities, ranked by (degree, weight) and
/// truncated to the global-context budget.
async fn most_related_edges_from_entities(
    engine: &RagEngine,
    nodes: &[NodeView],
    param: &QueryParam,
) -> Result<Vec<EdgeView>> {
    let mut seen = HashSet::new();
    let mut pairs = Vec::new();
    for node in nodes {
        for (a, b) in engine.graph.get_node_edges(&node.name).await? {
            let pair = if a <= b { (a, b) } else { (b, a) };
            if seen.insert(pair.clone()) {
                pairs.push(pair);
            }
        }
    }

    let mut edges = Vec::new();
    for (src, tgt) in pairs {
        let Some(data) = engine.graph.get_edge(&src, &tgt).await? else {
            continue;
        };
        let rank = engine.graph.edge_degree(&src, &tgt).await?;
        edges.push(EdgeView { src, tgt, data, rank });
    }
    sort_edges(&mut edges);
    Ok(truncate_list_by_token_size(
        edges,
        |e| e.data.description.as_str(),
        param.max_token_for_global_context,
        engine.tokenizer.as_ref(),
    ))
}

/// Endpoint entities of the global edges, ranked by degree and truncated to
/// the local-context budget.
async fn most_related_entities_from_relationships(
    engine: &RagEngine,
    edges: &[EdgeView],
    param: &QueryParam,
) -> Result<Vec<NodeView>> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for edge in edges {
        for name in [&edge.src, &edge.tgt] {
            if seen.insert(name.clone()) {
                names.push(name.clone());
            }
        }
    }

    let mut nodes = Vec::new();
    for name in names {
        let Some(data) = engine.graph.get_node(&name).await? else {
            continue;
        };
        let rank = engine.graph.node_degree(&name).await?;
        nodes.push(NodeView { name, data, rank });
    }
    Ok(truncate_list_by_token_size(
        nodes,
        |n| n.data.description.as_str(),
        param.max_token_for_local_context,
        engine.tokenizer.as_ref(),
    ))
}

/// Chunks referenced by the global edges' `source_id` sets, in edge order,
/// truncated and time-filtered.
async fn related_text_units_from_relationships(
    engine: &RagEngine,
    edges: &[EdgeView],
    param: &QueryParam,
) -> Result<Vec<TextUnit>> {
    struct Candidate {
        id: String,
        chunk: ChunkRecord,
        order: usize,
    }
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for (order, edge) in edges.iter().enumerate() {
        for chunk_id in edge.data.source_id.split(GRAPH_FIELD_SEP) {
            let chunk_id = chunk_id.trim();
            if chunk_id.is_empty() || !seen.insert(chunk_id.to_string()) {
                continue;
            }
            let Some(row) = engine.text_chunks.get_by_id(chunk_id).await? else {
                tracing::warn!(chunk = chunk_id, "relationship references a missing chunk");
                continue;
            };
            let Ok(chunk) = serde_json::from_value::<ChunkRecord>(row) else {
                continue;
            };
            candidates.push(Candidate {
                id: chunk_id.to_string(),
                chunk,
                order,
            });
        }
    }
    candidates.sort_by_key(|c| c.order);
    let candidates = truncate_list_by_token_size(
        candidates,
        |c| c.chunk.content.as_str(),
        param.max_token_for_text_unit,
        engine.tokenizer.as_ref(),
    );
    Ok(apply_time_filter(candidates, param, |c| c.chunk.updated_at)
        .into_iter()
        .map(|c| TextUnit {
            id: c.id,
            chunk: c.chunk,
        })
        .collect())
}

fn apply_chunk_post_filter(units: &mut Vec<TextUnit>, param: &QueryParam) {
    let Some(clause) = &param.metadata_filter else {
        return;
    };
    let before = units.len();
    units.retain(|unit| metadata_matches(clause, &unit.chunk.metadata));
    tracing::debug!(before, after = units.len(), "chunk metadata post-filter");
}

fn sort_edges(edges: &mut [EdgeView]) {
    edges.sort_by(|a, b| {
        b.rank.cmp(&a.rank).then(
            b.data
                .weight
                .partial_cmp(&a.data.weight)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
}

fn entity_row(node: &NodeView) -> Vec<String> {
    vec![
        node.name.clone(),
        if node.data.entity_type.is_empty() {
            "UNKNOWN".to_string()
        } else {
            node.data.entity_type.clone()
        },
        node.data.description.clone(),
        node.rank.to_string(),
    ]
}

fn edge_row(edge: &EdgeView) -> Vec<String> {
    vec![
        edge.src.clone(),
        edge.tgt.clone(),
        edge.data.description.clone(),
        edge.data.keywords.clone(),
        edge.data.weight.to_string(),
        edge.rank.to_string(),
    ]
}

/// Time filter over chunk `updated_at`, applied after truncation the same
/// way the vector layer applies it at query time.
fn apply_time_filter<T>(
    items: Vec<T>,
    param: &QueryParam,
    updated_at: impl Fn(&T) -> Option<chrono::DateTime<chrono::Utc>>,
) -> Vec<T> {
    if param.start_time.is_none() && param.end_time.is_none() {
        return items;
    }
    items
        .into_iter()
        .filter(|item| {
            let Some(at) = updated_at(item) else {
                return false;
            };
            if let Some(start) = param.start_time {
                if at < start {
                    return false;
                }
            }
            if let Some(end) = param.end_time {
                if at > end {
                    return false;
                }
            }
            true
        })
        .collect()
}

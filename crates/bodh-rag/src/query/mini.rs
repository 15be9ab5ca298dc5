//! Mini strategy: resolve query entities against the entity-name index,
//! expand their 2-hop neighborhoods into reasoning paths, score the paths
//! (answer-type hits + edge votes + name similarity), translate paths into
//! weighted chunk candidates and fuse them with direct chunk hits.
//!
//! As in the hybrid branches, entity- and relationship-level searches push
//! down only the time window; the final chunk set is filtered by metadata
//! and time after the fetch, since path-derived ids bypass the vector layer.

use std::collections::{HashMap, HashSet};

use crate::context::{rows_to_csv, rows_to_csv_plain, truncate_list_by_token_size};
use crate::embedding::cosine_similarity;
use crate::error::Result;
use crate::filter::VectorFilter;
use crate::pipeline::RagEngine;
use crate::prompts::{self, GRAPH_FIELD_SEP};
use crate::query::keywords::{parse_keywords_reply, string_list};
use crate::types::{
    ChunkRecord, Provenance, ProvenanceChunk, ProvenanceEntity, QueryParam, QueryResponse,
};

/// Query-mentioned entities are capped before graph expansion.
const MAX_QUERY_ENTITIES: usize = 5;
/// Fraction of path-less candidates kept, by descending name similarity.
const SHORT_PATH_KEEP_RATIO: f64 = 0.2;
/// Direct vector hits multiply a path-endpoint chunk's weight.
const DIRECT_HIT_BOOST: f64 = 10.0;

#[derive(Debug, Clone, Copy)]
struct PathScore {
    answer_hits: f64,
    vote: f64,
}

impl PathScore {
    fn total(&self) -> f64 {
        self.answer_hits + self.vote + 1.0
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    score: f64,
    paths: HashMap<(String, String), PathScore>,
    /// Chunk ids chosen for this candidate, strongest first.
    chunks: Vec<String>,
}

pub(crate) async fn mini_query(
    engine: &RagEngine,
    query: &str,
    param: &QueryParam,
) -> Result<QueryResponse> {
    let (type_pool, _) = engine.graph.get_types().await?;
    let kw_prompt = prompts::render(
        prompts::MINI_QUERY_TO_KEYWORDS,
        &[("query", query), ("type_pool", &type_pool.join(", "))],
    );
    let reply = engine
        .llm
        .complete_with_mode(&kw_prompt, &[], None, "keywords")
        .await?;
    let Some(parsed) = parse_keywords_reply(&reply, &kw_prompt) else {
        tracing::warn!("mini keyword extraction reply was not decodable json");
        return Ok(QueryResponse::failed(prompts::FAIL_RESPONSE));
    };
    let type_keywords = string_list(&parsed, "answer_type_keywords");
    let mut entities_from_query = string_list(&parsed, "entities_from_query");
    entities_from_query.truncate(MAX_QUERY_ENTITIES);
    if entities_from_query.is_empty() {
        return Ok(QueryResponse::failed(prompts::FAIL_RESPONSE));
    }

    build_mini_context(engine, &entities_from_query, &type_keywords, query, param).await
}

async fn build_mini_context(
    engine: &RagEngine,
    ent_from_query: &[String],
    type_keywords: &[String],
    query: &str,
    param: &QueryParam,
) -> Result<QueryResponse> {
    let filter = VectorFilter {
        metadata: param.metadata_filter.clone(),
        start_time: param.start_time,
        end_time: param.end_time,
    };

    // 1. Resolve each queried entity against the name index. Entity-name
    // vectors inherit metadata from their first source chunk only, so the
    // metadata clause stays out of the vector query; chunks are
    // post-filtered below instead.
    let mut per_query_matches: HashMap<String, Vec<String>> = HashMap::new();
    let mut candidates: HashMap<String, Candidate> = HashMap::new();
    for ent in ent_from_query {
        let hits = engine
            .entity_name_vdb
            .query(ent, param.top_k, &filter.time_only())
            .await?;
        let names: Vec<String> = hits
            .iter()
            .filter_map(|h| h.entity_name().map(str::to_string))
            .collect();
        for hit in &hits {
            if let Some(name) = hit.entity_name() {
                candidates.insert(
                    name.to_string(),
                    Candidate {
                        score: hit.distance as f64,
                        paths: HashMap::new(),
                        chunks: Vec::new(),
                    },
                );
            }
        }
        per_query_matches.insert(ent.clone(), names);
    }
    if candidates.is_empty() {
        return Ok(QueryResponse::failed(prompts::FAIL_RESPONSE));
    }

    // 2. Expand 2-hop neighborhoods.
    let mut important_entities: Vec<String> = Vec::new();
    let mut neighborhoods: HashMap<String, Vec<(String, String)>> = HashMap::new();
    let mut names: Vec<String> = candidates.keys().cloned().collect();
    names.sort();
    for name in &names {
        neighborhoods.insert(
            name.clone(),
            engine.graph.get_neighbors_within_k_hops(name, 2).await?,
        );
        important_entities.push(name.clone());
    }

    // 3. Prune path-less candidates to the top slice by similarity.
    let mut with_paths = Vec::new();
    let mut without_paths = Vec::new();
    for name in names {
        if neighborhoods[&name].is_empty() {
            without_paths.push(name);
        } else {
            with_paths.push(name);
        }
    }
    without_paths.sort_by(|a, b| {
        candidates[b]
            .score
            .partial_cmp(&candidates[a].score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(b))
    });
    let keep_short = ((without_paths.len() as f64 * SHORT_PATH_KEEP_RATIO) as usize).max(1);
    let kept: HashSet<String> = with_paths
        .iter()
        .chain(without_paths.iter().take(keep_short))
        .cloned()
        .collect();
    candidates.retain(|name, _| kept.contains(name));

    // 4. Add answer-type entities to the important set.
    let typed_nodes = engine.graph.get_node_from_types(type_keywords).await?;
    let answer_names: HashSet<String> = typed_nodes.iter().map(|(n, _)| n.clone()).collect();
    important_entities.extend(answer_names.iter().cloned());
    let important: HashSet<&str> = important_entities.iter().map(String::as_str).collect();

    // 5. Score the reasoning paths.
    for (name, candidate) in candidates.iter_mut() {
        for pair in &neighborhoods[name] {
            let answer_hits = [&pair.0, &pair.1]
                .iter()
                .filter(|n| answer_names.contains(**n))
                .count() as f64;
            candidate.paths.insert(
                pair.clone(),
                PathScore {
                    answer_hits,
                    vote: candidate.score,
                },
            );
        }
    }

    // 6. Edge voting over a relationship search for the original query.
    // Relationship vectors carry first-source-chunk metadata only; push down
    // the time window alone, as with the name index above.
    let edge_hits = engine
        .relationships_vdb
        .query(
            query,
            param.top_k * ent_from_query.len().max(1),
            &filter.time_only(),
        )
        .await?;
    if edge_hits.is_empty() {
        return Ok(QueryResponse::failed(prompts::FAIL_RESPONSE));
    }
    let good_edges: Vec<(String, String)> = edge_hits
        .iter()
        .filter_map(|hit| match (hit.src_id(), hit.tgt_id()) {
            (Some(s), Some(t)) => Some((s.to_string(), t.to_string())),
            _ => None,
        })
        .filter(|(s, t)| important.contains(s.as_str()) || important.contains(t.as_str()))
        .collect();

    let mut pairs_append: HashMap<(String, String), Vec<(String, String)>> = HashMap::new();
    let vote_weight = engine.config.mini.edge_vote_weight;
    for candidate in candidates.values_mut() {
        for (pair, score) in candidate.paths.iter_mut() {
            for (src, tgt) in &good_edges {
                let on_path = (src == &pair.0 || src == &pair.1)
                    && (tgt == &pair.0 || tgt == &pair.1);
                if on_path {
                    score.vote += vote_weight;
                    pairs_append.entry(pair.clone()).or_default().push((src.clone(), tgt.clone()));
                }
            }
        }
    }

    // 7. Translate each candidate's paths into weighted chunk candidates.
    paths_to_chunks(engine, &mut candidates, &pairs_append, query).await?;

    // 8. Entity table, strongest candidates first.
    let mut entity_rows: Vec<(String, f64, String)> = Vec::new();
    for (name, candidate) in &candidates {
        if let Some(node) = engine.graph.get_node(name).await? {
            entity_rows.push((name.clone(), candidate.score, node.description));
        }
    }
    entity_rows.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    let entity_rows = truncate_list_by_token_size(
        entity_rows,
        |(_, _, description)| description.as_str(),
        param.max_token_for_node_context,
        engine.tokenizer.as_ref(),
    );

    // 9. Fuse path-derived chunks with direct chunk hits.
    let direct_hits = engine
        .chunks_vdb
        .query(query, (param.top_k / 2).max(1), &filter)
        .await?;
    let direct_ids: HashSet<String> = direct_hits.iter().map(|h| h.id.clone()).collect();
    let final_chunk_ids = fuse_candidate_chunks(
        &per_query_matches,
        &candidates,
        &direct_ids,
        (param.top_k / 2).max(1),
    );

    // 10. Fetch chunk bodies and assemble the context. Path-derived chunk
    // ids come straight from graph source_id sets, so the metadata/time
    // filter is applied here, after the fetch.
    let mut chunk_rows: Vec<(String, ChunkRecord)> = Vec::new();
    for chunk_id in &final_chunk_ids {
        if let Some(row) = engine.text_chunks.get_by_id(chunk_id).await? {
            if let Ok(chunk) = serde_json::from_value::<ChunkRecord>(row) {
                chunk_rows.push((chunk_id.clone(), chunk));
            }
        }
    }
    let before = chunk_rows.len();
    chunk_rows.retain(|(_, chunk)| filter.matches(&chunk.metadata, chunk.updated_at));
    tracing::debug!(before, after = chunk_rows.len(), "mini chunk post-filter");

    let entities_csv = rows_to_csv_plain(
        &["entity", "score", "description"],
        &entity_rows
            .iter()
            .map(|(name, score, description)| {
                vec![name.clone(), score.to_string(), description.clone()]
            })
            .collect::<Vec<_>>(),
    );
    let sources_csv = rows_to_csv(
        &["id", "content"],
        &chunk_rows
            .iter()
            .map(|(_, chunk)| vec![chunk.content.clone()])
            .collect::<Vec<_>>(),
    );
    let context = format!(
        "\n-----Entities-----\n```csv\n{entities_csv}\n```\n-----Sources-----\n```csv\n{sources_csv}\n```\n"
    );
    let sources: Vec<String> = chunk_rows
        .iter()
        .map(|(_, chunk)| chunk.content.clone())
        .collect();
    tracing::info!(
        entities = entity_rows.len(),
        chunks = chunk_rows.len(),
        "mini context assembled"
    );

    let provenance = param.include_provenance.then(|| Provenance {
        entities: entity_rows
            .iter()
            .map(|(name, score, description)| ProvenanceEntity {
                entity_name: name.clone(),
                score: *score,
                description: description.clone(),
            })
            .collect(),
        chunks: chunk_rows
            .iter()
            .map(|(chunk_id, chunk)| ProvenanceChunk {
                chunk_id: chunk_id.clone(),
                full_doc_id: chunk.full_doc_id.clone(),
                chunk_order_index: chunk.chunk_order_index,
                tokens: chunk.tokens,
                content: chunk.content.clone(),
            })
            .collect(),
    });

    if param.only_need_context {
        return Ok(QueryResponse {
            content: context,
            sources,
            provenance,
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
        provenance,
    })
}

/// For every candidate, gather chunk ids from voted edges, the path start
/// node and intermediate nodes, weight occurrence counts by the path score
/// and keep the strongest `path_chunk_cap` chunks. A node contributing more
/// than `node_chunk_cap` chunks keeps the ones most similar to the query.
async fn paths_to_chunks(
    engine: &RagEngine,
    candidates: &mut HashMap<String, Candidate>,
    pairs_append: &HashMap<(String, String), Vec<(String, String)>>,
    query: &str,
) -> Result<()> {
    let cap = engine.config.mini.node_chunk_cap;
    let max_chunks = engine.config.mini.path_chunk_cap;
    let mut node_chunk_cache: HashMap<String, Vec<String>> = HashMap::new();

    let mut names: Vec<String> = candidates.keys().cloned().collect();
    names.sort();
    for name in names {
        let candidate = candidates.get(&name).cloned().unwrap_or(Candidate {
            score: 0.0,
            paths: HashMap::new(),
            chunks: Vec::new(),
        });
        let mut weights: HashMap<String, f64> = HashMap::new();

        let mut path_keys: Vec<&(String, String)> = candidate.paths.keys().collect();
        path_keys.sort();
        for pair in path_keys {
            let score = candidate.paths[pair];
            let mut chunk_ids: Vec<String> = Vec::new();

            if let Some(edges) = pairs_append.get(pair) {
                for (src, tgt) in edges {
                    if let Some(edge) = engine.graph.get_edge(src, tgt).await? {
                        chunk_ids.extend(split_sources(&edge.source_id));
                    }
                }
            }
            if let Some(node) = engine.graph.get_node(&pair.0).await? {
                chunk_ids.extend(split_sources(&node.source_id));
            }
            chunk_ids.extend(
                node_chunks_capped(engine, &pair.1, query, cap, &mut node_chunk_cache).await?,
            );

            let total = score.total();
            for chunk_id in chunk_ids {
                *weights.entry(chunk_id).or_insert(0.0) += total;
            }
        }

        let chunks = if weights.is_empty() {
            // No scored paths: fall back to the candidate's own sources.
            match engine.graph.get_node(&name).await? {
                Some(node) => {
                    let mut counts: HashMap<String, usize> = HashMap::new();
                    for chunk_id in split_sources(&node.source_id) {
                        *counts.entry(chunk_id).or_insert(0) += 1;
                    }
                    top_n_by_weight(
                        counts.into_iter().map(|(k, v)| (k, v as f64)).collect(),
                        max_chunks,
                    )
                }
                None => Vec::new(),
            }
        } else {
            top_n_by_weight(weights.into_iter().collect(), max_chunks)
        };

        if let Some(entry) = candidates.get_mut(&name) {
            entry.chunks = chunks;
        }
    }
    Ok(())
}

/// Source chunks of an intermediate node, capped to the ones whose
/// description is most similar to the query by embedding cosine.
async fn node_chunks_capped(
    engine: &RagEngine,
    node_name: &str,
    query: &str,
    cap: usize,
    cache: &mut HashMap<String, Vec<String>>,
) -> Result<Vec<String>> {
    if let Some(cached) = cache.get(node_name) {
        return Ok(cached.clone());
    }
    let Some(node) = engine.graph.get_node(node_name).await? else {
        return Ok(Vec::new());
    };
    let chunk_ids = split_sources(&node.source_id);
    let descriptions: Vec<String> = node
        .description
        .split(GRAPH_FIELD_SEP)
        .map(str::to_string)
        .collect();

    // The per-description pruning only applies when sources and descriptions
    // line up one-to-one.
    let result = if chunk_ids.len() > cap && chunk_ids.len() == descriptions.len() {
        let mut texts = descriptions.clone();
        texts.push(query.to_string());
        let vectors = engine.embedder.embed(&texts).await?;
        let Some((query_vector, description_vectors)) = vectors.split_last() else {
            cache.insert(node_name.to_string(), chunk_ids.clone());
            return Ok(chunk_ids);
        };
        let mut scored: Vec<(usize, f32)> = description_vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, cosine_similarity(query_vector, v)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored
            .into_iter()
            .take(cap)
            .map(|(i, _)| chunk_ids[i].clone())
            .collect()
    } else {
        chunk_ids
    };

    cache.insert(node_name.to_string(), result.clone());
    Ok(result)
}

/// Fold every query entity's candidate chunk lists into one ranking: the
/// best-matching candidate counts double, direct vector hits at the head of
/// a path are boosted, and the strongest `chunk_nums` distinct chunks win.
fn fuse_candidate_chunks(
    per_query_matches: &HashMap<String, Vec<String>>,
    candidates: &HashMap<String, Candidate>,
    direct_ids: &HashSet<String>,
    chunk_nums: usize,
) -> Vec<String> {
    let mut totals: HashMap<String, f64> = HashMap::new();
    let mut query_entities: Vec<&String> = per_query_matches.keys().collect();
    query_entities.sort();
    for ent in query_entities {
        let matched: Vec<&Candidate> = per_query_matches[ent]
            .iter()
            .filter_map(|name| candidates.get(name))
            .collect();
        for (idx, candidate) in matched.iter().enumerate() {
            let base = if idx == 0 {
                candidate.score * 2.0
            } else {
                candidate.score
            };
            for chunk_id in &candidate.chunks {
                let mut score = base;
                if chunk_id == &candidate.chunks[0] && direct_ids.contains(chunk_id) {
                    score *= DIRECT_HIT_BOOST;
                }
                *totals.entry(chunk_id.clone()).or_insert(0.0) += score;
            }
        }
    }
    top_n_by_weight(totals.into_iter().collect(), chunk_nums)
}

fn split_sources(joined: &str) -> Vec<String> {
    joined
        .split(GRAPH_FIELD_SEP)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn top_n_by_weight(mut weighted: Vec<(String, f64)>, n: usize) -> Vec<String> {
    weighted.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    weighted.into_iter().take(n).map(|(id, _)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_score_is_additive() {
        let score = PathScore {
            answer_hits: 1.0,
            vote: 0.5,
        };
        assert!((score.total() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_answer_type_endpoint_breaks_ties() {
        // Two candidates, equal similarity, equal path shape; only one path
        // touches an answer-type entity.
        let answer: PathScore = PathScore {
            answer_hits: 1.0,
            vote: 0.8,
        };
        let plain: PathScore = PathScore {
            answer_hits: 0.0,
            vote: 0.8,
        };
        assert!(answer.total() > plain.total());
    }

    #[test]
    fn test_fuse_prefers_boosted_direct_hits() {
        let mut per_query = HashMap::new();
        per_query.insert("acme".to_string(), vec!["\"ACME\"".to_string()]);
        let mut candidates = HashMap::new();
        candidates.insert(
            "\"ACME\"".to_string(),
            Candidate {
                score: 1.0,
                paths: HashMap::new(),
                chunks: vec!["chunk-direct".to_string(), "chunk-other".to_string()],
            },
        );
        let direct: HashSet<String> = HashSet::from(["chunk-direct".to_string()]);
        let fused = fuse_candidate_chunks(&per_query, &candidates, &direct, 1);
        assert_eq!(fused, vec!["chunk-direct".to_string()]);
    }

    #[test]
    fn test_top_n_by_weight_is_deterministic_on_ties() {
        let ranked = top_n_by_weight(
            vec![
                ("b".to_string(), 1.0),
                ("a".to_string(), 1.0),
                ("c".to_string(), 2.0),
            ],
            3,
        );
        assert_eq!(ranked, vec!["c", "a", "b"]);
    }
}

//! Default graph backend: a petgraph `StableDiGraph` keyed by canonical
//! entity name. Stable indices keep the name→index map valid across node
//! removals. Snapshotted to JSON as (nodes, edges) lists.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use super::{GraphStorage, StorageContext};
use crate::error::{RagError, Result};
use crate::prompts::GRAPH_FIELD_SEP;
use crate::types::{EdgeData, NodeData};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphSnapshot {
    nodes: Vec<(String, NodeData)>,
    edges: Vec<(String, String, EdgeData)>,
}

struct GraphInner {
    graph: StableDiGraph<(String, NodeData), EdgeData>,
    index: HashMap<String, NodeIndex>,
}

impl GraphInner {
    fn node_name(&self, idx: NodeIndex) -> &str {
        &self.graph[idx].0
    }
}

pub struct PetgraphStorage {
    path: PathBuf,
    inner: RwLock<GraphInner>,
}

impl PetgraphStorage {
    pub fn open(ctx: &StorageContext) -> Result<Self> {
        let path = ctx.snapshot_path("graph");
        let mut inner = GraphInner {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
        };
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let snapshot: GraphSnapshot = serde_json::from_str(&raw).map_err(|e| {
                RagError::StorageFatal(anyhow::anyhow!("corrupt snapshot {path:?}: {e}"))
            })?;
            for (name, data) in snapshot.nodes {
                let idx = inner.graph.add_node((name.clone(), data));
                inner.index.insert(name, idx);
            }
            for (src, tgt, data) in snapshot.edges {
                if let (Some(&a), Some(&b)) = (inner.index.get(&src), inner.index.get(&tgt)) {
                    inner.graph.add_edge(a, b, data);
                }
            }
        }
        Ok(Self {
            path,
            inner: RwLock::new(inner),
        })
    }
}

fn split_source_ids(source_id: &str) -> Vec<String> {
    source_id
        .split(GRAPH_FIELD_SEP)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn normalize_type(entity_type: &str) -> String {
    entity_type.trim().trim_matches('"').to_lowercase()
}

fn sorted_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[async_trait]
impl GraphStorage for PetgraphStorage {
    async fn has_node(&self, node_id: &str) -> Result<bool> {
        Ok(self.inner.read().index.contains_key(node_id))
    }

    async fn has_edge(&self, src_id: &str, tgt_id: &str) -> Result<bool> {
        let inner = self.inner.read();
        match (inner.index.get(src_id), inner.index.get(tgt_id)) {
            (Some(&a), Some(&b)) => Ok(inner.graph.find_edge(a, b).is_some()),
            _ => Ok(false),
        }
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeData>> {
        let inner = self.inner.read();
        Ok(inner
            .index
            .get(node_id)
            .map(|&idx| inner.graph[idx].1.clone()))
    }

    async fn get_edge(&self, src_id: &str, tgt_id: &str) -> Result<Option<EdgeData>> {
        let inner = self.inner.read();
        match (inner.index.get(src_id), inner.index.get(tgt_id)) {
            (Some(&a), Some(&b)) => Ok(inner
                .graph
                .find_edge(a, b)
                .map(|e| inner.graph[e].clone())),
            _ => Ok(None),
        }
    }

    async fn node_degree(&self, node_id: &str) -> Result<usize> {
        let inner = self.inner.read();
        let Some(&idx) = inner.index.get(node_id) else {
            return Ok(0);
        };
        let degree = inner
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .count()
            + inner.graph.edges_directed(idx, Direction::Incoming).count();
        Ok(degree)
    }

    async fn edge_degree(&self, src_id: &str, tgt_id: &str) -> Result<usize> {
        Ok(self.node_degree(src_id).await? + self.node_degree(tgt_id).await?)
    }

    async fn get_node_edges(&self, node_id: &str) -> Result<Vec<(String, String)>> {
        let inner = self.inner.read();
        let Some(&idx) = inner.index.get(node_id) else {
            return Ok(Vec::new());
        };
        let mut edges = Vec::new();
        for edge in inner.graph.edges_directed(idx, Direction::Outgoing) {
            edges.push((
                node_id.to_string(),
                inner.node_name(edge.target()).to_string(),
            ));
        }
        for edge in inner.graph.edges_directed(idx, Direction::Incoming) {
            edges.push((
                node_id.to_string(),
                inner.node_name(edge.source()).to_string(),
            ));
        }
        Ok(edges)
    }

    async fn upsert_node(&self, node_id: &str, data: NodeData) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.index.get(node_id) {
            Some(&idx) => inner.graph[idx].1 = data,
            None => {
                let idx = inner.graph.add_node((node_id.to_string(), data));
                inner.index.insert(node_id.to_string(), idx);
            }
        }
        Ok(())
    }

    async fn upsert_edge(&self, src_id: &str, tgt_id: &str, data: EdgeData) -> Result<()> {
        let mut inner = self.inner.write();
        let a = match inner.index.get(src_id) {
            Some(&idx) => idx,
            None => {
                return Err(RagError::storage_fatal(format!(
                    "upsert_edge: missing node '{src_id}'"
                )))
            }
        };
        let b = match inner.index.get(tgt_id) {
            Some(&idx) => idx,
            None => {
                return Err(RagError::storage_fatal(format!(
                    "upsert_edge: missing node '{tgt_id}'"
                )))
            }
        };
        match inner.graph.find_edge(a, b) {
            Some(e) => inner.graph[e] = data,
            None => {
                inner.graph.add_edge(a, b, data);
            }
        }
        Ok(())
    }

    async fn delete_node(&self, node_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(idx) = inner.index.remove(node_id) {
            inner.graph.remove_node(idx);
            tracing::info!(node = %node_id, "deleted graph node and attached edges");
        }
        Ok(())
    }

    async fn delete_by_chunk_ids(
        &self,
        chunk_ids: &[String],
    ) -> Result<(Vec<String>, Vec<(String, String)>)> {
        if chunk_ids.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let targets: HashSet<&str> = chunk_ids.iter().map(|s| s.as_str()).collect();
        let mut inner = self.inner.write();

        let mut removed_entities = Vec::new();
        let mut removed_pairs: Vec<(String, String)> = Vec::new();
        let mut seen_pairs = HashSet::new();

        // Edges first: prune chunk references, drop edges left with none.
        let edge_indexes: Vec<_> = inner.graph.edge_indices().collect();
        for e in edge_indexes {
            let remaining: Vec<String> = split_source_ids(&inner.graph[e].source_id)
                .into_iter()
                .filter(|sid| !targets.contains(sid.as_str()))
                .collect();
            if remaining.is_empty() {
                if let Some((a, b)) = inner.graph.edge_endpoints(e) {
                    let pair = sorted_pair(inner.node_name(a), inner.node_name(b));
                    if seen_pairs.insert(pair.clone()) {
                        removed_pairs.push(pair);
                    }
                }
                inner.graph.remove_edge(e);
            } else {
                inner.graph[e].source_id = remaining.join(GRAPH_FIELD_SEP);
            }
        }

        // Then nodes; removing a node detaches its surviving edges too.
        let node_indexes: Vec<_> = inner.graph.node_indices().collect();
        for n in node_indexes {
            let remaining: Vec<String> = split_source_ids(&inner.graph[n].1.source_id)
                .into_iter()
                .filter(|sid| !targets.contains(sid.as_str()))
                .collect();
            if remaining.is_empty() {
                let name = inner.node_name(n).to_string();
                let mut detached = Vec::new();
                for edge in inner.graph.edges_directed(n, Direction::Outgoing) {
                    detached.push(sorted_pair(&name, inner.node_name(edge.target())));
                }
                for edge in inner.graph.edges_directed(n, Direction::Incoming) {
                    detached.push(sorted_pair(&name, inner.node_name(edge.source())));
                }
                for pair in detached {
                    if seen_pairs.insert(pair.clone()) {
                        removed_pairs.push(pair);
                    }
                }
                inner.index.remove(&name);
                inner.graph.remove_node(n);
                removed_entities.push(name);
            } else {
                inner.graph[n].1.source_id = remaining.join(GRAPH_FIELD_SEP);
            }
        }

        if !removed_entities.is_empty() || !removed_pairs.is_empty() {
            tracing::info!(
                entities = removed_entities.len(),
                edges = removed_pairs.len(),
                "cascade-deleted graph elements referencing dropped chunks"
            );
        }
        removed_entities.sort();
        removed_pairs.sort();
        Ok((removed_entities, removed_pairs))
    }

    async fn get_types(&self) -> Result<(Vec<String>, Vec<String>)> {
        let inner = self.inner.read();
        let mut lower = HashSet::new();
        let mut stored = HashSet::new();
        for idx in inner.graph.node_indices() {
            let entity_type = inner.graph[idx].1.entity_type.clone();
            if entity_type.is_empty() {
                continue;
            }
            lower.insert(normalize_type(&entity_type));
            stored.insert(entity_type);
        }
        let mut lower: Vec<String> = lower.into_iter().collect();
        let mut stored: Vec<String> = stored.into_iter().collect();
        lower.sort();
        stored.sort();
        Ok((lower, stored))
    }

    async fn get_node_from_types(&self, types: &[String]) -> Result<Vec<(String, NodeData)>> {
        let wanted: HashSet<String> = types.iter().map(|t| normalize_type(t)).collect();
        let inner = self.inner.read();
        let mut nodes: Vec<(String, NodeData)> = inner
            .graph
            .node_indices()
            .filter_map(|idx| {
                let (name, data) = &inner.graph[idx];
                wanted
                    .contains(&normalize_type(&data.entity_type))
                    .then(|| (name.clone(), data.clone()))
            })
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(nodes)
    }

    async fn get_neighbors_within_k_hops(
        &self,
        node_id: &str,
        k: usize,
    ) -> Result<Vec<(String, String)>> {
        let inner = self.inner.read();
        let Some(&start) = inner.index.get(node_id) else {
            return Ok(Vec::new());
        };

        let mut pairs = Vec::new();
        let mut seen_pairs = HashSet::new();
        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([(start, 0usize)]);
        while let Some((node, depth)) = queue.pop_front() {
            if depth >= k {
                continue;
            }
            let name = inner.node_name(node).to_string();
            let mut neighbors = Vec::new();
            for edge in inner.graph.edges_directed(node, Direction::Outgoing) {
                neighbors.push(edge.target());
            }
            for edge in inner.graph.edges_directed(node, Direction::Incoming) {
                neighbors.push(edge.source());
            }
            for neighbor in neighbors {
                let pair = (name.clone(), inner.node_name(neighbor).to_string());
                if seen_pairs.insert(pair.clone()) {
                    pairs.push(pair);
                }
                if visited.insert(neighbor) {
                    queue.push_back((neighbor, depth + 1));
                }
            }
        }
        Ok(pairs)
    }

    async fn index_done_callback(&self) -> Result<()> {
        let inner = self.inner.read();
        let snapshot = GraphSnapshot {
            nodes: inner
                .graph
                .node_indices()
                .map(|idx| inner.graph[idx].clone())
                .collect(),
            edges: inner
                .graph
                .edge_indices()
                .filter_map(|e| {
                    let (a, b) = inner.graph.edge_endpoints(e)?;
                    Some((
                        inner.node_name(a).to_string(),
                        inner.node_name(b).to_string(),
                        inner.graph[e].clone(),
                    ))
                })
                .collect(),
        };
        super::json_kv::write_snapshot(&self.path, &snapshot)
    }
}

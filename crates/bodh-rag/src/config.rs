use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Directory holding persisted store files and logs.
    pub working_dir: PathBuf,
    /// Partition label stamped on every record in every store.
    pub workspace: String,

    pub storage: StorageSelection,
    pub chunking: ChunkingConfig,
    pub field_split: FieldSplitConfig,
    pub extraction: ExtractionConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub mini: MiniQueryConfig,

    /// Documents processed concurrently per batch.
    pub max_parallel_insert: usize,
    /// Vector hits below this cosine similarity are dropped.
    pub cosine_better_than_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSelection {
    pub kv_storage: String,
    pub vector_storage: String,
    pub graph_storage: String,
    pub doc_status_storage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_token_size: usize,
    pub chunk_overlap_token_size: usize,
    pub tokenizer_model_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSplitConfig {
    pub enable_field_splitting: bool,
    pub generate_combined_chunk: bool,
    /// Keys treated as textual when partitioning a structured record.
    pub text_field_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub entity_extract_max_gleaning: usize,
    pub entity_summary_to_max_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub embedding_batch_num: usize,
    pub embedding_func_max_async: usize,
    pub embedding_cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub llm_model_max_token_size: usize,
    pub llm_model_max_async: usize,
    pub enable_llm_cache: bool,
}

/// Tunables for the mini strategy's path scoring (see DESIGN.md: the edge
/// vote combination is additive by default).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiniQueryConfig {
    pub edge_vote_weight: f64,
    /// A node contributing more than this many source chunks keeps only the
    /// most query-similar ones.
    pub node_chunk_cap: usize,
    /// Chunks retained per reasoning candidate.
    pub path_chunk_cap: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("./bodh_rag_cache"),
            workspace: "default".to_string(),
            storage: StorageSelection {
                kv_storage: "JsonKvStorage".to_string(),
                vector_storage: "SimpleVectorStorage".to_string(),
                graph_storage: "PetgraphStorage".to_string(),
                doc_status_storage: "JsonDocStatusStorage".to_string(),
            },
            chunking: ChunkingConfig {
                chunk_token_size: 1200,
                chunk_overlap_token_size: 100,
                tokenizer_model_name: "gpt-4o-mini".to_string(),
            },
            field_split: FieldSplitConfig {
                enable_field_splitting: true,
                generate_combined_chunk: true,
                text_field_keys: ["title", "description", "summary", "content", "body", "text"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            extraction: ExtractionConfig {
                entity_extract_max_gleaning: 1,
                entity_summary_to_max_tokens: 500,
            },
            embedding: EmbeddingConfig {
                embedding_batch_num: 32,
                embedding_func_max_async: 16,
                embedding_cache_size: 1000,
            },
            llm: LlmConfig {
                llm_model_max_token_size: 32768,
                llm_model_max_async: 16,
                enable_llm_cache: true,
            },
            mini: MiniQueryConfig {
                edge_vote_weight: 1.0,
                node_chunk_cap: 5,
                path_chunk_cap: 3,
            },
            max_parallel_insert: 2,
            cosine_better_than_threshold: 0.2,
        }
    }
}

impl GlobalConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.workspace.is_empty() {
            return Err("workspace must not be empty".into());
        }
        if self.chunking.chunk_token_size == 0 {
            return Err("chunking.chunk_token_size must be > 0".into());
        }
        if self.chunking.chunk_overlap_token_size >= self.chunking.chunk_token_size {
            return Err("chunking.chunk_overlap_token_size must be < chunk_token_size".into());
        }
        if self.embedding.embedding_batch_num == 0 {
            return Err("embedding.embedding_batch_num must be > 0".into());
        }
        if self.embedding.embedding_func_max_async == 0 {
            return Err("embedding.embedding_func_max_async must be > 0".into());
        }
        if self.llm.llm_model_max_async == 0 {
            return Err("llm.llm_model_max_async must be > 0".into());
        }
        if self.max_parallel_insert == 0 {
            return Err("max_parallel_insert must be > 0".into());
        }
        if self.mini.path_chunk_cap == 0 {
            return Err("mini.path_chunk_cap must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing fields.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

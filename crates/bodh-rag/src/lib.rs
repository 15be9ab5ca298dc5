pub mod chunker;
pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod ids;
pub mod ingest;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod query;
pub mod storage;
pub mod tokenize;
pub mod types;

mod extract;

// Re-export primary types for convenience
pub use config::GlobalConfig;
pub use error::{RagError, Result};
pub use filter::VectorFilter;
pub use pipeline::{RagEngine, StructuredSink};
pub use types::{
    DocStatus, InsertInput, InsertOptions, Provenance, QueryMode, QueryParam, QueryResponse,
    TableSchema,
};

pub use embedding::EmbeddingClient;
pub use llm::LlmClient;
pub use tokenize::Tokenizer;

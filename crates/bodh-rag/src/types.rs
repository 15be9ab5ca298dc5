use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Document processing state. Persisted as the literal strings
/// `PENDING`, `PROCESSING`, `PROCESSED`, `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "PROCESSED")]
    Processed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl DocStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocStatus::Pending => "PENDING",
            DocStatus::Processing => "PROCESSING",
            DocStatus::Processed => "PROCESSED",
            DocStatus::Failed => "FAILED",
        }
    }
}

/// Row in the doc-status store. `content` is carried here because the
/// processing phase reads pending documents back from this store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocStatusRecord {
    pub content: String,
    pub content_summary: String,
    pub content_length: usize,
    pub status: DocStatus,
    #[serde(default)]
    pub chunks_count: Option<usize>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row in the full_docs KV store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Row in the text_chunks KV store; the chunks vector index carries the
/// same fields next to the embedded content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub tokens: usize,
    pub content: String,
    pub chunk_order_index: usize,
    pub full_doc_id: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Knowledge-graph node properties. Multi-value fields are joined with
/// [`crate::prompts::GRAPH_FIELD_SEP`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData {
    pub entity_type: String,
    pub description: String,
    pub source_id: String,
}

/// Knowledge-graph edge properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeData {
    pub weight: f64,
    pub description: String,
    pub keywords: String,
    pub source_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryMode {
    #[serde(rename = "naive")]
    Naive,
    #[serde(rename = "light")]
    Light,
    #[serde(rename = "mini")]
    Mini,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryParam {
    pub mode: QueryMode,
    pub only_need_context: bool,
    pub response_type: String,
    pub top_k: usize,
    pub max_token_for_text_unit: usize,
    pub max_token_for_global_context: usize,
    pub max_token_for_local_context: usize,
    pub max_token_for_node_context: usize,
    /// Scalar values match by equality, list values by membership.
    pub metadata_filter: Option<Map<String, Value>>,
    /// Translated into a `text_field` filter clause before dispatch:
    /// `None` → `"_all"`, one entry → equality, several → any-of.
    pub target_fields: Option<Vec<String>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub include_provenance: bool,
}

impl Default for QueryParam {
    fn default() -> Self {
        Self {
            mode: QueryMode::Mini,
            only_need_context: false,
            response_type: "Multiple Paragraphs".to_string(),
            top_k: 60,
            max_token_for_text_unit: 4000,
            max_token_for_global_context: 4000,
            max_token_for_local_context: 4000,
            max_token_for_node_context: 500,
            metadata_filter: None,
            target_fields: None,
            start_time: None,
            end_time: None,
            include_provenance: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceEntity {
    pub entity_name: String,
    pub score: f64,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceChunk {
    pub chunk_id: String,
    pub full_doc_id: String,
    pub chunk_order_index: usize,
    pub tokens: usize,
    pub content: String,
}

/// Structured companion returned when `include_provenance` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub entities: Vec<ProvenanceEntity>,
    pub chunks: Vec<ProvenanceChunk>,
}

/// Query result: `content` is the LLM answer, or the assembled context when
/// `only_need_context` was requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub content: String,
    pub sources: Vec<String>,
    pub provenance: Option<Provenance>,
}

impl QueryResponse {
    pub fn failed(message: &str) -> Self {
        Self {
            content: message.to_string(),
            sources: Vec::new(),
            provenance: None,
        }
    }
}

/// Insert input: one string, many strings, one record or many records.
#[derive(Debug, Clone)]
pub enum InsertInput {
    Text(String),
    Texts(Vec<String>),
    Record(Map<String, Value>),
    Records(Vec<Map<String, Value>>),
}

impl From<&str> for InsertInput {
    fn from(s: &str) -> Self {
        InsertInput::Text(s.to_string())
    }
}

impl From<String> for InsertInput {
    fn from(s: String) -> Self {
        InsertInput::Text(s)
    }
}

impl From<Vec<String>> for InsertInput {
    fn from(v: Vec<String>) -> Self {
        InsertInput::Texts(v)
    }
}

impl From<Map<String, Value>> for InsertInput {
    fn from(m: Map<String, Value>) -> Self {
        InsertInput::Record(m)
    }
}

impl From<Vec<Map<String, Value>>> for InsertInput {
    fn from(v: Vec<Map<String, Value>>) -> Self {
        InsertInput::Records(v)
    }
}

/// Per-item metadata: a single map fans out to every item.
#[derive(Debug, Clone)]
pub enum Metadatas {
    Shared(Map<String, Value>),
    PerItem(Vec<Map<String, Value>>),
}

#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    pub ids: Option<Vec<String>>,
    pub metadatas: Option<Metadatas>,
    pub overwrite: bool,
    pub schema: Option<TableSchema>,
    pub text_fields: Option<Vec<String>>,
}

/// Declared projection of structured records into a relational table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Declared columns, in order.
    pub fields: Vec<(String, FieldSpec)>,
    #[serde(default)]
    pub conflict_columns: Option<Vec<String>>,
}

fn default_id_column() -> String {
    "doc_id".to_string()
}

impl TableSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.fields.iter().map(|(n, _)| n.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Declared column type: text, integer, float, numeric, boolean, …
    /// Unknown types pass values through untouched.
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

fn default_true() -> bool {
    true
}

impl FieldSpec {
    pub fn text(nullable: bool) -> Self {
        Self {
            field_type: "text".to_string(),
            nullable,
        }
    }

    pub fn is_textual(&self) -> bool {
        matches!(
            self.field_type.to_lowercase().as_str(),
            "text" | "varchar" | "character varying"
        )
    }
}

/// One row of the structured side-output, keyed by the schema's columns.
pub type StructuredRow = Map<String, Value>;

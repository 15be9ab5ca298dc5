use thiserror::Error;

/// Error taxonomy for the engine. Retry policy keys off the variant:
/// only `StorageTransient` is retried, everything else propagates or is
/// handled at the call site.
#[derive(Debug, Error)]
pub enum RagError {
    /// Caller input is malformed: id/metadata arity mismatch, duplicate ids,
    /// non-nullable schema field missing, conflicting filters.
    #[error("validation error: {0}")]
    Validation(String),

    /// An LLM reply could not be decoded even after fallback extraction.
    #[error("parse error: {0}")]
    Parse(String),

    /// Backend hiccup that is worth retrying (connectivity, contended write).
    #[error("transient storage error: {0}")]
    StorageTransient(anyhow::Error),

    /// Schema mismatch, unknown namespace, corrupt persisted state.
    #[error("storage error: {0}")]
    StorageFatal(anyhow::Error),

    #[error("llm error: {0}")]
    Llm(anyhow::Error),

    #[error("embedding error: {0}")]
    Embedding(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RagError>;

impl RagError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RagError::StorageTransient(_))
    }

    pub fn storage_fatal(msg: impl Into<String>) -> Self {
        RagError::StorageFatal(anyhow::anyhow!(msg.into()))
    }

    pub fn storage_transient(msg: impl Into<String>) -> Self {
        RagError::StorageTransient(anyhow::anyhow!(msg.into()))
    }
}

impl From<serde_json::Error> for RagError {
    fn from(e: serde_json::Error) -> Self {
        RagError::StorageFatal(e.into())
    }
}

impl From<std::io::Error> for RagError {
    fn from(e: std::io::Error) -> Self {
        RagError::StorageTransient(e.into())
    }
}

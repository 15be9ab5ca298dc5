//! LLM collaborator boundary: a minimal completion trait plus the cached,
//! concurrency-bounded wrapper every pipeline call goes through. Replies are
//! memoized in the `llm_response_cache` KV namespace keyed by
//! `mode + md5(system ⊕ history ⊕ prompt)`, so identical calls cost one
//! model invocation per workspace.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::error::{RagError, Result};
use crate::storage::KvStorage;

#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        history: &[ChatTurn],
        system_prompt: Option<&str>,
    ) -> Result<String>;
}

pub struct CachedLlm {
    inner: Arc<dyn LlmClient>,
    cache: Option<Arc<dyn KvStorage>>,
    semaphore: Arc<Semaphore>,
}

impl CachedLlm {
    pub fn new(
        inner: Arc<dyn LlmClient>,
        cache: Option<Arc<dyn KvStorage>>,
        max_async: usize,
    ) -> Self {
        Self {
            inner,
            cache,
            semaphore: Arc::new(Semaphore::new(max_async.max(1))),
        }
    }

    pub async fn complete(
        &self,
        prompt: &str,
        history: &[ChatTurn],
        system_prompt: Option<&str>,
    ) -> Result<String> {
        self.complete_with_mode(prompt, history, system_prompt, "default")
            .await
    }

    pub async fn complete_with_mode(
        &self,
        prompt: &str,
        history: &[ChatTurn],
        system_prompt: Option<&str>,
        mode: &str,
    ) -> Result<String> {
        let cache_key = self.cache.as_ref().map(|_| cache_id(prompt, history, system_prompt, mode));

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(row) = cache.get_by_id(key).await? {
                if let Some(cached) = row.get("return").and_then(|v| v.as_str()) {
                    tracing::debug!(mode, "llm cache hit");
                    return Ok(cached.to_string());
                }
            }
        }

        let response = {
            let _permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|e| RagError::Llm(e.into()))?;
            self.inner.complete(prompt, history, system_prompt).await?
        };

        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            let row = json!({
                "return": response,
                "original_prompt": prompt,
                "mode": mode,
            });
            let mut data = std::collections::HashMap::new();
            data.insert(key, row);
            // A failed cache write must not fail the call.
            if let Err(e) = cache.upsert(data).await {
                tracing::warn!(error = %e, "failed to write llm response cache");
            }
        }

        Ok(response)
    }
}

/// `mode:md5(...)`, mirroring the (workspace, mode, id) cache row key.
fn cache_id(prompt: &str, history: &[ChatTurn], system_prompt: Option<&str>, mode: &str) -> String {
    let mut hashed = String::new();
    if let Some(system) = system_prompt {
        hashed.push_str(system);
        hashed.push('\u{1}');
    }
    for turn in history {
        hashed.push_str(&turn.role);
        hashed.push('\u{1}');
        hashed.push_str(&turn.content);
        hashed.push('\u{1}');
    }
    hashed.push_str(prompt);
    format!("{}:{:x}", mode, md5::compute(hashed.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_id_distinguishes_mode_and_history() {
        let a = cache_id("p", &[], None, "default");
        let b = cache_id("p", &[], None, "keywords");
        let c = cache_id("p", &[ChatTurn::user("x")], None, "default");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, cache_id("p", &[], None, "default"));
    }
}

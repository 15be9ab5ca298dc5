//! Embedding collaborator boundary. The engine never embeds directly: it
//! goes through [`BatchingEmbedder`], which splits work into batches, bounds
//! in-flight calls with a semaphore and memoizes by content hash.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::{RagError, Result};

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    fn embedding_dim(&self) -> usize;

    fn max_token_size(&self) -> usize {
        8192
    }

    /// Returns one vector of `embedding_dim` floats per input text.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Clone, Copy)]
pub struct EmbeddingProgress {
    pub texts_embedded: u64,
    pub batches_completed: u64,
}

pub struct BatchingEmbedder {
    inner: Arc<dyn EmbeddingClient>,
    semaphore: Arc<Semaphore>,
    batch_size: usize,
    cache: Mutex<LruCache<String, Vec<f32>>>,
    texts_embedded: AtomicU64,
    batches_completed: AtomicU64,
}

impl BatchingEmbedder {
    pub fn new(
        inner: Arc<dyn EmbeddingClient>,
        batch_size: usize,
        max_async: usize,
        cache_size: usize,
    ) -> Self {
        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            semaphore: Arc::new(Semaphore::new(max_async.max(1))),
            batch_size: batch_size.max(1),
            cache: Mutex::new(LruCache::new(cache_size)),
            texts_embedded: AtomicU64::new(0),
            batches_completed: AtomicU64::new(0),
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.inner.embedding_dim()
    }

    pub fn progress(&self) -> EmbeddingProgress {
        EmbeddingProgress {
            texts_embedded: self.texts_embedded.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
        }
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::Embedding(anyhow::anyhow!("empty embedding response")))
    }

    /// Embed `texts`, reusing cached vectors and batching the misses.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut miss_indexes = Vec::new();
        {
            let mut cache = self.cache.lock();
            for (i, text) in texts.iter().enumerate() {
                let key = format!("{:x}", md5::compute(text.as_bytes()));
                match cache.get(&key) {
                    Some(vector) => results[i] = Some(vector.clone()),
                    None => miss_indexes.push(i),
                }
            }
        }

        if !miss_indexes.is_empty() {
            let batches: Vec<Vec<usize>> = miss_indexes
                .chunks(self.batch_size)
                .map(|c| c.to_vec())
                .collect();
            let tasks = batches.into_iter().map(|batch| {
                let batch_texts: Vec<String> =
                    batch.iter().map(|&i| texts[i].clone()).collect();
                async move {
                    let _permit = self
                        .semaphore
                        .acquire()
                        .await
                        .map_err(|e| RagError::Embedding(e.into()))?;
                    let vectors = self.inner.embed(&batch_texts).await?;
                    if vectors.len() != batch_texts.len() {
                        return Err(RagError::Embedding(anyhow::anyhow!(
                            "embedding batch returned {} vectors for {} texts",
                            vectors.len(),
                            batch_texts.len()
                        )));
                    }
                    self.texts_embedded
                        .fetch_add(batch_texts.len() as u64, Ordering::Relaxed);
                    self.batches_completed.fetch_add(1, Ordering::Relaxed);
                    Ok::<_, RagError>((batch, vectors))
                }
            });
            let completed = futures::future::try_join_all(tasks).await?;

            let mut cache = self.cache.lock();
            for (batch, vectors) in completed {
                for (i, vector) in batch.into_iter().zip(vectors) {
                    let key = format!("{:x}", md5::compute(texts[i].as_bytes()));
                    cache.put(key, vector.clone());
                    results[i] = Some(vector);
                }
            }
        }

        Ok(results.into_iter().map(|v| v.unwrap_or_default()).collect())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

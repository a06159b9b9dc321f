//! Embedding cache keyed by content hash.
//!
//! The cache only saves provider calls; correctness never depends on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use vassago_core::{ContentHash, Error, Result};

use crate::embedding::Embedder;

/// Cache key: the embedding model plus the hash of the embedded text.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    /// Embedding model name.
    pub model: String,
    /// Hash of the embedded text.
    pub hash: ContentHash,
}

impl CacheKey {
    /// Builds the key for `text` under `model`.
    #[must_use]
    pub fn new(model: &str, text: &str) -> Self {
        Self {
            model: model.to_string(),
            hash: ContentHash::of(text),
        }
    }
}

/// Key-value store for embeddings.
#[async_trait]
pub trait EmbeddingCache: Send + Sync {
    /// Returns the cached embedding, if any.
    async fn get(&self, key: &CacheKey) -> Option<Vec<f32>>;

    /// Stores an embedding.
    async fn put(&self, key: CacheKey, embedding: Vec<f32>);
}

/// Bounded in-process cache.
///
/// Once `capacity` entries are held, admitting a new key evicts an arbitrary
/// existing one. A capacity of zero caches nothing.
pub struct InMemoryEmbeddingCache {
    entries: DashMap<CacheKey, Arc<Vec<f32>>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InMemoryEmbeddingCache {
    /// Creates a cache holding at most `capacity` embeddings.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Number of cached embeddings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `(hits, misses)`.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl EmbeddingCache for InMemoryEmbeddingCache {
    async fn get(&self, key: &CacheKey) -> Option<Vec<f32>> {
        if let Some(entry) = self.entries.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.value().as_ref().clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    async fn put(&self, key: CacheKey, embedding: Vec<f32>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            // The iterator holds a shard lock; release it before removing.
            let victim = self.entries.iter().next().map(|entry| entry.key().clone());
            if let Some(victim) = victim {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(key, Arc::new(embedding));
    }
}

/// Embedder that consults a cache before calling the wrapped embedder.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Arc<dyn EmbeddingCache>,
}

impl CachedEmbedder {
    /// Wraps `inner` with `cache`.
    pub fn new(inner: Arc<dyn Embedder>, cache: Arc<dyn EmbeddingCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let model = self.inner.model_name();
        let mut results: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut missing = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let cached = self.cache.get(&CacheKey::new(model, text)).await;
            if cached.is_none() {
                missing.push(i);
            }
            results.push(cached);
        }

        if !missing.is_empty() {
            let batch: Vec<&str> = missing.iter().map(|&i| texts[i]).collect();
            let fresh = self.inner.embed(&batch).await?;
            if fresh.len() != batch.len() {
                return Err(Error::internal(format!(
                    "embedder returned {} embeddings for {} inputs",
                    fresh.len(),
                    batch.len()
                )));
            }

            for (i, embedding) in missing.into_iter().zip(fresh) {
                self.cache
                    .put(CacheKey::new(model, texts[i]), embedding.clone())
                    .await;
                results[i] = Some(embedding);
            }
        }

        tracing::trace!(inputs = texts.len(), "Embedded with cache");

        results
            .into_iter()
            .map(|r| r.ok_or_else(|| Error::internal("embedding missing after cache fill")))
            .collect()
    }

    fn dimension(&self) -> Option<usize> {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::embedding::MockEmbedder;

    struct CountingEmbedder {
        inner: MockEmbedder,
        texts_embedded: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
            self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed(texts).await
        }

        fn dimension(&self) -> Option<usize> {
            self.inner.dimension()
        }

        fn model_name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_cache_short_circuits_repeats() {
        let inner = Arc::new(CountingEmbedder {
            inner: MockEmbedder::new(16),
            texts_embedded: AtomicUsize::new(0),
        });
        let cache = Arc::new(InMemoryEmbeddingCache::new(100));
        let embedder = CachedEmbedder::new(inner.clone(), cache.clone());

        let first = embedder.embed(&["a b", "c d"]).await.unwrap();
        let second = embedder.embed(&["c d", "a b", "e f"]).await.unwrap();

        assert_eq!(inner.texts_embedded.load(Ordering::SeqCst), 3);
        assert_eq!(second[0], first[1]);
        assert_eq!(second[1], first[0]);
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let cache = InMemoryEmbeddingCache::new(1);
        cache.put(CacheKey::new("m", "one"), vec![1.0]).await;
        cache.put(CacheKey::new("m", "two"), vec![2.0]).await;

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&CacheKey::new("m", "two")).await, Some(vec![2.0]));
        assert!(cache.get(&CacheKey::new("m", "one")).await.is_none());
        assert_eq!(cache.stats(), (1, 1));
    }

    #[tokio::test]
    async fn test_full_cache_keeps_admitting_new_keys() {
        let cache = InMemoryEmbeddingCache::new(3);
        for i in 0..10 {
            let key = CacheKey::new("m", &format!("text {i}"));
            cache.put(key.clone(), vec![i as f32]).await;
            assert_eq!(cache.get(&key).await, Some(vec![i as f32]));
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.len(), 3);

        // Overwriting a held key evicts nothing.
        let held = CacheKey::new("m", "text 9");
        cache.put(held.clone(), vec![-1.0]).await;
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&held).await, Some(vec![-1.0]));

        let disabled = InMemoryEmbeddingCache::new(0);
        disabled.put(CacheKey::new("m", "x"), vec![1.0]).await;
        assert!(disabled.is_empty());
    }

    #[tokio::test]
    async fn test_keys_are_per_model() {
        let cache = InMemoryEmbeddingCache::new(10);
        cache.put(CacheKey::new("model-a", "text"), vec![1.0]).await;
        assert!(cache.get(&CacheKey::new("model-b", "text")).await.is_none());
    }
}

//! Embedding and completion capabilities.

use async_trait::async_trait;
use vassago_core::{Error, Result};

/// Trait for embedding models.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generates embeddings for the given texts, in input order.
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Generates a single embedding.
    async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.embed(&[text]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal("No embedding generated"))
    }

    /// Returns the embedding dimension, when known ahead of the first call.
    fn dimension(&self) -> Option<usize>;

    /// Returns the model name.
    fn model_name(&self) -> &str;
}

/// Trait for completion models.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Answers `prompt` using the given context passages, most relevant first.
    async fn complete(&self, prompt: &str, context: &[String]) -> Result<String>;

    /// Returns the model name.
    fn model_name(&self) -> &str;
}

/// Deterministic offline embedder.
///
/// Hashes lowercase words into `dimension` buckets and normalizes the counts,
/// so texts sharing vocabulary score as similar. Useful for tests and for
/// running the pipeline without a provider.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    /// Creates a new mock embedder.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let bucket = fnv1a(&word.to_lowercase()) % self.dimension as u64;
            vector[bucket as usize] += 1.0;
        }
        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    fn model_name(&self) -> &str {
        "mock-embedder"
    }
}

/// Offline generator that echoes the question and its best passage.
#[derive(Debug, Default)]
pub struct MockGenerator;

impl MockGenerator {
    /// Creates a new mock generator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn complete(&self, prompt: &str, context: &[String]) -> Result<String> {
        let best = context.first().map_or("", String::as_str);
        Ok(format!(
            "{prompt}\n\nBased on {} passage(s): {best}",
            context.len()
        ))
    }

    fn model_name(&self) -> &str {
        "mock-generator"
    }
}

fn fnv1a(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Normalizes a vector to unit length. Zero vectors are left unchanged.
pub fn normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-10 {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

/// Computes cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a > 1e-10 && norm_b > 1e-10 {
        dot / (norm_a * norm_b)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_embedder() {
        let embedder = MockEmbedder::new(64);
        let embeddings = embedder.embed(&["hello", "world"]).await.unwrap();

        assert_eq!(embeddings.len(), 2);
        assert_eq!(embeddings[0].len(), 64);
        assert_eq!(embeddings[1].len(), 64);

        // Same text should produce same embedding
        let emb1 = embedder.embed_single("hello").await.unwrap();
        let emb2 = embedder.embed_single("hello").await.unwrap();
        assert_eq!(emb1, emb2);
    }

    #[tokio::test]
    async fn test_mock_embedder_similarity_tracks_vocabulary() {
        let embedder = MockEmbedder::new(256);
        let query = embedder.embed_single("refund policy").await.unwrap();
        let related = embedder
            .embed_single("Our refund policy allows returns within 30 days.")
            .await
            .unwrap();
        let unrelated = embedder
            .embed_single("The office dog is named Biscuit.")
            .await
            .unwrap();

        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));

        let norm: f32 = related.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_mock_generator() {
        let answer = MockGenerator::new()
            .complete("What is X?", &["X is a letter.".to_string()])
            .await
            .unwrap();
        assert!(answer.contains("What is X?"));
        assert!(answer.contains("X is a letter."));
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);

        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c)).abs() < 1e-6);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 1e-6);

        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
    }
}

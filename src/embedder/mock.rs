/// Mock embedder for testing.
///
/// Generates deterministic, L2-normalized embeddings from text hashes so
/// tests can run the full pipeline without model files.
use std::hash::{DefaultHasher, Hash, Hasher};

use super::{l2_normalize_in_place, Embedder, EmbedderError};

pub struct MockEmbedder {
    pub dimensions: usize,
}

impl MockEmbedder {
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self { dimensions: 384 }
    }
}

impl Embedder for MockEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimensions]);
        }

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let bytes = hasher.finish().to_le_bytes();

        let mut embedding: Vec<f32> = (0..self.dimensions)
            .map(|i| bytes[i % 8] as f32 / 255.0)
            .collect();
        l2_normalize_in_place(&mut embedding);

        Ok(embedding)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_embed_dimensions() {
        let embedder = MockEmbedder::new(384);
        assert_eq!(embedder.embed("hello world").unwrap().len(), 384);
    }

    #[test]
    fn test_mock_embed_deterministic() {
        let embedder = MockEmbedder::default();
        assert_eq!(
            embedder.embed("hello").unwrap(),
            embedder.embed("hello").unwrap()
        );
    }

    #[test]
    fn test_mock_embed_distinct_inputs() {
        let embedder = MockEmbedder::default();
        assert_ne!(
            embedder.embed("hello").unwrap(),
            embedder.embed("world").unwrap()
        );
    }

    #[test]
    fn test_mock_embed_normalized() {
        let embedder = MockEmbedder::default();
        let vec = embedder.embed("test normalization").unwrap();
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01, "expected unit vector, got {norm}");
    }

    #[test]
    fn test_mock_embed_empty_is_zero_vector() {
        let embedder = MockEmbedder::new(16);
        assert_eq!(embedder.embed("").unwrap(), vec![0.0; 16]);
        assert_eq!(embedder.embed("  \n ").unwrap(), vec![0.0; 16]);
    }

    #[test]
    fn test_mock_embed_batch_order() {
        let embedder = MockEmbedder::new(128);
        let results = embedder.embed_batch(&["a", "b", "c"]).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0], embedder.embed("a").unwrap());
        assert_eq!(results[2], embedder.embed("c").unwrap());
    }
}

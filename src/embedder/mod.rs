/// Text embedding: the backend trait and its error type, the ONNX and
/// mock implementations, the lazy single-flight wrapper, and model
/// download support.
pub mod download;
pub mod lazy;
pub mod mock;
pub mod onnx;
pub mod tokenizer;

use thiserror::Error;

/// Failures from model loading, tokenization, or inference.
#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("embedding model could not be loaded: {0}")]
    ModelLoad(String),

    #[error("tokenization failed: {0}")]
    Tokenizer(String),

    #[error("embedding inference failed: {0}")]
    Inference(String),
}

/// A text embedding backend.
///
/// Implementations are `Send + Sync`; the server shares one instance
/// behind an `Arc` across concurrent tool calls.
pub trait Embedder: Send + Sync {
    /// Embed one text into a fixed-width vector.
    ///
    /// Empty or whitespace-only input yields the all-zero vector of
    /// [`Embedder::dimensions`] width, never an error, so degenerate
    /// snippets flow through the pipeline without special-casing.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;

    /// Embed several texts, one output vector per input, in input order.
    /// Empty entries follow the same zero-vector rule as [`Embedder::embed`].
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError>;

    /// Width of the vectors this backend produces.
    fn dimensions(&self) -> usize;
}

/// Scale a vector to unit length in place. The zero vector has no
/// direction to keep and is left untouched.
pub(crate) fn l2_normalize_in_place(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_scales_to_unit_length() {
        let mut v = vec![2.0, -2.0, 2.0, -2.0];
        l2_normalize_in_place(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert_eq!(v[0], -v[1], "direction must survive scaling");
    }

    #[test]
    fn test_normalize_leaves_zero_vector() {
        let mut v = vec![0.0f32; 4];
        l2_normalize_in_place(&mut v);
        assert_eq!(v, vec![0.0; 4]);
    }
}

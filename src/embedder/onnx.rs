/// ONNX embedding backend built on the `ort` runtime.
///
/// The model emits one hidden state per token; the sentence vector is the
/// attention-masked mean of those states, scaled to unit length so the
/// store's cosine distances land in [0, 2].
use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;
use ort::value::Tensor;
use tracing::info;

use super::tokenizer::BertTokenizer;
use super::{l2_normalize_in_place, Embedder, EmbedderError};

pub struct OnnxEmbedder {
    session: Mutex<Session>,
    tokenizer: BertTokenizer,
    dimensions: usize,
}

fn load_err(stage: &str, e: impl std::fmt::Display) -> EmbedderError {
    EmbedderError::ModelLoad(format!("{stage}: {e}"))
}

fn infer_err(stage: &str, e: impl std::fmt::Display) -> EmbedderError {
    EmbedderError::Inference(format!("{stage}: {e}"))
}

impl OnnxEmbedder {
    /// Load `model.onnx` and `tokenizer.json` from `model_dir`.
    pub fn new(model_dir: &Path, dimensions: usize) -> Result<Self, EmbedderError> {
        let model_path = model_dir.join("model.onnx");
        if !model_path.exists() {
            return Err(EmbedderError::ModelLoad(format!(
                "no model.onnx under {}",
                model_dir.display()
            )));
        }

        info!("Loading ONNX model from {}", model_path.display());
        let session = Session::builder()
            .and_then(|b| Ok(b.with_intra_threads(4)?))
            .and_then(|b| Ok(b.with_inter_threads(4)?))
            .and_then(|mut b| b.commit_from_file(&model_path))
            .map_err(|e| load_err("onnx session setup", e))?;

        let tokenizer = BertTokenizer::from_model_dir(model_dir)?;
        info!(
            "Embedding model ready (vocab {}, width {dimensions})",
            tokenizer.vocab_size()
        );

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            dimensions,
        })
    }
}

impl Embedder for OnnxEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimensions]);
        }

        let encoding = self.tokenizer.tokenize(text)?;
        let mask = encoding.attention_mask;
        let len = mask.len();

        // The (shape, data) tuple constructor keeps ort decoupled from any
        // particular ndarray version.
        let ids = Tensor::from_array(([1, len], encoding.input_ids))
            .map_err(|e| infer_err("input_ids tensor", e))?;
        let mask_tensor = Tensor::from_array(([1, len], mask.clone()))
            .map_err(|e| infer_err("attention_mask tensor", e))?;
        let segments = Tensor::from_array(([1, len], vec![0i64; len]))
            .map_err(|e| infer_err("token_type_ids tensor", e))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| infer_err("session lock", e))?;
        let outputs = session
            .run(ort::inputs![
                "input_ids" => ids,
                "attention_mask" => mask_tensor,
                "token_type_ids" => segments,
            ])
            .map_err(|e| infer_err("forward pass", e))?;

        // Hidden states come back flat: [1, len, dimensions].
        let (_, hidden) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| infer_err("reading hidden states", e))?;

        Ok(pooled(hidden, &mask, self.dimensions))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        // The session takes one sequence at a time; request batching
        // happens upstream in the lazy wrapper.
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Average the token states the attention mask marks as real, then scale
/// to unit length. A fully masked sequence produces the zero vector.
fn pooled(hidden: &[f32], mask: &[i64], width: usize) -> Vec<f32> {
    let mut sum = vec![0.0f32; width];
    let mut kept = 0usize;

    for (frame, m) in hidden.chunks_exact(width).zip(mask) {
        if *m == 0 {
            continue;
        }
        kept += 1;
        for (acc, h) in sum.iter_mut().zip(frame) {
            *acc += h;
        }
    }

    if kept > 0 {
        let inv = 1.0 / kept as f32;
        for v in &mut sum {
            *v *= inv;
        }
    }
    l2_normalize_in_place(&mut sum);
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn test_pooled_skips_masked_frames() {
        // Frames of width 2; the third is padding and must not count.
        let hidden = [0.5, 1.5, 3.0, 1.0, 9.0, 9.0];
        let mask = [1i64, 1, 0];

        let v = pooled(&hidden, &mask, 2);
        assert_eq!(v.len(), 2);
        assert!((norm(&v) - 1.0).abs() < 1e-6);
        // Pre-scaling mean of the two real frames is (1.75, 1.25); the
        // component ratio survives normalization.
        assert!((v[0] / v[1] - 1.75 / 1.25).abs() < 1e-5);
    }

    #[test]
    fn test_pooled_single_frame() {
        let v = pooled(&[1.0, 1.0], &[1], 2);
        let expected = 1.0 / 2.0f32.sqrt();
        assert!((v[0] - expected).abs() < 1e-6);
        assert!((v[1] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_pooled_all_padding_is_zero() {
        let v = pooled(&[1.0, 2.0, 3.0, 4.0], &[0i64, 0], 2);
        assert_eq!(v, vec![0.0, 0.0]);
    }

    /// Needs real model files on disk; run with --ignored after a download.
    #[test]
    #[ignore]
    fn test_real_model_roundtrip() {
        let dir = Path::new("models/multilingual-e5-small");
        if !dir.join("model.onnx").exists() {
            eprintln!("Skipping: model files not downloaded");
            return;
        }

        let embedder = OnnxEmbedder::new(dir, 384).unwrap();

        let v = embedder
            .embed("hybrid retrieval mixes keyword and vector ranking")
            .unwrap();
        assert_eq!(v.len(), 384);
        assert!((norm(&v) - 1.0).abs() < 0.01, "expected a unit vector");

        // Empty input short-circuits to the zero vector.
        assert_eq!(embedder.embed("   ").unwrap(), vec![0.0; 384]);
    }
}

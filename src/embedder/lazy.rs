/// Lazily initialized, process-shared embedder.
///
/// The model is heavy (hundreds of MB) and may not even be needed for a
/// given session, so loading is deferred to the first embedding call and
/// guarded by a single-flight latch: the first caller performs the load
/// while concurrent callers await the same lock; a failed load leaves the
/// slot empty so the next caller retries. After a successful load the
/// model is never re-initialized.
///
/// Inference is blocking (ort session), so every call runs on the blocking
/// thread pool.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::onnx::OnnxEmbedder;
use super::{Embedder, EmbedderError};
use crate::error::{embedding_failure_message, RagError};

/// Number of texts embedded per blocking batch call.
pub const EMBED_BATCH_SIZE: usize = 8;

type Loader = dyn Fn() -> Result<Arc<dyn Embedder>, EmbedderError> + Send + Sync;

pub struct LazyEmbedder {
    slot: Mutex<Option<Arc<dyn Embedder>>>,
    loader: Arc<Loader>,
    dimensions: usize,
    cache_dir: PathBuf,
}

impl LazyEmbedder {
    /// Build a lazy embedder around an arbitrary loader. Used directly by
    /// tests; production code goes through [`LazyEmbedder::onnx`].
    pub fn new(loader: Arc<Loader>, dimensions: usize, cache_dir: PathBuf) -> Self {
        Self {
            slot: Mutex::new(None),
            loader,
            dimensions,
            cache_dir,
        }
    }

    /// Lazy ONNX embedder reading model files from `model_dir`.
    #[must_use]
    pub fn onnx(model_dir: &Path, dimensions: usize) -> Self {
        let dir = model_dir.to_path_buf();
        Self::new(
            Arc::new(move || {
                OnnxEmbedder::new(&dir, dimensions).map(|e| Arc::new(e) as Arc<dyn Embedder>)
            }),
            dimensions,
            model_dir.to_path_buf(),
        )
    }

    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed a single text. Empty input yields a zero vector without
    /// touching the model.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimensions]);
        }

        let inner = self.instance().await?;
        let owned = text.to_string();
        self.run_blocking(move || inner.embed(&owned)).await
    }

    /// Embed many texts in input order, processed in groups of
    /// [`EMBED_BATCH_SIZE`]. Empty entries yield zero vectors.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.iter().all(|t| t.trim().is_empty()) {
            return Ok(vec![vec![0.0; self.dimensions]; texts.len()]);
        }

        let inner = self.instance().await?;
        let dimensions = self.dimensions;
        let mut results = Vec::with_capacity(texts.len());

        for group in texts.chunks(EMBED_BATCH_SIZE) {
            let group: Vec<String> = group.to_vec();
            let inner = inner.clone();
            let out = self
                .run_blocking(move || embed_group(inner.as_ref(), &group, dimensions))
                .await?;
            results.extend(out);
        }

        Ok(results)
    }

    /// Single-flight initialization. Holding the lock across the load keeps
    /// at most one attempt in flight; a failure leaves the slot empty so
    /// the next caller retries.
    async fn instance(&self) -> Result<Arc<dyn Embedder>, RagError> {
        let mut slot = self.slot.lock().await;
        if let Some(embedder) = slot.as_ref() {
            return Ok(embedder.clone());
        }

        let loader = self.loader.clone();
        let loaded = tokio::task::spawn_blocking(move || loader())
            .await
            .map_err(|e| self.failure(&format!("model load task aborted: {e}")))?
            .map_err(|e| self.failure(&e.to_string()))?;

        *slot = Some(loaded.clone());
        Ok(loaded)
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, RagError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, EmbedderError> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| self.failure(&format!("embedding task aborted: {e}")))?
            .map_err(|e| self.failure(&e.to_string()))
    }

    fn failure(&self, cause: &str) -> RagError {
        RagError::Embedding(embedding_failure_message(&self.cache_dir, cause))
    }
}

fn embed_group(
    embedder: &dyn Embedder,
    group: &[String],
    dimensions: usize,
) -> Result<Vec<Vec<f32>>, EmbedderError> {
    let mut out = vec![vec![0.0f32; dimensions]; group.len()];

    let mut positions = Vec::new();
    let mut refs = Vec::new();
    for (i, text) in group.iter().enumerate() {
        if !text.trim().is_empty() {
            positions.push(i);
            refs.push(text.as_str());
        }
    }

    let vectors = embedder.embed_batch(&refs)?;
    for (slot, vector) in positions.into_iter().zip(vectors) {
        out[slot] = vector;
    }

    Ok(out)
}

/// Crate-wide error taxonomy.
///
/// Every failure surfaced to an MCP caller maps to one of these variants,
/// so the transport layer can turn them into distinct RPC error messages.
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RagError {
    /// Input shape or value violation. Never recovered; reported verbatim.
    #[error("{0}")]
    Validation(String),

    /// Operation against a memory label that does not exist.
    #[error("memory not found: {0}")]
    NotFound(String),

    /// Embedding model initialization or inference failure.
    #[error("{0}")]
    Embedding(String),

    /// Vector store operation failure.
    #[error("database error: {0}")]
    Database(String),

    /// Unsupported extension, size cap exceeded, or unreadable file.
    #[error("{0}")]
    Parse(String),

    /// An insert failed and the rollback reinsert failed too.
    #[error("insert failed ({insert}) and rollback also failed ({rollback}); store may be missing rows for the affected source")]
    Rollback { insert: String, rollback: String },
}

impl RagError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn database(msg: impl std::fmt::Display) -> Self {
        Self::Database(msg.to_string())
    }
}

/// Whether a store error message describes an already-absent row set.
///
/// Deletes treat these as success (idempotent delete contract).
pub fn is_not_found_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("not found") || lower.contains("does not exist") || lower.contains("no matching")
}

/// Human-facing failure message for embedding errors.
///
/// Names the cache directory and walks through probable causes and
/// recommended actions, since model problems are the one failure an end
/// user can usually fix themselves.
pub fn embedding_failure_message(cache_dir: &Path, cause: &str) -> String {
    format!(
        "embedding failed: {cause}. Model cache directory: {dir}. \
         Probable causes: network unavailable during model download, \
         insufficient disk space, or a corrupted model cache. \
         Recommended actions: retry the request, check network connectivity, \
         or delete {dir} to force a fresh download.",
        dir = cache_dir.display(),
    )
}

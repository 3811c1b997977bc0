/// Configuration module for ragmem.
///
/// All settings come from the environment (the server is launched by an MCP
/// client, so there is no config file to point at). Missing variables fall
/// back to defaults; malformed numeric values are rejected by `validate()`.
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;

// ── Default value functions ──────────────────────────────────────────

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_model_name() -> String {
    "multilingual-e5-small".to_string()
}

fn default_chunk_size() -> usize {
    500
}

fn default_chunk_overlap() -> usize {
    50
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_hybrid_weight() -> f32 {
    0.6
}

/// Result-group trimming mode for search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupingMode {
    /// Keep only the tightest cluster (truncate at the first gap boundary).
    Similar,
    /// Keep the two tightest clusters (truncate at the second boundary).
    Related,
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Root directory that ingested file paths must stay within.
    pub root_dir: PathBuf,

    /// Directory owning the store's database file.
    pub data_dir: PathBuf,

    /// Directory holding the embedding model files.
    pub model_cache_dir: PathBuf,

    /// Embedding model identifier (HuggingFace repo basename).
    pub model_name: String,

    /// Embedding vector dimension. Rows with any other dimension are refused.
    pub dimensions: usize,

    /// Maximum ingestible file size in bytes.
    pub max_file_size: u64,

    /// Target chunk window size in characters.
    pub chunk_size: usize,

    /// Overlap between consecutive chunk windows in characters.
    pub chunk_overlap: usize,

    /// Lexical blend weight in [0, 1]; 0 disables the lexical contribution.
    pub hybrid_weight: f32,

    /// Optional global distance cutoff applied to every search.
    pub max_distance: Option<f32>,

    /// Optional statistical result-group trimming mode.
    pub grouping: Option<GroupingMode>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            data_dir: default_data_dir(),
            model_cache_dir: PathBuf::from("models").join(default_model_name()),
            model_name: default_model_name(),
            dimensions: 384,
            max_file_size: default_max_file_size(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            hybrid_weight: default_hybrid_weight(),
            max_distance: None,
            grouping: None,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Unset variables use defaults; unparseable numeric values log a
    /// warning and keep the default, so a stray environment variable cannot
    /// prevent startup. `validate()` catches real problems.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("RAGMEM_ROOT_DIR") {
            cfg.root_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("RAGMEM_DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("RAGMEM_MODEL") {
            cfg.model_name = v;
            cfg.model_cache_dir = PathBuf::from("models").join(&cfg.model_name);
        }
        if let Ok(v) = std::env::var("RAGMEM_MODEL_CACHE_DIR") {
            cfg.model_cache_dir = PathBuf::from(v);
        }

        cfg.max_file_size = env_parsed("RAGMEM_MAX_FILE_SIZE", cfg.max_file_size);
        cfg.chunk_size = env_parsed("RAGMEM_CHUNK_SIZE", cfg.chunk_size);
        cfg.chunk_overlap = env_parsed("RAGMEM_CHUNK_OVERLAP", cfg.chunk_overlap);
        cfg.hybrid_weight = env_parsed("RAGMEM_HYBRID_WEIGHT", cfg.hybrid_weight);

        if let Ok(v) = std::env::var("RAGMEM_MAX_DISTANCE") {
            match v.parse::<f32>() {
                Ok(d) => cfg.max_distance = Some(d),
                Err(e) => warn!("Ignoring RAGMEM_MAX_DISTANCE={v}: {e}"),
            }
        }
        if let Ok(v) = std::env::var("RAGMEM_GROUPING") {
            cfg.grouping = match v.as_str() {
                "similar" => Some(GroupingMode::Similar),
                "related" => Some(GroupingMode::Related),
                "" => None,
                other => {
                    warn!("Ignoring RAGMEM_GROUPING={other}: expected similar|related");
                    None
                }
            };
        }

        // Confinement checks need an absolute root to compare prefixes against.
        cfg.root_dir = std::path::absolute(&cfg.root_dir)
            .with_context(|| format!("cannot resolve root dir {}", cfg.root_dir.display()))?;

        Ok(cfg)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.chunk_size > 0, "chunk size must be positive");
        anyhow::ensure!(
            self.chunk_overlap < self.chunk_size,
            "chunk overlap must be smaller than chunk size"
        );
        anyhow::ensure!(self.dimensions > 0, "dimensions must be positive");
        anyhow::ensure!(self.max_file_size > 0, "max file size must be positive");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.hybrid_weight),
            "hybrid weight must be within [0, 1]"
        );
        if let Some(d) = self.max_distance {
            anyhow::ensure!(
                (0.0..=2.0).contains(&d),
                "max distance must be within [0, 2]"
            );
        }
        Ok(())
    }

    /// Path of the SQLite database file inside the data directory.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("ragmem.db")
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) => match v.parse::<T>() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Ignoring {name}={v}: {e}");
                default
            }
        },
        Err(_) => default,
    }
}

// ── Tests ────────────────────────────────────────────────────────────

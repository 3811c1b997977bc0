use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use tokio::sync::Mutex as TokioMutex;
use tracing_subscriber::EnvFilter;

use ragmem::chunker::Chunker;
use ragmem::config::Config;
use ragmem::db::models::SearchTuning;
use ragmem::db::Db;
use ragmem::embedder::lazy::LazyEmbedder;
use ragmem::mcp::server::{McpContext, McpServer};
use ragmem::parser::Parser;

/// Local RAG memory MCP server
#[derive(ClapParser, Debug)]
#[command(name = "ragmem", about = "Local RAG memory MCP server", version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Skip the automatic embedding model download
    #[arg(long)]
    skip_download: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Log to stderr: stdout is the RPC channel.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting ragmem MCP server...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    tracing::info!(
        root_dir = %config.root_dir.display(),
        data_dir = %config.data_dir.display(),
        model = %config.model_name,
        chunk_size = config.chunk_size,
        hybrid_weight = config.hybrid_weight,
        "Configuration loaded"
    );

    if !cli.skip_download {
        tracing::info!("Checking model files...");
        if let Err(e) = ragmem::embedder::download::download_model_files(
            &config.model_cache_dir,
            &config.model_name,
        ) {
            // Not fatal: the lazy embedder reports a recoverable error at
            // first use if the files never arrive.
            tracing::warn!("Model download failed: {e}");
        }
    } else {
        tracing::info!("Model download skipped (--skip-download)");
    }

    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("Failed to create data directory {}", config.data_dir.display())
    })?;

    let tuning = SearchTuning {
        hybrid_weight: config.hybrid_weight,
        max_distance: config.max_distance,
        grouping: config.grouping,
    };
    tracing::info!(db = %config.db_path().display(), "Opening vector store");
    let db = Db::open(config.db_path(), config.dimensions, tuning)
        .context("Failed to open vector store")?;

    let embedder = Arc::new(LazyEmbedder::onnx(
        &config.model_cache_dir,
        config.dimensions,
    ));
    let chunker = Arc::new(Chunker::new(config.chunk_size, config.chunk_overlap));
    let parser = Arc::new(Parser::new(config.root_dir.clone(), config.max_file_size));

    let ctx = McpContext {
        db: Arc::new(TokioMutex::new(db)),
        embedder,
        chunker,
        parser,
    };

    tracing::info!("Starting MCP server on stdio transport...");
    McpServer::new(ctx).start().await?;

    Ok(())
}

/// Transport glue: shared handler context plus the stdio server loop.
use std::sync::Arc;

use anyhow::{Context, Result};
use rmcp::{handler::server::router::Router, transport::io::stdio, ServiceExt};
use tokio::sync::Mutex as TokioMutex;

use crate::chunker::Chunker;
use crate::db::Db;
use crate::embedder::lazy::LazyEmbedder;
use crate::mcp::tools::AppTools;
use crate::parser::Parser;

/// Shared application context available to all tool handlers.
#[derive(Clone)]
pub struct McpContext {
    pub db: Arc<TokioMutex<Db>>,
    pub embedder: Arc<LazyEmbedder>,
    pub chunker: Arc<Chunker>,
    pub parser: Arc<Parser>,
}

/// Owns the context and runs the protocol loop.
#[derive(Clone)]
pub struct McpServer {
    pub ctx: McpContext,
}

impl McpServer {
    pub fn new(ctx: McpContext) -> Self {
        Self { ctx }
    }

    /// Serve the tool registry over stdio until the client hangs up.
    ///
    /// stdout carries the protocol frames; everything the server itself
    /// has to say goes to stderr through tracing.
    pub async fn start(self) -> Result<()> {
        let tools = AppTools::new(self.ctx);
        let router = Router::new(tools.clone()).with_tools(tools.tool_router.clone());

        tracing::info!("Tool router ready, binding stdio transport");
        let (stdin, stdout) = stdio();
        router
            .serve((stdin, stdout))
            .await
            .context("stdio transport failed")?;

        Ok(())
    }
}

/// MCP tool handlers for ragmem.
///
/// Eight tools: `query_documents`, `ingest_file`, `memorize_text`,
/// `update_memory`, `delete_file`, `list_files`, `cleanup_expired`,
/// `status`. Each `#[tool]` method is a thin envelope around a `handle_*`
/// method that owns validation and the pipeline; the handlers are public
/// so integration tests drive them without a transport.
use std::path::Path;

use chrono::{DateTime, Utc};
use rmcp::handler::server::wrapper::Parameters;
use rmcp::handler::server::ServerHandler;
use rmcp::{tool, tool_router, ErrorData as McpError, handler::server::tool::ToolRouter, model::*};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

use crate::chunker::Chunk;
use crate::db::models::{
    to_db_time, ChunkMetadata, ChunkRow, ListFilters, MemoryType, NewChunk, SearchOptions,
    SourceType,
};
use crate::error::RagError;
use crate::mcp::server::McpContext;
use crate::mcp::validate::{
    parse_optional_tags, parse_tags, parse_ttl, validate_min_score, validate_query_limit,
    UpdateMode,
};
use crate::parser::{is_valid_label, memory_label, MEMORY_SCHEME};

// ── Parameter structs ────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema, Default)]
pub struct QueryDocumentsParams {
    /// Natural-language query
    pub query: String,
    /// Maximum results, 1..20 (default: 10)
    pub limit: Option<i64>,
    /// Source kind filter: all | file | memory
    #[serde(rename = "type")]
    pub source_type: Option<String>,
    /// Tags every result must carry
    pub tags: Option<serde_json::Value>,
    /// Exact project filter
    pub project: Option<String>,
    /// Distance threshold in [0, 2]; lower keeps only closer matches
    #[serde(rename = "minScore")]
    pub min_score: Option<f64>,
}

#[derive(Deserialize, JsonSchema, Default)]
pub struct IngestFileParams {
    /// Absolute path of the file to ingest
    #[serde(rename = "filePath")]
    pub file_path: String,
    /// Tags to attach to every chunk
    pub tags: Option<serde_json::Value>,
    /// Project identifier
    pub project: Option<String>,
    /// When true, store without a project even if one is given
    pub global: Option<bool>,
}

#[derive(Deserialize, JsonSchema, Default)]
pub struct MemorizeTextParams {
    /// The text to remember
    pub text: String,
    /// Label for the snippet (default: snippet-<epoch-ms>)
    pub label: Option<String>,
    /// Language hint
    pub language: Option<String>,
    /// Tags to attach
    pub tags: Option<serde_json::Value>,
    /// Kind of memory: memory | lesson | note (default: memory)
    #[serde(rename = "type")]
    pub memory_type: Option<String>,
    /// Time to live: "permanent" or <n>d|h|m|y (default: permanent)
    pub ttl: Option<String>,
    /// Project identifier
    pub project: Option<String>,
    /// When true, store without a project even if one is given
    pub global: Option<bool>,
}

#[derive(Deserialize, JsonSchema, Default)]
pub struct UpdateMemoryParams {
    /// Label of the memory to update
    pub label: String,
    /// How to combine with the stored text: replace | append | prepend
    pub mode: Option<String>,
    /// New text (omit for tag-only updates)
    pub text: Option<String>,
    /// Replace the tag set entirely
    pub tags: Option<serde_json::Value>,
    /// Tags to add (ignored when tags is given)
    #[serde(rename = "addTags")]
    pub add_tags: Option<serde_json::Value>,
    /// Tags to remove by exact match (ignored when tags is given)
    #[serde(rename = "removeTags")]
    pub remove_tags: Option<serde_json::Value>,
}

#[derive(Deserialize, JsonSchema, Default)]
pub struct DeleteFileParams {
    /// Source path to delete (file path or memory://<label>)
    #[serde(rename = "filePath")]
    pub file_path: String,
}

#[derive(Deserialize, JsonSchema, Default)]
pub struct ListFilesParams {
    /// Source kind filter: all | file | memory
    #[serde(rename = "type")]
    pub source_type: Option<String>,
    /// Tags every entry must carry
    pub tags: Option<serde_json::Value>,
    /// Exact project filter
    pub project: Option<String>,
    /// Case-insensitive substring match on path or file name
    pub search: Option<String>,
    /// Maximum entries (default 50; 0 means unlimited)
    pub limit: Option<i64>,
}

// ── Response helpers ─────────────────────────────────────────────────

fn json_result(value: serde_json::Value) -> CallToolResult {
    CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(&value).unwrap_or_default(),
    )])
}

fn rag_error(e: RagError) -> McpError {
    match e {
        RagError::Validation(_) | RagError::NotFound(_) => {
            McpError::invalid_params(e.to_string(), None)
        }
        _ => McpError::internal_error(e.to_string(), None),
    }
}

// ── Tool implementations ─────────────────────────────────────────────

#[derive(Clone)]
pub struct AppTools {
    pub ctx: McpContext,
    pub tool_router: ToolRouter<Self>,
}

impl ServerHandler for AppTools {}

#[tool_router]
impl AppTools {
    pub fn new(ctx: McpContext) -> Self {
        Self {
            ctx,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Search ingested documents and memories with hybrid semantic + keyword ranking. Returns relevance-ranked passages."
    )]
    async fn query_documents(
        &self,
        params: Parameters<QueryDocumentsParams>,
    ) -> Result<CallToolResult, McpError> {
        self.handle_query_documents(params.0)
            .await
            .map(json_result)
            .map_err(rag_error)
    }

    #[tool(
        description = "Ingest a file from the allowed root directory: extract text, chunk, embed, and store, replacing any previous version."
    )]
    async fn ingest_file(
        &self,
        params: Parameters<IngestFileParams>,
    ) -> Result<CallToolResult, McpError> {
        self.handle_ingest_file(params.0)
            .await
            .map(json_result)
            .map_err(rag_error)
    }

    #[tool(
        description = "Store a free-form text snippet as a labeled memory with optional tags, project, and TTL."
    )]
    async fn memorize_text(
        &self,
        params: Parameters<MemorizeTextParams>,
    ) -> Result<CallToolResult, McpError> {
        self.handle_memorize_text(params.0)
            .await
            .map(json_result)
            .map_err(rag_error)
    }

    #[tool(
        description = "Update an existing memory: replace, append, or prepend text, and adjust its tags."
    )]
    async fn update_memory(
        &self,
        params: Parameters<UpdateMemoryParams>,
    ) -> Result<CallToolResult, McpError> {
        self.handle_update_memory(params.0)
            .await
            .map(json_result)
            .map_err(rag_error)
    }

    #[tool(description = "Delete a source and all of its chunks. Succeeds even if nothing is stored.")]
    async fn delete_file(
        &self,
        params: Parameters<DeleteFileParams>,
    ) -> Result<CallToolResult, McpError> {
        self.handle_delete_file(params.0)
            .await
            .map(json_result)
            .map_err(rag_error)
    }

    #[tool(description = "List stored sources with chunk counts, timestamps, and metadata.")]
    async fn list_files(
        &self,
        params: Parameters<ListFilesParams>,
    ) -> Result<CallToolResult, McpError> {
        self.handle_list_files(params.0)
            .await
            .map(json_result)
            .map_err(rag_error)
    }

    #[tool(description = "Remove every source whose TTL has elapsed.")]
    async fn cleanup_expired(&self) -> Result<CallToolResult, McpError> {
        self.handle_cleanup_expired()
            .await
            .map(json_result)
            .map_err(rag_error)
    }

    #[tool(description = "Report store health: source and chunk counts, memory usage, uptime, and search mode.")]
    async fn status(&self) -> Result<CallToolResult, McpError> {
        self.handle_status().await.map(json_result).map_err(rag_error)
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

impl AppTools {
    pub async fn handle_query_documents(
        &self,
        p: QueryDocumentsParams,
    ) -> Result<serde_json::Value, RagError> {
        let limit = validate_query_limit(p.limit.unwrap_or(10))?;
        let source_type = match p.source_type.as_deref() {
            Some(s) => SourceType::parse(s)?,
            None => SourceType::All,
        };
        let tags = parse_optional_tags(p.tags.as_ref())?;
        let min_score = p.min_score.map(validate_min_score).transpose()?;

        let vector = self.ctx.embedder.embed(&p.query).await?;

        let opts = SearchOptions {
            query_text: Some(p.query),
            limit,
            source_type,
            tags,
            project: p.project,
            min_score,
        };
        let db = self.ctx.db.lock().await;
        let hits = db.search(&vector, &opts)?;

        serde_json::to_value(&hits).map_err(|e| RagError::database(format!("serialization: {e}")))
    }

    pub async fn handle_ingest_file(
        &self,
        p: IngestFileParams,
    ) -> Result<serde_json::Value, RagError> {
        self.ctx.parser.validate(&p.file_path)?;
        if memory_label(&p.file_path).is_some() {
            return Err(RagError::validation(
                "ingest_file expects a real file path; use memorize_text for snippets",
            ));
        }
        let tags = parse_optional_tags(p.tags.as_ref())?;
        let project = resolve_project(p.project, p.global);

        let (text, language) = self.ctx.parser.parse(&p.file_path)?;
        let chunks = self.ctx.chunker.chunk(&text);
        let vectors = self.embed_chunks(&chunks).await?;

        let path = Path::new(&p.file_path);
        let now = Utc::now();
        let metadata = ChunkMetadata {
            file_name: path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(&p.file_path)
                .to_string(),
            file_size: text.len() as u64,
            file_type: path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_string(),
            language,
            memory_type: Some(MemoryType::File),
            tags,
            project,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };

        let chunk_count = self
            .replace_source(&p.file_path, chunks, vectors, metadata, now, true)
            .await?;

        Ok(json!({
            "filePath": p.file_path,
            "chunkCount": chunk_count,
            "timestamp": to_db_time(now),
        }))
    }

    pub async fn handle_memorize_text(
        &self,
        p: MemorizeTextParams,
    ) -> Result<serde_json::Value, RagError> {
        let now = Utc::now();
        let label = match p.label {
            Some(label) => {
                if !is_valid_label(&label) {
                    return Err(RagError::validation(format!(
                        "invalid label {label:?}: expected [A-Za-z0-9_.-]+"
                    )));
                }
                label
            }
            None => format!("snippet-{}", now.timestamp_millis()),
        };
        let memory_type = parse_snippet_type(p.memory_type.as_deref())?;
        let tags = parse_optional_tags(p.tags.as_ref())?;
        let expires_at = match p.ttl.as_deref() {
            Some(ttl) => parse_ttl(ttl, now)?,
            None => None,
        };
        let project = resolve_project(p.project, p.global);

        let chunks = self.ctx.chunker.chunk(&p.text);
        let vectors = self.embed_chunks(&chunks).await?;

        let metadata = ChunkMetadata {
            file_name: label.clone(),
            file_size: p.text.chars().count() as u64,
            file_type: "text-snippet".to_string(),
            language: p.language,
            memory_type: Some(memory_type),
            tags,
            project,
            expires_at,
            created_at: now,
            updated_at: now,
        };

        let file_path = format!("{MEMORY_SCHEME}{label}");
        let chunk_count = self
            .replace_source(&file_path, chunks, vectors, metadata, now, true)
            .await?;

        let mut out = json!({
            "filePath": file_path,
            "label": label,
            "chunkCount": chunk_count,
            "timestamp": to_db_time(now),
        });
        if let Some(expires) = expires_at {
            out["expiresAt"] = json!(to_db_time(expires));
        }
        Ok(out)
    }

    /// Text reconstruction joins stored chunks with a newline, so update is
    /// text-level fidelity: original chunk boundaries that were not
    /// newlines are not reproduced byte-for-byte.
    pub async fn handle_update_memory(
        &self,
        p: UpdateMemoryParams,
    ) -> Result<serde_json::Value, RagError> {
        if !is_valid_label(&p.label) {
            return Err(RagError::validation(format!(
                "invalid label {:?}: expected [A-Za-z0-9_.-]+",
                p.label
            )));
        }
        let mode = match p.mode.as_deref() {
            Some(m) => UpdateMode::parse(m)?,
            None => UpdateMode::Replace,
        };

        let existing = {
            let db = self.ctx.db.lock().await;
            db.get_by_label(&p.label)?
        };
        if existing.is_empty() {
            return Err(RagError::NotFound(p.label));
        }
        let old_meta = existing[0].metadata.clone();
        let existing_text = existing
            .iter()
            .map(|r| r.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let new_text = match p.text {
            None => existing_text,
            Some(t) => match mode {
                UpdateMode::Replace => t,
                UpdateMode::Append => format!("{existing_text}\n{t}"),
                UpdateMode::Prepend => format!("{t}\n{existing_text}"),
            },
        };

        let tags = match &p.tags {
            Some(value) => parse_tags(value)?,
            None => {
                let mut tags = old_meta.tags.clone();
                for tag in parse_optional_tags(p.add_tags.as_ref())? {
                    if !tags.contains(&tag) {
                        tags.push(tag);
                    }
                }
                let remove = parse_optional_tags(p.remove_tags.as_ref())?;
                tags.retain(|t| !remove.contains(t));
                tags
            }
        };

        let chunks = self.ctx.chunker.chunk(&new_text);
        let vectors = self.embed_chunks(&chunks).await?;

        let now = Utc::now();
        let metadata = ChunkMetadata {
            file_name: old_meta.file_name,
            file_size: new_text.chars().count() as u64,
            file_type: old_meta.file_type,
            language: old_meta.language,
            memory_type: old_meta.memory_type,
            tags: tags.clone(),
            project: old_meta.project,
            expires_at: old_meta.expires_at,
            created_at: old_meta.created_at,
            updated_at: now,
        };

        let file_path = format!("{MEMORY_SCHEME}{}", p.label);
        let chunk_count = self
            .replace_source(&file_path, chunks, vectors, metadata, now, false)
            .await?;

        Ok(json!({
            "filePath": file_path,
            "label": p.label,
            "chunkCount": chunk_count,
            "timestamp": to_db_time(now),
            "tags": tags,
        }))
    }

    pub async fn handle_delete_file(
        &self,
        p: DeleteFileParams,
    ) -> Result<serde_json::Value, RagError> {
        self.ctx.parser.validate(&p.file_path)?;

        let mut db = self.ctx.db.lock().await;
        db.delete(&p.file_path)?;

        Ok(json!({
            "filePath": p.file_path,
            "deleted": true,
            "timestamp": to_db_time(Utc::now()),
        }))
    }

    pub async fn handle_list_files(
        &self,
        p: ListFilesParams,
    ) -> Result<serde_json::Value, RagError> {
        let source_type = match p.source_type.as_deref() {
            Some(s) => SourceType::parse(s)?,
            None => SourceType::All,
        };
        let limit = match p.limit {
            None => 50,
            Some(l) if l < 0 => {
                return Err(RagError::validation(format!(
                    "limit must not be negative, got {l}"
                )))
            }
            Some(l) => l as usize,
        };
        let filters = ListFilters {
            source_type,
            tags: parse_optional_tags(p.tags.as_ref())?,
            project: p.project,
            search: p.search,
            limit,
        };

        let db = self.ctx.db.lock().await;
        let entries = db.list_files(&filters)?;
        serde_json::to_value(&entries)
            .map_err(|e| RagError::database(format!("serialization: {e}")))
    }

    pub async fn handle_cleanup_expired(&self) -> Result<serde_json::Value, RagError> {
        let now = Utc::now();
        let mut db = self.ctx.db.lock().await;
        let deleted = db.cleanup_expired(now)?;

        Ok(json!({
            "deletedCount": deleted,
            "timestamp": to_db_time(now),
        }))
    }

    pub async fn handle_status(&self) -> Result<serde_json::Value, RagError> {
        let db = self.ctx.db.lock().await;
        let status = db.status()?;
        serde_json::to_value(&status)
            .map_err(|e| RagError::database(format!("serialization: {e}")))
    }

    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, RagError> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        self.ctx.embedder.embed_batch(&texts).await
    }

    /// Transactional replace of one source.
    ///
    /// Snapshots the existing rows (best-effort: a brand-new source has no
    /// prior version, and a failed snapshot only forfeits rollback), then
    /// deletes and inserts under a single store lock. If the insert fails,
    /// the snapshot is reinserted; if that also fails, a composite error
    /// names both causes.
    async fn replace_source(
        &self,
        file_path: &str,
        chunks: Vec<Chunk>,
        vectors: Vec<Vec<f32>>,
        mut metadata: ChunkMetadata,
        now: DateTime<Utc>,
        preserve_created_at: bool,
    ) -> Result<usize, RagError> {
        let mut db = self.ctx.db.lock().await;

        let backup = match db.rows_for_path(file_path) {
            Ok(rows) => rows,
            Err(e) => {
                log::warn!("Backup snapshot failed for {file_path}: {e}");
                Vec::new()
            }
        };

        if preserve_created_at {
            if let Some(prior) = backup.first() {
                metadata.created_at = prior.metadata.created_at;
            }
        }

        let new_rows: Vec<NewChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| NewChunk {
                file_path: file_path.to_string(),
                chunk_index: chunk.index,
                text: chunk.text,
                vector,
                timestamp: now,
                metadata: metadata.clone(),
            })
            .collect();

        db.delete(file_path)?;
        if let Err(insert_err) = db.insert(&new_rows) {
            if backup.is_empty() {
                return Err(insert_err);
            }
            let restored: Vec<NewChunk> = backup.into_iter().map(ChunkRow::into_new).collect();
            if let Err(rollback_err) = db.insert(&restored) {
                return Err(RagError::Rollback {
                    insert: insert_err.to_string(),
                    rollback: rollback_err.to_string(),
                });
            }
            return Err(insert_err);
        }

        Ok(new_rows.len())
    }
}

fn resolve_project(project: Option<String>, global: Option<bool>) -> Option<String> {
    // A global memory carries no project even when one is supplied.
    if global == Some(true) {
        None
    } else {
        project
    }
}

/// Snippet kinds accepted by `memorize_text` (a snippet is never a file).
fn parse_snippet_type(value: Option<&str>) -> Result<MemoryType, RagError> {
    match value {
        None => Ok(MemoryType::Memory),
        Some("memory") => Ok(MemoryType::Memory),
        Some("lesson") => Ok(MemoryType::Lesson),
        Some("note") => Ok(MemoryType::Note),
        Some(other) => Err(RagError::validation(format!(
            "invalid type {other:?}: expected memory|lesson|note"
        ))),
    }
}

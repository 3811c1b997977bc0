//! Vector store over SQLite: `sqlite-vec` holds the dense vectors, FTS5
//! provides the BM25 lexical index, and a plain `chunks` table carries the
//! row data and metadata.
use std::collections::HashSet;
use std::path::Path;
use std::sync::Once;
use std::time::Instant;

use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use tracing::{info, warn};

pub mod documents;
pub mod models;
pub mod search;

use crate::error::RagError;
use models::{ChunkMetadata, NewChunk, SearchTuning, StoreStatus};

/// Metadata columns added after the first released schema. A table missing
/// any of them is migrated on open.
const METADATA_COLUMNS: &[&str] = &["created_at", "updated_at", "memory_type", "tags"];

static INIT_VEC: Once = Once::new();

/// Initialize the sqlite-vec extension. Safe to call multiple times.
fn init_sqlite_vec() {
    INIT_VEC.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// The persisted chunk store.
#[derive(Debug)]
pub struct Db {
    pub(crate) conn: Connection,
    dimensions: usize,
    tuning: SearchTuning,
    fts_enabled: bool,
    opened_at: Instant,
}

impl Db {
    /// Open (or create) the store at the given database file path and run
    /// schema checks, migration, and index setup.
    pub fn open<P: AsRef<Path>>(
        path: P,
        dimensions: usize,
        tuning: SearchTuning,
    ) -> Result<Self, RagError> {
        let path = path.as_ref();
        info!("Opening vector store: {}", path.display());

        init_sqlite_vec();
        let conn = Connection::open(path).map_err(RagError::database)?;
        Self::from_connection(conn, dimensions, tuning)
    }

    /// Open an in-memory store (used by tests).
    pub fn open_in_memory(dimensions: usize, tuning: SearchTuning) -> Result<Self, RagError> {
        init_sqlite_vec();
        let conn = Connection::open_in_memory().map_err(RagError::database)?;
        Self::from_connection(conn, dimensions, tuning)
    }

    fn from_connection(
        conn: Connection,
        dimensions: usize,
        tuning: SearchTuning,
    ) -> Result<Self, RagError> {
        let vec_version: String = conn
            .query_row("SELECT vec_version()", [], |row| row.get(0))
            .map_err(RagError::database)?;
        info!("sqlite-vec version: {vec_version}");

        let mut db = Self {
            conn,
            dimensions,
            tuning,
            fts_enabled: false,
            opened_at: Instant::now(),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Schema lifecycle: refuse a foreign vector dimension, migrate a
    /// legacy table, create missing tables, and ensure the lexical index.
    fn initialize(&mut self) -> Result<(), RagError> {
        if self.table_exists("vec_chunks")? {
            let stored = self.stored_vector_dimension()?;
            if stored != self.dimensions {
                return Err(RagError::database(format!(
                    "existing store holds {stored}-dimensional vectors but this build expects {}; \
                     refusing to open (re-ingest into a fresh data directory instead)",
                    self.dimensions
                )));
            }
        }

        if self.table_exists("chunks")? {
            let columns = self.table_columns("chunks")?;
            let missing: Vec<&str> = METADATA_COLUMNS
                .iter()
                .filter(|c| !columns.contains(**c))
                .copied()
                .collect();
            if !missing.is_empty() {
                info!(?missing, "Legacy schema detected, migrating");
                self.migrate_legacy(&columns)?;
            }
        } else {
            self.ensure_tables()?;
        }

        // The lexical index is an optimization: losing it degrades search
        // to vector-only, it never blocks startup.
        match self.ensure_fts() {
            Ok(()) => {
                self.fts_enabled = true;
                // Rows may predate the index (fresh install over migrated
                // data); bring it up to date once.
                self.rebuild_fts();
            }
            Err(e) => {
                warn!("Full-text index unavailable, hybrid search disabled: {e}");
                self.fts_enabled = false;
            }
        }

        Ok(())
    }

    /// Create the chunk and vector tables if absent. Called from open and
    /// again on first insert (migration of an empty legacy table drops the
    /// tables without recreating them).
    pub(crate) fn ensure_tables(&self) -> Result<(), RagError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_path TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                file_name TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                file_type TEXT NOT NULL,
                language TEXT,
                memory_type TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                project TEXT,
                expires_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_file_path ON chunks(file_path);
            CREATE INDEX IF NOT EXISTS idx_chunks_expires_at ON chunks(expires_at);

            CREATE VIRTUAL TABLE IF NOT EXISTS vec_chunks USING vec0(
                embedding FLOAT[{dim}]
            );
            "#,
            dim = self.dimensions
        );
        self.conn.execute_batch(&ddl).map_err(RagError::database)
    }

    /// Migrate a legacy `chunks` table: read every row, synthesize the
    /// missing metadata fields, drop, recreate, reinsert. An empty table is
    /// just dropped; the next insert recreates it.
    fn migrate_legacy(&mut self, columns: &HashSet<String>) -> Result<(), RagError> {
        let rows = self.read_legacy_rows(columns)?;

        self.conn
            .execute_batch("DROP TABLE IF EXISTS chunks_fts; DROP TABLE chunks; DROP TABLE IF EXISTS vec_chunks;")
            .map_err(RagError::database)?;

        if rows.is_empty() {
            info!("Migrated empty legacy table (dropped; recreated on next insert)");
            return Ok(());
        }

        self.ensure_tables()?;
        self.insert(&rows)?;
        info!(rows = rows.len(), "Schema migration complete");
        Ok(())
    }

    /// Read all rows of a legacy table, defaulting fields the old schema
    /// lacked: `created_at`/`updated_at` fall back to the row timestamp,
    /// `tags` to the empty list, `memory_type` to null.
    fn read_legacy_rows(&self, columns: &HashSet<String>) -> Result<Vec<NewChunk>, RagError> {
        let select = |col: &str, fallback: &str| -> String {
            if columns.contains(col) {
                col.to_string()
            } else {
                format!("{fallback} AS {col}")
            }
        };

        let sql = format!(
            "SELECT c.file_path, c.chunk_index, c.content, c.timestamp,
                    c.file_name, c.file_size, c.file_type, {language},
                    {memory_type}, {tags}, {project}, {expires_at},
                    {created_at}, {updated_at}, v.embedding
             FROM chunks c
             JOIN vec_chunks v ON v.rowid = c.id
             ORDER BY c.file_path, c.chunk_index",
            language = select("language", "NULL"),
            memory_type = select("memory_type", "NULL"),
            tags = select("tags", "'[]'"),
            project = select("project", "NULL"),
            expires_at = select("expires_at", "NULL"),
            created_at = select("created_at", "c.timestamp"),
            updated_at = select("updated_at", "c.timestamp"),
        );

        let mut stmt = self.conn.prepare(&sql).map_err(RagError::database)?;
        let mapped = stmt
            .query_map([], |row| {
                let timestamp: String = row.get(3)?;
                let tags_json: String = row.get(9)?;
                let embedding: Vec<u8> = row.get(14)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    timestamp,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    tags_json,
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, Option<String>>(11)?,
                    row.get::<_, String>(12)?,
                    row.get::<_, String>(13)?,
                    embedding,
                ))
            })
            .map_err(RagError::database)?;

        let mut rows = Vec::new();
        for item in mapped {
            let (
                file_path,
                chunk_index,
                content,
                timestamp,
                file_name,
                file_size,
                file_type,
                language,
                memory_type,
                tags_json,
                project,
                expires_at,
                created_at,
                updated_at,
                embedding,
            ) = item.map_err(RagError::database)?;

            let memory_type = match memory_type.as_deref() {
                Some(s) => Some(models::MemoryType::parse(s)?),
                None => None,
            };
            let tags: Vec<String> = serde_json::from_str(&tags_json)
                .map_err(|e| RagError::database(format!("bad tags column: {e}")))?;

            rows.push(NewChunk {
                file_path,
                chunk_index: chunk_index as usize,
                text: content,
                vector: deserialize_vector(&embedding),
                timestamp: models::from_db_time(&timestamp)?,
                metadata: ChunkMetadata {
                    file_name,
                    file_size: file_size as u64,
                    file_type,
                    language,
                    memory_type,
                    tags,
                    project,
                    expires_at: expires_at.as_deref().map(models::from_db_time).transpose()?,
                    created_at: models::from_db_time(&created_at)?,
                    updated_at: models::from_db_time(&updated_at)?,
                },
            });
        }
        Ok(rows)
    }

    /// Create the FTS5 index over chunk text if it does not exist.
    fn ensure_fts(&self) -> Result<(), RagError> {
        self.conn
            .execute_batch(
                "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                     content, content='chunks', content_rowid='id'
                 );",
            )
            .map_err(RagError::database)
    }

    /// Request a rebuild of the lexical index. Best-effort: the dense path
    /// does not depend on it, so failure is logged and swallowed.
    pub(crate) fn rebuild_fts(&self) {
        if !self.fts_enabled {
            return;
        }
        if let Err(e) = self
            .conn
            .execute("INSERT INTO chunks_fts(chunks_fts) VALUES('rebuild')", [])
        {
            warn!("Full-text index rebuild failed: {e}");
        }
    }

    #[must_use]
    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled
    }

    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub(crate) fn tuning(&self) -> &SearchTuning {
        &self.tuning
    }

    /// Store health: source/row counts, resident memory, uptime, index and
    /// search-mode flags.
    pub fn status(&self) -> Result<StoreStatus, RagError> {
        let (document_count, chunk_count) = if self.table_exists("chunks")? {
            self.conn
                .query_row(
                    "SELECT COUNT(DISTINCT file_path), COUNT(*) FROM chunks",
                    [],
                    |row| Ok((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)? as usize)),
                )
                .map_err(RagError::database)?
        } else {
            (0, 0)
        };

        let hybrid = self.fts_enabled && self.tuning.hybrid_weight > 0.0;
        Ok(StoreStatus {
            document_count,
            chunk_count,
            memory_usage: resident_memory_bytes(),
            uptime: self.opened_at.elapsed().as_secs(),
            fts_index_enabled: self.fts_enabled,
            search_mode: if hybrid { "hybrid" } else { "vector-only" },
        })
    }

    pub(crate) fn table_exists(&self, name: &str) -> Result<bool, RagError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?",
                [name],
                |row| row.get(0),
            )
            .map_err(RagError::database)?;
        Ok(count > 0)
    }

    fn table_columns(&self, name: &str) -> Result<HashSet<String>, RagError> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({name})"))
            .map_err(RagError::database)?;
        let cols = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(RagError::database)?
            .collect::<Result<HashSet<_>, _>>()
            .map_err(RagError::database)?;
        Ok(cols)
    }

    /// Vector dimension declared by the persisted `vec_chunks` table.
    fn stored_vector_dimension(&self) -> Result<usize, RagError> {
        let sql: String = self
            .conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type='table' AND name='vec_chunks'",
                [],
                |row| row.get(0),
            )
            .map_err(RagError::database)?;

        parse_vec_dimension(&sql).ok_or_else(|| {
            RagError::database(format!("cannot determine vector dimension from: {sql}"))
        })
    }
}

/// Extract `N` from a declaration containing `FLOAT[N]`.
fn parse_vec_dimension(sql: &str) -> Option<usize> {
    let upper = sql.to_uppercase();
    let start = upper.find("FLOAT[")? + "FLOAT[".len();
    let end = upper[start..].find(']')? + start;
    sql[start..end].trim().parse().ok()
}

/// Serialize a float32 vector into bytes for the vec0 virtual table.
pub(crate) fn serialize_vector(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Inverse of [`serialize_vector`].
pub(crate) fn deserialize_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Resident set size of this process, in bytes. Zero when unavailable.
fn resident_memory_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(pages) = statm.split_whitespace().nth(1) {
                if let Ok(pages) = pages.parse::<u64>() {
                    return pages * 4096;
                }
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Db {
        Db::open_in_memory(4, SearchTuning::default()).unwrap()
    }

    #[test]
    fn test_open_creates_schema() {
        let db = test_db();
        assert!(db.table_exists("chunks").unwrap());
        assert!(db.table_exists("vec_chunks").unwrap());
        assert!(db.fts_enabled());
    }

    #[test]
    fn test_vector_round_trip() {
        let v = vec![1.0f32, -2.5, 0.0, 3.25];
        assert_eq!(deserialize_vector(&serialize_vector(&v)), v);
    }

    #[test]
    fn test_serialize_vector_little_endian() {
        let bytes = serialize_vector(&[1.0, 2.0, -3.5]);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x80, 0x3f]);
        assert_eq!(&bytes[4..8], &[0x00, 0x00, 0x00, 0x40]);
        assert_eq!(&bytes[8..12], &[0x00, 0x00, 0x60, 0xc0]);
    }

    #[test]
    fn test_parse_vec_dimension() {
        assert_eq!(
            parse_vec_dimension("CREATE VIRTUAL TABLE vec_chunks USING vec0(embedding FLOAT[384])"),
            Some(384)
        );
        assert_eq!(
            parse_vec_dimension("... embedding float[4] ..."),
            Some(4)
        );
        assert_eq!(parse_vec_dimension("no dimension here"), None);
    }

    #[test]
    fn test_dimension_mismatch_refused() {
        // Build a store with 4-dim vectors, then reopen expecting 8.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let _db = Db::open(&path, 4, SearchTuning::default()).unwrap();
        }

        let err = Db::open(&path, 8, SearchTuning::default()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("4-dimensional"), "got: {msg}");
        assert!(msg.contains("refusing to open"), "got: {msg}");
    }

    #[test]
    fn test_status_empty_store() {
        let db = test_db();
        let status = db.status().unwrap();
        assert_eq!(status.document_count, 0);
        assert_eq!(status.chunk_count, 0);
        assert!(status.fts_index_enabled);
        assert_eq!(status.search_mode, "hybrid");
    }

    #[test]
    fn test_vector_only_mode_with_zero_weight() {
        let tuning = SearchTuning {
            hybrid_weight: 0.0,
            ..SearchTuning::default()
        };
        let db = Db::open_in_memory(4, tuning).unwrap();
        assert_eq!(db.status().unwrap().search_mode, "vector-only");
    }
}

/// Chunk-row CRUD: insert, delete, per-source reads, listing, expiry sweep.
use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::debug;

use super::models::{
    from_db_time, to_db_time, ChunkMetadata, ChunkRow, FileEntry, ListFilters, MemoryType,
    NewChunk, SourceType,
};
use super::{deserialize_vector, serialize_vector, Db};
use crate::error::{is_not_found_message, RagError};
use crate::parser::MEMORY_SCHEME;

impl Db {
    /// Insert chunk rows. Creates the tables on first use (the migration of
    /// an empty legacy store leaves none behind). All rows go in one
    /// transaction; any failure rolls the statement batch back.
    pub fn insert(&mut self, chunks: &[NewChunk]) -> Result<(), RagError> {
        if chunks.is_empty() {
            return Ok(());
        }
        self.ensure_tables()?;

        for chunk in chunks {
            if chunk.vector.len() != self.dimensions() {
                return Err(RagError::database(format!(
                    "vector dimension mismatch: got {}, expected {}",
                    chunk.vector.len(),
                    self.dimensions()
                )));
            }
        }

        let tx = self.conn.transaction().map_err(RagError::database)?;
        for chunk in chunks {
            let m = &chunk.metadata;
            let tags_json = serde_json::to_string(&m.tags)
                .map_err(|e| RagError::database(format!("tags serialization: {e}")))?;

            tx.execute(
                "INSERT INTO chunks (
                     file_path, chunk_index, content, timestamp,
                     file_name, file_size, file_type, language,
                     memory_type, tags, project, expires_at,
                     created_at, updated_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    chunk.file_path,
                    chunk.chunk_index as i64,
                    chunk.text,
                    to_db_time(chunk.timestamp),
                    m.file_name,
                    m.file_size as i64,
                    m.file_type,
                    m.language,
                    m.memory_type.map(MemoryType::as_str),
                    tags_json,
                    m.project,
                    m.expires_at.map(to_db_time),
                    to_db_time(m.created_at),
                    to_db_time(m.updated_at),
                ],
            )
            .map_err(RagError::database)?;

            let chunk_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO vec_chunks (rowid, embedding) VALUES (?, ?)",
                params![chunk_id, serialize_vector(&chunk.vector)],
            )
            .map_err(RagError::database)?;
        }
        tx.commit().map_err(RagError::database)?;

        self.rebuild_fts();
        Ok(())
    }

    /// Delete every row of a source. Missing rows are not an error
    /// (idempotent delete contract).
    pub fn delete(&mut self, file_path: &str) -> Result<(), RagError> {
        if !self.table_exists("chunks")? {
            return Ok(());
        }

        let result = (|| -> Result<(), rusqlite::Error> {
            let tx = self.conn.transaction()?;
            tx.execute(
                "DELETE FROM vec_chunks WHERE rowid IN (SELECT id FROM chunks WHERE file_path = ?)",
                params![file_path],
            )?;
            let removed = tx.execute("DELETE FROM chunks WHERE file_path = ?", params![file_path])?;
            tx.commit()?;
            debug!(file_path, removed, "Deleted source rows");
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.rebuild_fts();
                Ok(())
            }
            Err(e) if is_not_found_message(&e.to_string()) => Ok(()),
            Err(e) => Err(RagError::database(e)),
        }
    }

    /// All rows of a source ordered by chunk index, vectors included.
    /// This doubles as the replace-time backup snapshot.
    pub fn rows_for_path(&self, file_path: &str) -> Result<Vec<ChunkRow>, RagError> {
        if !self.table_exists("chunks")? {
            return Ok(Vec::new());
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.id, c.file_path, c.chunk_index, c.content, c.timestamp,
                        c.file_name, c.file_size, c.file_type, c.language,
                        c.memory_type, c.tags, c.project, c.expires_at,
                        c.created_at, c.updated_at, v.embedding
                 FROM chunks c
                 JOIN vec_chunks v ON v.rowid = c.id
                 WHERE c.file_path = ?
                 ORDER BY c.chunk_index ASC",
            )
            .map_err(RagError::database)?;

        let mapped = stmt
            .query_map(params![file_path], row_to_parts)
            .map_err(RagError::database)?;

        let mut rows = Vec::new();
        for part in mapped {
            rows.push(parts_to_chunk_row(part.map_err(RagError::database)?)?);
        }
        Ok(rows)
    }

    /// All rows of the snippet source `memory://<label>`.
    pub fn get_by_label(&self, label: &str) -> Result<Vec<ChunkRow>, RagError> {
        self.rows_for_path(&format!("{MEMORY_SCHEME}{label}"))
    }

    /// Group rows by source, reporting chunk count, latest timestamp, and
    /// the metadata of the most recent write.
    pub fn list_files(&self, filters: &ListFilters) -> Result<Vec<FileEntry>, RagError> {
        if !self.table_exists("chunks")? {
            return Ok(Vec::new());
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT file_path, COUNT(*) AS chunk_count, MAX(timestamp) AS ts
                 FROM chunks GROUP BY file_path ORDER BY ts DESC",
            )
            .map_err(RagError::database)?;
        let groups = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? as usize,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(RagError::database)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(RagError::database)?;

        let mut entries = Vec::new();
        for (file_path, chunk_count, ts) in groups {
            let metadata = self.latest_metadata(&file_path)?;
            let entry = FileEntry {
                file_path,
                chunk_count,
                timestamp: from_db_time(&ts)?,
                metadata,
            };
            if entry_matches(&entry, filters) {
                entries.push(entry);
            }
            if filters.limit > 0 && entries.len() == filters.limit {
                break;
            }
        }
        Ok(entries)
    }

    /// Delete every source whose expiry instant lies strictly before `now`.
    /// Returns the number of distinct sources removed.
    pub fn cleanup_expired(&mut self, now: DateTime<Utc>) -> Result<usize, RagError> {
        if !self.table_exists("chunks")? {
            return Ok(0);
        }

        let expired: Vec<String> = {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT DISTINCT file_path FROM chunks
                     WHERE expires_at IS NOT NULL AND expires_at < ?",
                )
                .map_err(RagError::database)?;
            let rows = stmt
                .query_map(params![to_db_time(now)], |row| row.get(0))
                .map_err(RagError::database)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(RagError::database)?;
            rows
        };

        for path in &expired {
            self.delete(path)?;
        }
        Ok(expired.len())
    }

    /// Metadata of the most recent write for a source. Every row of one
    /// version shares it, so any latest row serves.
    fn latest_metadata(&self, file_path: &str) -> Result<ChunkMetadata, RagError> {
        let parts = self
            .conn
            .query_row(
                "SELECT c.id, c.file_path, c.chunk_index, c.content, c.timestamp,
                        c.file_name, c.file_size, c.file_type, c.language,
                        c.memory_type, c.tags, c.project, c.expires_at,
                        c.created_at, c.updated_at, NULL
                 FROM chunks c
                 WHERE c.file_path = ?
                 ORDER BY c.updated_at DESC, c.id DESC LIMIT 1",
                params![file_path],
                row_to_parts,
            )
            .map_err(RagError::database)?;
        Ok(parts_to_chunk_row(parts)?.metadata)
    }
}

type RowParts = (
    i64,
    String,
    i64,
    String,
    String,
    String,
    i64,
    String,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    Option<Vec<u8>>,
);

fn row_to_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<RowParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
    ))
}

fn parts_to_chunk_row(parts: RowParts) -> Result<ChunkRow, RagError> {
    let (
        id,
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
    ) = parts;

    let memory_type = match memory_type.as_deref() {
        Some(s) => Some(MemoryType::parse(s)?),
        None => None,
    };
    let tags: Vec<String> = serde_json::from_str(&tags_json)
        .map_err(|e| RagError::database(format!("bad tags column: {e}")))?;

    Ok(ChunkRow {
        id,
        file_path,
        chunk_index: chunk_index as usize,
        text: content,
        vector: embedding.as_deref().map(deserialize_vector).unwrap_or_default(),
        timestamp: from_db_time(&timestamp)?,
        metadata: ChunkMetadata {
            file_name,
            file_size: file_size as u64,
            file_type,
            language,
            memory_type,
            tags,
            project,
            expires_at: expires_at.as_deref().map(from_db_time).transpose()?,
            created_at: from_db_time(&created_at)?,
            updated_at: from_db_time(&updated_at)?,
        },
    })
}

fn entry_matches(entry: &FileEntry, filters: &ListFilters) -> bool {
    match filters.source_type {
        SourceType::All => {}
        SourceType::Memory => {
            if !entry.file_path.starts_with(MEMORY_SCHEME) {
                return false;
            }
        }
        SourceType::File => {
            if entry.file_path.starts_with(MEMORY_SCHEME) {
                return false;
            }
        }
    }

    if !filters
        .tags
        .iter()
        .all(|t| entry.metadata.tags.iter().any(|have| have == t))
    {
        return false;
    }

    if let Some(project) = &filters.project {
        if entry.metadata.project.as_deref() != Some(project.as_str()) {
            return false;
        }
    }

    if let Some(needle) = &filters.search {
        let needle = needle.to_lowercase();
        let path_hit = entry.file_path.to_lowercase().contains(&needle);
        let name_hit = entry.metadata.file_name.to_lowercase().contains(&needle);
        if !path_hit && !name_hit {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::SearchTuning;
    use chrono::Duration;

    fn test_db() -> Db {
        Db::open_in_memory(4, SearchTuning::default()).unwrap()
    }

    fn meta(tags: &[&str]) -> ChunkMetadata {
        let now = Utc::now();
        ChunkMetadata {
            file_name: "note".to_string(),
            file_size: 42,
            file_type: "text-snippet".to_string(),
            language: None,
            memory_type: Some(MemoryType::Memory),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            project: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn chunk(path: &str, index: usize, text: &str, tags: &[&str]) -> NewChunk {
        NewChunk {
            file_path: path.to_string(),
            chunk_index: index,
            text: text.to_string(),
            vector: vec![0.1, 0.2, 0.3, 0.4],
            timestamp: Utc::now(),
            metadata: meta(tags),
        }
    }

    #[test]
    fn test_insert_and_read_back() {
        let mut db = test_db();
        db.insert(&[
            chunk("memory://a", 0, "first chunk text", &["x"]),
            chunk("memory://a", 1, "second chunk text", &["x"]),
        ])
        .unwrap();

        let rows = db.get_by_label("a").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].chunk_index, 0);
        assert_eq!(rows[1].chunk_index, 1);
        assert_eq!(rows[0].text, "first chunk text");
        assert_eq!(rows[0].vector, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(rows[0].metadata.tags, vec!["x"]);
    }

    #[test]
    fn test_insert_rejects_dimension_mismatch() {
        let mut db = test_db();
        let mut bad = chunk("memory://a", 0, "text", &[]);
        bad.vector = vec![0.1, 0.2];

        let err = db.insert(&[bad]).unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
        assert_eq!(db.status().unwrap().chunk_count, 0);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut db = test_db();
        db.insert(&[chunk("memory://a", 0, "text", &[])]).unwrap();

        db.delete("memory://a").unwrap();
        assert!(db.get_by_label("a").unwrap().is_empty());

        // Second delete of a missing source still succeeds.
        db.delete("memory://a").unwrap();
        db.delete("memory://never-existed").unwrap();
    }

    #[test]
    fn test_list_files_groups_and_counts() {
        let mut db = test_db();
        db.insert(&[
            chunk("memory://a", 0, "a0", &["x"]),
            chunk("memory://a", 1, "a1", &["x"]),
            chunk("/srv/docs/b.md", 0, "b0", &["y"]),
        ])
        .unwrap();

        let entries = db.list_files(&ListFilters::default()).unwrap();
        assert_eq!(entries.len(), 2);
        let a = entries.iter().find(|e| e.file_path == "memory://a").unwrap();
        assert_eq!(a.chunk_count, 2);
    }

    #[test]
    fn test_list_files_tag_and_type_filters() {
        let mut db = test_db();
        db.insert(&[
            chunk("memory://ab", 0, "t", &["a", "b"]),
            chunk("memory://ac", 0, "t", &["a", "c"]),
            chunk("/srv/docs/bc.md", 0, "t", &["b", "c"]),
        ])
        .unwrap();

        // AND semantics: only the source carrying both tags matches.
        let both = db
            .list_files(&ListFilters {
                tags: vec!["a".to_string(), "b".to_string()],
                ..ListFilters::default()
            })
            .unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].file_path, "memory://ab");

        let memories = db
            .list_files(&ListFilters {
                source_type: SourceType::Memory,
                ..ListFilters::default()
            })
            .unwrap();
        assert_eq!(memories.len(), 2);

        let files = db
            .list_files(&ListFilters {
                source_type: SourceType::File,
                ..ListFilters::default()
            })
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_path, "/srv/docs/bc.md");
    }

    #[test]
    fn test_list_files_search_and_limit() {
        let mut db = test_db();
        db.insert(&[
            chunk("memory://alpha", 0, "t", &[]),
            chunk("memory://beta", 0, "t", &[]),
            chunk("memory://gamma", 0, "t", &[]),
        ])
        .unwrap();

        let hits = db
            .list_files(&ListFilters {
                search: Some("ALPHA".to_string()),
                ..ListFilters::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);

        let limited = db
            .list_files(&ListFilters {
                limit: 2,
                ..ListFilters::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 2);

        // limit 0 means unlimited
        let all = db
            .list_files(&ListFilters {
                limit: 0,
                ..ListFilters::default()
            })
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_cleanup_expired_boundary() {
        let mut db = test_db();
        let now = Utc::now();

        let mut expiring = chunk("memory://soon", 0, "t", &[]);
        expiring.metadata.expires_at = Some(now + Duration::hours(24));
        let permanent = chunk("memory://keep", 0, "t", &[]);
        db.insert(&[expiring, permanent]).unwrap();

        // Nothing is expired yet.
        assert_eq!(db.cleanup_expired(now).unwrap(), 0);

        // Strictly-before comparison: exactly at the instant is not expired.
        let at = db.get_by_label("soon").unwrap()[0]
            .metadata
            .expires_at
            .unwrap();
        assert_eq!(db.cleanup_expired(at).unwrap(), 0);

        // Past the instant, exactly the expiring source goes.
        assert_eq!(db.cleanup_expired(at + Duration::seconds(1)).unwrap(), 1);
        assert!(db.get_by_label("soon").unwrap().is_empty());
        assert_eq!(db.get_by_label("keep").unwrap().len(), 1);
    }

    #[test]
    fn test_created_at_survives_round_trip() {
        let mut db = test_db();
        let created = Utc::now() - Duration::days(7);
        let mut c = chunk("memory://old", 0, "t", &[]);
        c.metadata.created_at = created;
        db.insert(&[c]).unwrap();

        let rows = db.get_by_label("old").unwrap();
        // Millisecond column precision.
        assert_eq!(
            rows[0].metadata.created_at.timestamp_millis(),
            created.timestamp_millis()
        );
    }
}

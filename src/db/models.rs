/// Typed row structs for the vector store.
///
/// Column values convert to these types once, at the store boundary;
/// nothing downstream branches on raw column shapes.
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::config::GroupingMode;
use crate::error::RagError;

/// Classification of a stored source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    File,
    Memory,
    Lesson,
    Note,
}

impl MemoryType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Memory => "memory",
            Self::Lesson => "lesson",
            Self::Note => "note",
        }
    }

    pub fn parse(s: &str) -> Result<Self, RagError> {
        match s {
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            "lesson" => Ok(Self::Lesson),
            "note" => Ok(Self::Note),
            other => Err(RagError::validation(format!(
                "invalid memory type {other:?}: expected file|memory|lesson|note"
            ))),
        }
    }
}

/// Metadata shared by every chunk row of one source version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub language: Option<String>,
    pub memory_type: Option<MemoryType>,
    pub tags: Vec<String>,
    pub project: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A chunk row to be inserted.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub file_path: String,
    pub chunk_index: usize,
    pub text: String,
    pub vector: Vec<f32>,
    pub timestamp: DateTime<Utc>,
    pub metadata: ChunkMetadata,
}

/// A persisted chunk row read back from the store.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub id: i64,
    pub file_path: String,
    pub chunk_index: usize,
    pub text: String,
    pub vector: Vec<f32>,
    pub timestamp: DateTime<Utc>,
    pub metadata: ChunkMetadata,
}

impl ChunkRow {
    /// Strip the row id for reinsertion (rollback path).
    #[must_use]
    pub fn into_new(self) -> NewChunk {
        NewChunk {
            file_path: self.file_path,
            chunk_index: self.chunk_index,
            text: self.text,
            vector: self.vector,
            timestamp: self.timestamp,
            metadata: self.metadata,
        }
    }
}

/// Source-kind filter for search and listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceType {
    #[default]
    All,
    File,
    Memory,
}

impl SourceType {
    pub fn parse(s: &str) -> Result<Self, RagError> {
        match s {
            "all" => Ok(Self::All),
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(RagError::validation(format!(
                "invalid type {other:?}: expected all|file|memory"
            ))),
        }
    }
}

/// Options for a single search call.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Raw query text for the lexical path; `None` disables it.
    pub query_text: Option<String>,
    /// Maximum results to return.
    pub limit: usize,
    pub source_type: SourceType,
    /// AND-semantics: a row must carry every requested tag.
    pub tags: Vec<String>,
    pub project: Option<String>,
    /// Keep rows whose distance score is at most this (lower = closer).
    pub min_score: Option<f32>,
}

/// One search result row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub file_path: String,
    pub chunk_index: usize,
    pub text: String,
    /// Distance-like score: `1 − fused`, lower is more similar.
    pub score: f32,
}

/// Filters for source listing.
#[derive(Debug, Clone)]
pub struct ListFilters {
    pub source_type: SourceType,
    pub tags: Vec<String>,
    pub project: Option<String>,
    /// Case-insensitive substring match on path or file name.
    pub search: Option<String>,
    /// Maximum entries; 0 means unlimited.
    pub limit: usize,
}

impl Default for ListFilters {
    fn default() -> Self {
        Self {
            source_type: SourceType::All,
            tags: Vec::new(),
            project: None,
            search: None,
            limit: 50,
        }
    }
}

/// One source in a listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub file_path: String,
    pub chunk_count: usize,
    pub timestamp: DateTime<Utc>,
    pub metadata: ChunkMetadata,
}

/// Store health snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    pub document_count: usize,
    pub chunk_count: usize,
    /// Approximate resident set size in bytes.
    pub memory_usage: u64,
    /// Seconds since the store was opened.
    pub uptime: u64,
    pub fts_index_enabled: bool,
    pub search_mode: &'static str,
}

/// Search behavior knobs fixed at store construction.
#[derive(Debug, Clone)]
pub struct SearchTuning {
    /// Lexical blend weight in [0, 1]; 0 disables the lexical path.
    pub hybrid_weight: f32,
    /// Optional global distance cutoff.
    pub max_distance: Option<f32>,
    /// Optional statistical result trimming.
    pub grouping: Option<GroupingMode>,
}

impl Default for SearchTuning {
    fn default() -> Self {
        Self {
            hybrid_weight: 0.6,
            max_distance: None,
            grouping: None,
        }
    }
}

/// Store instants as fixed-width RFC 3339 UTC so text comparison in SQL
/// agrees with chronological order.
#[must_use]
pub fn to_db_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn from_db_time(s: &str) -> Result<DateTime<Utc>, RagError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RagError::database(format!("bad timestamp {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_type_round_trip() {
        for t in [
            MemoryType::File,
            MemoryType::Memory,
            MemoryType::Lesson,
            MemoryType::Note,
        ] {
            assert_eq!(MemoryType::parse(t.as_str()).unwrap(), t);
        }
        assert!(MemoryType::parse("folder").is_err());
    }

    #[test]
    fn test_db_time_round_trip_and_ordering() {
        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(5);

        let a = to_db_time(early);
        let b = to_db_time(late);
        assert!(a < b, "text order must match chronological order");
        assert_eq!(from_db_time(&a).unwrap(), from_db_time(&a).unwrap());
    }

    #[test]
    fn test_metadata_serializes_camel_case() {
        let meta = ChunkMetadata {
            file_name: "a.md".to_string(),
            file_size: 10,
            file_type: "md".to_string(),
            language: None,
            memory_type: Some(MemoryType::File),
            tags: vec!["x".to_string()],
            project: None,
            expires_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("fileName").is_some());
        assert!(json.get("memoryType").is_some());
        assert_eq!(json["memoryType"], "file");
    }
}

/// Hybrid search: dense cosine candidates fused with BM25 lexical
/// candidates, metadata filtering, and statistical result-group trimming.
use std::collections::HashMap;

use rusqlite::params;
use tracing::warn;

use super::models::{SearchHit, SearchOptions, SourceType};
use super::{serialize_vector, Db};
use crate::config::GroupingMode;
use crate::error::RagError;
use crate::parser::MEMORY_SCHEME;

/// Hard cap on returned results.
pub const MAX_SEARCH_LIMIT: usize = 20;

/// Over-fetch factor per retrieval path in hybrid mode.
const HYBRID_FETCH_FACTOR: usize = 4;
/// Over-fetch factor in dense-only mode.
const DENSE_FETCH_FACTOR: usize = 3;

/// A fused candidate prior to filtering.
struct Candidate {
    text: String,
    tags: Vec<String>,
    project: Option<String>,
    fused: f32,
}

impl Db {
    /// Search the store. `query_vector` drives the dense path; when the
    /// lexical index is live, `opts.query_text` is non-empty, and the
    /// configured hybrid weight is non-zero, a BM25 retrieval contributes
    /// to the fused ranking as well.
    pub fn search(
        &self,
        query_vector: &[f32],
        opts: &SearchOptions,
    ) -> Result<Vec<SearchHit>, RagError> {
        if !self.table_exists("chunks")? {
            return Ok(Vec::new());
        }
        if query_vector.len() != self.dimensions() {
            return Err(RagError::database(format!(
                "query vector dimension mismatch: got {}, expected {}",
                query_vector.len(),
                self.dimensions()
            )));
        }

        let limit = opts.limit.clamp(1, MAX_SEARCH_LIMIT);
        let weight = self.tuning().hybrid_weight;
        let query_text = opts
            .query_text
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty());
        let hybrid = self.fts_enabled() && weight > 0.0 && query_text.is_some();

        let mut candidates: HashMap<(String, usize), Candidate> = HashMap::new();

        if hybrid {
            let fetch = limit * HYBRID_FETCH_FACTOR;
            self.collect_dense(query_vector, fetch, 1.0 - weight, &mut candidates)?;
            if let Some(q) = query_text {
                self.collect_lexical(q, fetch, weight, &mut candidates)?;
            }
        } else {
            // Pure dense ranking: the lexical term is absent, so the dense
            // similarity carries full weight.
            let fetch = limit * DENSE_FETCH_FACTOR;
            self.collect_dense(query_vector, fetch, 1.0, &mut candidates)?;
        }

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .filter(|((file_path, _), c)| {
                candidate_matches(file_path, &c.tags, c.project.as_deref(), opts)
            })
            .map(|((file_path, chunk_index), c)| SearchHit {
                file_path,
                chunk_index,
                text: c.text,
                score: 1.0 - c.fused,
            })
            .collect();

        // Ascending distance-like score; ties broken on the row key so
        // results are deterministic.
        hits.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.file_path.cmp(&b.file_path))
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });

        let mut hits = apply_score_cutoffs(hits, opts.min_score, self.tuning().max_distance);

        if let Some(mode) = self.tuning().grouping {
            let keep = grouping_cutoff(&scores_of(&hits), mode);
            hits.truncate(keep);
        }

        hits.truncate(limit);
        Ok(hits)
    }

    /// Dense top-K under cosine distance; each candidate contributes
    /// `max(0, 1 − d/2) × weight` to its fused score.
    fn collect_dense(
        &self,
        query_vector: &[f32],
        fetch: usize,
        weight: f32,
        candidates: &mut HashMap<(String, usize), Candidate>,
    ) -> Result<(), RagError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.file_path, c.chunk_index, c.content, c.tags, c.project,
                        vec_distance_cosine(v.embedding, ?) AS distance
                 FROM vec_chunks v
                 JOIN chunks c ON v.rowid = c.id
                 ORDER BY distance ASC
                 LIMIT ?",
            )
            .map_err(RagError::database)?;

        let rows = stmt
            .query_map(
                params![serialize_vector(query_vector), fetch as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)? as usize,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, f64>(5)?,
                    ))
                },
            )
            .map_err(RagError::database)?;

        for row in rows {
            let (file_path, chunk_index, text, tags_json, project, distance) =
                row.map_err(RagError::database)?;
            let similarity = (1.0 - (distance as f32) / 2.0).max(0.0);
            let entry = candidates
                .entry((file_path, chunk_index))
                .or_insert_with(|| Candidate {
                    text,
                    tags: parse_tags(&tags_json),
                    project,
                    fused: 0.0,
                });
            entry.fused += similarity * weight;
        }
        Ok(())
    }

    /// Lexical top-K under BM25; the candidate at rank `i` of `n`
    /// contributes `(1 − i/n) × weight`.
    fn collect_lexical(
        &self,
        query_text: &str,
        fetch: usize,
        weight: f32,
        candidates: &mut HashMap<(String, usize), Candidate>,
    ) -> Result<(), RagError> {
        let Some(match_expr) = fts_match_expr(query_text) else {
            return Ok(());
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.file_path, c.chunk_index, c.content, c.tags, c.project
                 FROM chunks_fts
                 JOIN chunks c ON c.id = chunks_fts.rowid
                 WHERE chunks_fts MATCH ?
                 ORDER BY rank
                 LIMIT ?",
            )
            .map_err(RagError::database)?;

        let rows = match stmt.query_map(params![match_expr, fetch as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? as usize,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        }) {
            Ok(rows) => rows.collect::<Result<Vec<_>, _>>(),
            Err(e) => Err(e),
        };

        // A malformed MATCH or stale index must not kill the query; the
        // dense path already produced candidates.
        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Lexical retrieval failed, using dense results only: {e}");
                return Ok(());
            }
        };

        let n = rows.len();
        for (i, (file_path, chunk_index, text, tags_json, project)) in rows.into_iter().enumerate()
        {
            let contribution = (1.0 - (i as f32) / (n as f32)) * weight;
            let entry = candidates
                .entry((file_path, chunk_index))
                .or_insert_with(|| Candidate {
                    text,
                    tags: parse_tags(&tags_json),
                    project,
                    fused: 0.0,
                });
            entry.fused += contribution;
        }
        Ok(())
    }
}

fn parse_tags(tags_json: &str) -> Vec<String> {
    serde_json::from_str(tags_json).unwrap_or_default()
}

/// Build an FTS5 MATCH expression from free text: alphanumeric tokens,
/// quoted, OR-joined. Returns `None` when no tokens survive.
fn fts_match_expr(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

fn candidate_matches(
    file_path: &str,
    tags: &[String],
    project: Option<&str>,
    opts: &SearchOptions,
) -> bool {
    match opts.source_type {
        SourceType::All => {}
        SourceType::Memory => {
            if !file_path.starts_with(MEMORY_SCHEME) {
                return false;
            }
        }
        SourceType::File => {
            if file_path.starts_with(MEMORY_SCHEME) {
                return false;
            }
        }
    }

    if !opts.tags.iter().all(|t| tags.iter().any(|have| have == t)) {
        return false;
    }

    if let Some(wanted) = &opts.project {
        if project != Some(wanted.as_str()) {
            return false;
        }
    }

    true
}

/// Keep hits whose distance score is at most the threshold(s). Lower is
/// more similar, so both cutoffs apply identically.
fn apply_score_cutoffs(
    hits: Vec<SearchHit>,
    min_score: Option<f32>,
    max_distance: Option<f32>,
) -> Vec<SearchHit> {
    hits.into_iter()
        .filter(|h| min_score.is_none_or(|t| h.score <= t))
        .filter(|h| max_distance.is_none_or(|t| h.score <= t))
        .collect()
}

/// Sorted distance scores of the hit list.
fn scores_of(hits: &[SearchHit]) -> Vec<f32> {
    hits.iter().map(|h| h.score).collect()
}

/// Statistical tail trimming over an ascending distance list.
///
/// Gaps between consecutive scores are compared to `μ + 1.5σ` (population
/// standard deviation); indices after an outlier gap are "boundaries".
/// `Similar` keeps only the tightest cluster (cut at the first boundary);
/// `Related` cuts at the second boundary, or keeps all when fewer than two
/// exist. Returns how many leading results to keep.
fn grouping_cutoff(scores: &[f32], mode: GroupingMode) -> usize {
    let n = scores.len();
    if n <= 1 {
        return n;
    }

    let gaps: Vec<f32> = scores.windows(2).map(|w| w[1] - w[0]).collect();
    let mean = gaps.iter().sum::<f32>() / gaps.len() as f32;
    let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f32>() / gaps.len() as f32;
    let threshold = mean + 1.5 * variance.sqrt();

    let boundaries: Vec<usize> = gaps
        .iter()
        .enumerate()
        .filter(|(_, g)| **g > threshold)
        .map(|(i, _)| i + 1)
        .collect();

    match mode {
        GroupingMode::Similar => boundaries.first().copied().unwrap_or(n),
        GroupingMode::Related => {
            if boundaries.len() >= 2 {
                boundaries[1]
            } else {
                n
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ChunkMetadata, MemoryType, NewChunk, SearchTuning};
    use chrono::Utc;

    fn meta(tags: &[&str], project: Option<&str>) -> ChunkMetadata {
        let now = Utc::now();
        ChunkMetadata {
            file_name: "note".to_string(),
            file_size: 1,
            file_type: "text-snippet".to_string(),
            language: None,
            memory_type: Some(MemoryType::Memory),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            project: project.map(str::to_string),
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn chunk(path: &str, text: &str, vector: Vec<f32>, tags: &[&str]) -> NewChunk {
        NewChunk {
            file_path: path.to_string(),
            chunk_index: 0,
            text: text.to_string(),
            vector,
            timestamp: Utc::now(),
            metadata: meta(tags, None),
        }
    }

    fn dense_only_db() -> Db {
        let tuning = SearchTuning {
            hybrid_weight: 0.0,
            ..SearchTuning::default()
        };
        Db::open_in_memory(4, tuning).unwrap()
    }

    fn opts(limit: usize) -> SearchOptions {
        SearchOptions {
            limit,
            ..SearchOptions::default()
        }
    }

    #[test]
    fn test_dense_ranking_by_distance() {
        let mut db = dense_only_db();
        db.insert(&[
            chunk("memory://near", "close to the query", vec![1.0, 0.0, 0.0, 0.0], &[]),
            chunk("memory://far", "orthogonal content", vec![0.0, 1.0, 0.0, 0.0], &[]),
        ])
        .unwrap();

        let hits = db.search(&[1.0, 0.0, 0.0, 0.0], &opts(10)).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].file_path, "memory://near");
        // Identical unit vector: distance 0, fused 1, score 0.
        assert!(hits[0].score.abs() < 1e-5);
        // Orthogonal: distance 1, similarity 0.5, score 0.5.
        assert!((hits[1].score - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_hybrid_lexical_contribution() {
        // weight 0.6, FTS live: a keyword match must outrank a closer
        // vector with no keyword overlap when the query text matches it.
        let mut db = Db::open_in_memory(4, SearchTuning::default()).unwrap();
        db.insert(&[
            chunk(
                "memory://lexical",
                "rust borrow checker rules explained",
                vec![0.0, 1.0, 0.0, 0.0],
                &[],
            ),
            chunk(
                "memory://densest",
                "unrelated prose about gardening",
                vec![1.0, 0.0, 0.0, 0.0],
                &[],
            ),
        ])
        .unwrap();

        let mut o = opts(10);
        o.query_text = Some("borrow checker".to_string());
        let hits = db.search(&[1.0, 0.0, 0.0, 0.0], &o).unwrap();

        assert_eq!(hits.len(), 2);
        // lexical: fused = 0.5*0.4 (orthogonal dense) + 1.0*0.6 = 0.8
        // densest: fused = 1.0*0.4 = 0.4
        assert_eq!(hits[0].file_path, "memory://lexical");
        assert!((hits[0].score - 0.2).abs() < 1e-4, "got {}", hits[0].score);
        assert!((hits[1].score - 0.6).abs() < 1e-4, "got {}", hits[1].score);
    }

    #[test]
    fn test_type_filter() {
        let mut db = dense_only_db();
        db.insert(&[
            chunk("memory://m", "snippet", vec![1.0, 0.0, 0.0, 0.0], &[]),
            chunk("/srv/docs/f.md", "file", vec![1.0, 0.0, 0.0, 0.0], &[]),
        ])
        .unwrap();

        let mut o = opts(10);
        o.source_type = SourceType::Memory;
        let hits = db.search(&[1.0, 0.0, 0.0, 0.0], &o).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "memory://m");

        o.source_type = SourceType::File;
        let hits = db.search(&[1.0, 0.0, 0.0, 0.0], &o).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "/srv/docs/f.md");
    }

    #[test]
    fn test_tags_and_semantics() {
        let mut db = dense_only_db();
        db.insert(&[
            chunk("memory://ab", "t", vec![1.0, 0.0, 0.0, 0.0], &["a", "b"]),
            chunk("memory://a", "t", vec![1.0, 0.0, 0.0, 0.0], &["a"]),
        ])
        .unwrap();

        let mut o = opts(10);
        o.tags = vec!["a".to_string(), "b".to_string()];
        let hits = db.search(&[1.0, 0.0, 0.0, 0.0], &o).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "memory://ab");
    }

    #[test]
    fn test_min_score_boundaries() {
        let mut db = dense_only_db();
        db.insert(&[
            chunk("memory://exact", "t", vec![1.0, 0.0, 0.0, 0.0], &[]),
            chunk("memory://other", "t", vec![0.0, 1.0, 0.0, 0.0], &[]),
        ])
        .unwrap();

        // minScore 0 admits only exact-distance-0 rows.
        let mut o = opts(10);
        o.min_score = Some(0.0);
        let hits = db.search(&[1.0, 0.0, 0.0, 0.0], &o).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "memory://exact");

        // minScore 2 admits everything.
        o.min_score = Some(2.0);
        let hits = db.search(&[1.0, 0.0, 0.0, 0.0], &o).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_limit_truncation() {
        let mut db = dense_only_db();
        let rows: Vec<NewChunk> = (0..8)
            .map(|i| {
                let mut c = chunk(
                    &format!("memory://s{i}"),
                    "t",
                    vec![1.0, 0.0, 0.0, 0.0],
                    &[],
                );
                c.chunk_index = 0;
                c
            })
            .collect();
        db.insert(&rows).unwrap();

        let hits = db.search(&[1.0, 0.0, 0.0, 0.0], &opts(3)).unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_grouping_cutoff_similar_and_related() {
        let scores = [0.10, 0.12, 0.13, 0.55, 0.58];
        assert_eq!(grouping_cutoff(&scores, GroupingMode::Similar), 3);
        // Only one boundary exists, so related keeps everything.
        assert_eq!(grouping_cutoff(&scores, GroupingMode::Related), 5);
    }

    #[test]
    fn test_grouping_cutoff_no_outlier_gaps() {
        let scores = [0.10, 0.20, 0.30, 0.40];
        assert_eq!(grouping_cutoff(&scores, GroupingMode::Similar), 4);
        assert_eq!(grouping_cutoff(&scores, GroupingMode::Related), 4);
    }

    #[test]
    fn test_grouping_cutoff_degenerate() {
        assert_eq!(grouping_cutoff(&[], GroupingMode::Similar), 0);
        assert_eq!(grouping_cutoff(&[0.3], GroupingMode::Similar), 1);
    }

    #[test]
    fn test_grouping_cutoff_two_boundaries_related() {
        // Three clusters separated by two outlier gaps; related keeps the
        // first two clusters, similar only the first.
        let scores = [
            0.10, 0.11, 0.12, 0.13, 0.63, 0.64, 0.65, 0.66, 1.16, 1.17, 1.18,
        ];
        assert_eq!(grouping_cutoff(&scores, GroupingMode::Similar), 4);
        assert_eq!(grouping_cutoff(&scores, GroupingMode::Related), 8);
    }

    #[test]
    fn test_fts_match_expr() {
        assert_eq!(
            fts_match_expr("REST API").as_deref(),
            Some("\"REST\" OR \"API\"")
        );
        assert_eq!(
            fts_match_expr("quote\"and;semi").as_deref(),
            Some("\"quote\" OR \"and\" OR \"semi\"")
        );
        assert_eq!(fts_match_expr("  ?!  "), None);
    }

    #[test]
    fn test_search_empty_store() {
        let db = dense_only_db();
        let hits = db.search(&[1.0, 0.0, 0.0, 0.0], &opts(5)).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_query_vector_dimension_checked() {
        let db = dense_only_db();
        let err = db.search(&[1.0, 0.0], &opts(5)).unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
    }
}

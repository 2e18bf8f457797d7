//! Composite ranking of vector hits.
//!
//! ```text
//! score = 1.00 * cosine
//!       + 0.15 * recency      exp(-age / 7 days), 0 if never indexed
//!       + 0.10 * same_file    1 - 1 / (1 + other hits in the file)
//!       - 0.10 * length       ((lines - 60) / 60)^2, clamped to [0, 1]
//!       - 0.05 * depth        min(depth, 10) / 10
//! ```
//!
//! Ties fall through cosine, then `filePath`, then `chunkId`. When any
//! signal is missing or not finite the whole list is ranked by cosine
//! alone with the same tie-break chain.

use std::cmp::Ordering;
use std::collections::HashMap;

use sqlx::Row;
use tracing::{debug, warn};

use crate::db::WorkspaceStore;
use crate::error::StoreResult;
use crate::models::{RankedHit, VectorHit};

const W_COSINE: f64 = 1.0;
const W_RECENCY: f64 = 0.15;
const W_SAME_FILE: f64 = 0.10;
const W_LENGTH: f64 = 0.10;
const W_DEPTH: f64 = 0.05;

const IDEAL_LINES: f64 = 60.0;
const MAX_DEPTH: usize = 10;
const RECENCY_TAU_MS: f64 = 7.0 * 24.0 * 60.0 * 60.0 * 1000.0;

/// Stored metadata for one hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSignal {
    pub start_line: i64,
    pub end_line: i64,
    pub last_indexed_time: Option<i64>,
}

/// Signals keyed by `chunkId`.
pub type Signals = HashMap<String, ChunkSignal>;

pub async fn load_signals(store: &WorkspaceStore, hits: &[VectorHit]) -> StoreResult<Signals> {
    let mut signals = Signals::with_capacity(hits.len());
    for hit in hits {
        let row = sqlx::query(
            r#"
            SELECT c.startLine, c.endLine, f.lastIndexedTime
            FROM chunks c
            LEFT JOIN files f ON f.workspaceId = c.workspaceId AND f.path = c.filePath
            WHERE c.workspaceId = ? AND c.filePath = ? AND c.chunkId = ?
            "#,
        )
        .bind(store.workspace_id())
        .bind(&hit.file_path)
        .bind(&hit.chunk_id)
        .fetch_optional(store.pool())
        .await?;
        if let Some(row) = row {
            signals.insert(
                hit.chunk_id.clone(),
                ChunkSignal {
                    start_line: row.try_get("startLine")?,
                    end_line: row.try_get("endLine")?,
                    last_indexed_time: row.try_get("lastIndexedTime")?,
                },
            );
        }
    }
    Ok(signals)
}

pub fn length_penalty(lines: i64) -> f64 {
    let x = (lines as f64 - IDEAL_LINES) / IDEAL_LINES;
    (x * x).clamp(0.0, 1.0)
}

/// Segments below the root folder, not counting the file itself.
pub fn path_depth(file_path: &str) -> usize {
    file_path.split('/').count().saturating_sub(2)
}

pub fn depth_penalty(file_path: &str) -> f64 {
    path_depth(file_path).min(MAX_DEPTH) as f64 / MAX_DEPTH as f64
}

pub fn recency_boost(last_indexed_time: Option<i64>, now: i64) -> f64 {
    match last_indexed_time {
        Some(t) => {
            let age = (now - t).max(0) as f64;
            (-age / RECENCY_TAU_MS).exp()
        }
        None => 0.0,
    }
}

pub fn same_file_boost(others_in_file: usize) -> f64 {
    1.0 - 1.0 / (1.0 + others_in_file as f64)
}

fn composite(hit: &VectorHit, signal: &ChunkSignal, others: usize, now: i64) -> f64 {
    let lines = signal.end_line - signal.start_line + 1;
    W_COSINE * hit.similarity as f64 + W_RECENCY * recency_boost(signal.last_indexed_time, now)
        + W_SAME_FILE * same_file_boost(others)
        - W_LENGTH * length_penalty(lines)
        - W_DEPTH * depth_penalty(&hit.file_path)
}

fn compare(a: &RankedHit, b: &RankedHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.similarity.total_cmp(&a.similarity))
        .then_with(|| a.file_path.cmp(&b.file_path))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Order `hits` by composite score, or by cosine if `signals` is `None`
/// or incomplete.
pub fn rank(hits: Vec<VectorHit>, signals: Option<&Signals>, now: i64) -> Vec<RankedHit> {
    let scored = signals.and_then(|signals| composite_scores(&hits, signals, now));
    if scored.is_none() && signals.is_some() {
        debug!("ranking signals incomplete; using cosine only");
    }

    let mut ranked: Vec<RankedHit> = hits
        .into_iter()
        .enumerate()
        .map(|(i, hit)| RankedHit {
            score: scored.as_ref().map_or(hit.similarity as f64, |s| s[i]),
            similarity: hit.similarity,
            file_path: hit.file_path,
            chunk_id: hit.chunk_id,
        })
        .collect();
    ranked.sort_by(compare);
    ranked
}

fn composite_scores(hits: &[VectorHit], signals: &Signals, now: i64) -> Option<Vec<f64>> {
    let mut per_file: HashMap<&str, usize> = HashMap::new();
    for hit in hits {
        *per_file.entry(hit.file_path.as_str()).or_default() += 1;
    }

    let mut scores = Vec::with_capacity(hits.len());
    for hit in hits {
        let signal = signals.get(&hit.chunk_id)?;
        let others = per_file.get(hit.file_path.as_str()).copied().unwrap_or(1) - 1;
        let score = composite(hit, signal, others, now);
        if !score.is_finite() {
            return None;
        }
        scores.push(score);
    }
    Some(scores)
}

/// Load signals and rank; a load failure degrades to cosine-only.
pub async fn rank_with_store(store: &WorkspaceStore, hits: Vec<VectorHit>, now: i64) -> Vec<RankedHit> {
    match load_signals(store, &hits).await {
        Ok(signals) => rank(hits, Some(&signals), now),
        Err(err) => {
            warn!("ranking signals unavailable, using cosine only: {}", err);
            rank(hits, None, now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn hit(file: &str, chunk: &str, similarity: f32) -> VectorHit {
        VectorHit {
            file_path: file.to_string(),
            chunk_id: chunk.to_string(),
            similarity,
        }
    }

    fn signal(lines: i64, indexed: Option<i64>) -> ChunkSignal {
        ChunkSignal {
            start_line: 1,
            end_line: lines,
            last_indexed_time: indexed,
        }
    }

    #[test]
    fn test_signal_shapes() {
        assert_eq!(length_penalty(60), 0.0);
        assert_eq!(length_penalty(120), 1.0);
        assert_eq!(length_penalty(500), 1.0);
        assert!((length_penalty(30) - 0.25).abs() < 1e-12);

        assert_eq!(path_depth("root/a.rs"), 0);
        assert_eq!(path_depth("root/src/x/y.rs"), 2);
        assert_eq!(depth_penalty("r/1/2/3/4/5/6/7/8/9/10/11/12/f.rs"), 1.0);

        assert_eq!(recency_boost(None, NOW), 0.0);
        assert_eq!(recency_boost(Some(NOW), NOW), 1.0);
        assert_eq!(recency_boost(Some(NOW + 5_000), NOW), 1.0);
        assert!(recency_boost(Some(NOW - 86_400_000), NOW) > recency_boost(Some(NOW - 10 * 86_400_000), NOW));

        assert_eq!(same_file_boost(0), 0.0);
        assert_eq!(same_file_boost(1), 0.5);
    }

    #[test]
    fn test_equal_scores_tie_break_regardless_of_input_order() {
        let hits = vec![
            hit("r/b.rs", "r/b.rs:1-60", 0.5),
            hit("r/a.rs", "r/a.rs:61-120", 0.5),
            hit("r/a.rs", "r/a.rs:1-60", 0.5),
            hit("r/c.rs", "r/c.rs:1-60", 0.5),
        ];
        let expected = vec!["r/a.rs:1-60", "r/a.rs:61-120", "r/b.rs:1-60", "r/c.rs:1-60"];

        let mut reversed = hits.clone();
        reversed.reverse();
        for input in [hits, reversed] {
            let ids: Vec<String> = rank(input, None, NOW).into_iter().map(|h| h.chunk_id).collect();
            assert_eq!(ids, expected);
        }
    }

    #[test]
    fn test_composite_prefers_fresh_well_sized_chunks() {
        let hits = vec![hit("r/old.rs", "r/old.rs:1-200", 0.80), hit("r/new.rs", "r/new.rs:1-60", 0.78)];
        let mut signals = Signals::new();
        signals.insert("r/old.rs:1-200".to_string(), signal(200, None));
        signals.insert("r/new.rs:1-60".to_string(), signal(60, Some(NOW)));

        let ranked = rank(hits.clone(), Some(&signals), NOW);
        assert_eq!(ranked[0].file_path, "r/new.rs");
        assert!((ranked[0].score - (0.78f32 as f64 + 0.15)).abs() < 1e-9);

        // Without signals cosine decides.
        let plain = rank(hits, None, NOW);
        assert_eq!(plain[0].file_path, "r/old.rs");
    }

    #[test]
    fn test_same_file_hits_boost_each_other() {
        let hits = vec![
            hit("r/x.rs", "r/x.rs:1-60", 0.70),
            hit("r/x.rs", "r/x.rs:41-100", 0.70),
            hit("r/y.rs", "r/y.rs:1-60", 0.74),
        ];
        let signals: Signals = hits
            .iter()
            .map(|h| (h.chunk_id.clone(), signal(60, None)))
            .collect();
        let ranked = rank(hits, Some(&signals), NOW);
        assert_eq!(ranked[0].file_path, "r/x.rs");
        assert_eq!(ranked[2].file_path, "r/y.rs");
    }

    #[test]
    fn test_missing_signal_degrades_to_cosine() {
        let hits = vec![hit("r/a.rs", "r/a.rs:1-60", 0.6), hit("r/b.rs", "r/b.rs:1-60", 0.9)];
        let mut signals = Signals::new();
        signals.insert("r/a.rs:1-60".to_string(), signal(60, Some(NOW)));

        let ranked = rank(hits, Some(&signals), NOW);
        assert_eq!(ranked[0].file_path, "r/b.rs");
        assert_eq!(ranked[0].score, 0.9f32 as f64);
    }

    #[test]
    fn test_cosine_breaks_composite_ties() {
        let ranked_hit = |file: &str, similarity: f32| RankedHit {
            file_path: file.to_string(),
            chunk_id: format!("{}:1-60", file),
            similarity,
            score: 0.7,
        };
        let mut ranked = vec![ranked_hit("r/a.rs", 0.5), ranked_hit("r/b.rs", 0.75)];
        ranked.sort_by(compare);
        assert_eq!(ranked[0].file_path, "r/b.rs");
    }
}

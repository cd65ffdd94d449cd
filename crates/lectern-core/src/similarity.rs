//! Cosine similarity and exact top-K ranking over chunk records.
//!
//! Ranking is a linear scan; it is meant for stores holding thousands of chunks,
//! not millions.

use tracing::{debug, warn};

use crate::record::ChunkRecord;

/// Number of results returned when the caller does not ask for a specific count.
pub const DEFAULT_TOP_K: usize = 3;

/// A record paired with its similarity to a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored<'a> {
    pub record: &'a ChunkRecord,
    pub score: f64,
}

/// Cosine similarity in `[-1, 1]`. Vectors of different length are a usage fault:
/// it is logged and `0.0` is returned. A zero-norm vector scores `0.0` against anything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    match try_cosine_similarity(a, b) {
        Ok(score) => score,
        Err(e) => {
            warn!("{}", e);
            0.0
        }
    }
}

/// Like [`cosine_similarity`] but reports a length mismatch to the caller.
pub fn try_cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64, DimensionMismatch> {
    if a.len() != b.len() {
        return Err(DimensionMismatch {
            expected: a.len(),
            found: b.len(),
        });
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let score = dot / (norm_a.sqrt() * norm_b.sqrt());
    // zero norms and non-finite inputs both land here
    if !score.is_finite() {
        return Ok(0.0);
    }
    Ok(score.clamp(-1.0, 1.0))
}

/// Ranks `records` by similarity to `query`, best first, keeping at most `top_k`.
///
/// Records whose embedding length differs from the query, or that hold non-finite
/// values, are skipped. Equal scores keep their input order. An empty or non-finite query yields no results.
pub fn rank_by_query<'a, I>(query: &[f32], records: I, top_k: usize) -> Vec<Scored<'a>>
where
    I: IntoIterator<Item = &'a ChunkRecord>,
{
    if query.is_empty() || top_k == 0 {
        return Vec::new();
    }
    if query.iter().any(|x| !x.is_finite()) {
        warn!("query embedding contains non-finite values; returning no results");
        return Vec::new();
    }

    let mut skipped = 0usize;
    let mut scored: Vec<Scored<'a>> = records
        .into_iter()
        .filter_map(|record| match try_cosine_similarity(query, &record.embedding) {
            Ok(_) if record.embedding.iter().any(|x| !x.is_finite()) => {
                skipped += 1;
                None
            }
            Ok(score) => Some(Scored { record, score }),
            Err(_) => {
                skipped += 1;
                None
            }
        })
        .collect();
    if skipped > 0 {
        debug!(
            "skipped {} record(s) with a non-finite embedding or a length other than the query's ({})",
            skipped,
            query.len()
        );
    }

    // sort_by is stable, so ties stay in insertion order
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(top_k);
    scored
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("embedding length mismatch: expected {expected}, found {found}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub found: usize,
}

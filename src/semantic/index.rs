//! Exhaustive cosine similarity ranking.
//!
//! Every candidate is scored against the query (O(n·D) per query). Callers
//! go through [`SimilarityMatcher`] so an approximate index can replace the
//! scan without touching them.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;

use crate::documents::Document;
use crate::semantic::storage::EmbeddingRecord;

/// A ranked candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub entity_id: String,
    /// Cosine similarity in [-1.0, 1.0]
    pub score: f32,
    pub snapshot: Document,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("Cannot rank against a zero-norm query vector")]
    DegenerateQuery,
}

pub type Candidates<'a> = Box<dyn Iterator<Item = EmbeddingRecord> + Send + 'a>;

pub trait SimilarityMatcher: Send + Sync {
    /// Rank `candidates` against `query`, best first, keeping at most `k`.
    ///
    /// Candidates whose dimensionality differs from the query or whose norm
    /// is zero are left out. Equal scores keep their input order.
    fn top_k(
        &self,
        query: &[f32],
        candidates: Candidates<'_>,
        k: usize,
    ) -> Result<Vec<Match>, MatchError>;
}

/// Brute-force matcher; scoring is spread over the rayon pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExhaustiveMatcher;

impl SimilarityMatcher for ExhaustiveMatcher {
    fn top_k(
        &self,
        query: &[f32],
        candidates: Candidates<'_>,
        k: usize,
    ) -> Result<Vec<Match>, MatchError> {
        if k == 0 {
            return Ok(vec![]);
        }

        let query_norm = l2_norm(query);
        if query_norm == 0.0 || !query_norm.is_finite() {
            return Err(MatchError::DegenerateQuery);
        }

        let candidates: Vec<EmbeddingRecord> = candidates.collect();

        // par_iter + collect keeps input order, which the stable sort below
        // relies on for tie breaking
        let mut results: Vec<Match> = candidates
            .into_par_iter()
            .filter_map(|record| {
                let score = score_against(query, query_norm, &record.vector)?;
                Some(Match {
                    entity_id: record.entity_id,
                    score,
                    snapshot: record.snapshot,
                    generated_at: record.generated_at,
                })
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        results.truncate(k);

        Ok(results)
    }
}

/// Compute L2 norm of a vector.
///
/// Accumulates in f64 so squares of large f32 components cannot overflow.
pub fn l2_norm(v: &[f32]) -> f64 {
    v.iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt()
}

/// Cosine similarity of two vectors, or `None` when they differ in length
/// or either has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    let a_norm = l2_norm(a);
    if a_norm == 0.0 || !a_norm.is_finite() {
        return None;
    }
    score_against(a, a_norm, b)
}

/// Assumes query_norm is precomputed, finite and non-zero.
fn score_against(query: &[f32], query_norm: f64, target: &[f32]) -> Option<f32> {
    if target.len() != query.len() {
        return None;
    }

    let target_norm = l2_norm(target);
    if target_norm == 0.0 || !target_norm.is_finite() {
        return None;
    }

    let dot_product: f64 = query
        .iter()
        .zip(target.iter())
        .map(|(&a, &b)| f64::from(a) * f64::from(b))
        .sum();
    let score = dot_product / (query_norm * target_norm);

    // rounding can push parallel vectors a hair past 1.0
    score
        .is_finite()
        .then(|| score.clamp(-1.0, 1.0) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            entity_id: id.to_string(),
            vector,
            generated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            model: String::new(),
            snapshot: Document::new(),
        }
    }

    fn rank(query: &[f32], candidates: Vec<EmbeddingRecord>, k: usize) -> Result<Vec<Match>, MatchError> {
        ExhaustiveMatcher.top_k(query, Box::new(candidates.into_iter()), k)
    }

    fn ids(matches: &[Match]) -> Vec<&str> {
        matches.iter().map(|m| m.entity_id.as_str()).collect()
    }

    #[test]
    fn test_ranks_example_candidates() {
        let candidates = vec![
            record("A", vec![1.0, 0.0]),
            record("B", vec![0.0, 1.0]),
            record("C", vec![0.5, 0.5]),
        ];

        let results = rank(&[1.0, 0.0], candidates, 2).unwrap();

        assert_eq!(ids(&results), vec!["A", "C"]);
        assert!((results[0].score - 1.0).abs() < 1e-6);
        assert!((results[1].score - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-3);
    }

    #[test]
    fn test_k_zero_is_empty() {
        let candidates = vec![record("A", vec![1.0, 0.0])];
        assert!(rank(&[1.0, 0.0], candidates, 0).unwrap().is_empty());
        // even a degenerate query is fine when nothing is asked for
        assert!(rank(&[0.0, 0.0], vec![], 0).unwrap().is_empty());
    }

    #[test]
    fn test_zero_query_is_degenerate() {
        let candidates = vec![record("A", vec![1.0, 0.0])];
        assert!(matches!(
            rank(&[0.0, 0.0], candidates, 3),
            Err(MatchError::DegenerateQuery)
        ));
        assert!(matches!(rank(&[], vec![], 3), Err(MatchError::DegenerateQuery)));
    }

    #[test]
    fn test_excludes_mismatched_and_zero_candidates() {
        let candidates = vec![
            record("short", vec![1.0]),
            record("zero", vec![0.0, 0.0]),
            record("long", vec![1.0, 0.0, 0.0]),
            record("ok", vec![0.0, 2.0]),
        ];

        let results = rank(&[1.0, 1.0], candidates, 10).unwrap();
        assert_eq!(ids(&results), vec!["ok"]);
    }

    #[test]
    fn test_ties_keep_input_order() {
        let candidates = vec![
            record("low", vec![-1.0, 0.0]),
            record("first", vec![2.0, 0.0]),
            record("second", vec![1.0, 0.0]),
            record("third", vec![3.0, 0.0]),
        ];

        let results = rank(&[1.0, 0.0], candidates, 10).unwrap();
        assert_eq!(ids(&results), vec!["first", "second", "third", "low"]);
    }

    #[test]
    fn test_sorted_non_increasing() {
        let candidates: Vec<_> = (0..50)
            .map(|i| {
                let angle = i as f32 * 0.13;
                record(&i.to_string(), vec![angle.cos(), angle.sin(), (i % 3) as f32])
            })
            .collect();

        let results = rank(&[0.3, 0.9, 0.1], candidates, 50).unwrap();
        assert_eq!(results.len(), 50);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_truncates_to_k() {
        let candidates: Vec<_> = (0..10)
            .map(|i| record(&i.to_string(), vec![1.0, i as f32 * 0.1]))
            .collect();
        assert_eq!(rank(&[1.0, 0.0], candidates, 3).unwrap().len(), 3);
    }

    #[test]
    fn test_cosine_symmetric_and_bounded() {
        let vectors = [
            vec![1.0, 2.0, 3.0],
            vec![-0.5, 0.25, 8.0],
            vec![1e-3, -1e3, 0.0],
            vec![3.0, 3.0, 3.0],
            vec![-1.0, -2.0, -3.0],
        ];

        for a in &vectors {
            for b in &vectors {
                let ab = cosine_similarity(a, b).unwrap();
                let ba = cosine_similarity(b, a).unwrap();
                assert_eq!(ab, ba);
                assert!((-1.0..=1.0).contains(&ab));
            }
        }
        assert!((cosine_similarity(&vectors[0], &vectors[4]).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_large_components_score_as_parallel() {
        let candidates = vec![
            record("mid", vec![1.0, 1.0]),
            record("big", vec![1e20, 0.0]),
            record("huge", vec![f32::MAX, f32::MAX]),
        ];

        let results = rank(&[1.0, 0.0], candidates, 3).unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].entity_id, "big");
        assert!((results[0].score - 1.0).abs() < 1e-6);
        for m in &results[1..] {
            assert!((m.score - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        }
    }

    #[test]
    fn test_tiny_vectors_are_not_degenerate() {
        let candidates = vec![record("A", vec![1.0, 0.0]), record("tiny", vec![0.0, 1e-30])];

        let results = rank(&[1e-8, 0.0], candidates, 2).unwrap();

        assert_eq!(ids(&results), vec!["A", "tiny"]);
        assert!((results[0].score - 1.0).abs() < 1e-6);
        assert_eq!(results[1].score, 0.0);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), None);
    }
}

//! Scoring primitives for the retrieval pipeline.
//!
//! Pure functions only: cosine similarity, recency decay, frequency and
//! usefulness curves, and weighted Reciprocal Rank Fusion. Everything here is
//! deterministic and suspension-free so fusion can run on a compute pool.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Cosine similarity between two vectors.
///
/// Returns 0.0 when either vector has zero norm or the lengths differ.
#[inline]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 {
        dot / denominator
    } else {
        0.0
    }
}

/// Exponential recency decay.
///
/// `exp(-decay_rate * (1 - 0.5*importance) * days_since)`. Importance 1.0
/// halves the effective decay rate; absent importance is baseline.
pub fn recency(
    created_at: DateTime<Utc>,
    decay_rate: f64,
    importance: Option<f64>,
    now: DateTime<Utc>,
) -> f64 {
    let days_since = (now - created_at).num_seconds().max(0) as f64 / 86_400.0;
    let importance = importance.unwrap_or(0.0).clamp(0.0, 1.0);
    let effective_rate = decay_rate * (1.0 - 0.5 * importance);
    (-effective_rate * days_since).exp()
}

/// Log-normalized access frequency: `log(1+n) / log(1+n_max)`.
///
/// Returns 0.0 when `n_max <= 0`.
pub fn frequency(n: i64, n_max: i64) -> f64 {
    if n_max <= 0 {
        return 0.0;
    }
    let n = n.max(0) as f64;
    ((1.0 + n).ln() / (1.0 + n_max as f64).ln()).clamp(0.0, 1.0)
}

/// Usefulness curve: `min(1, log(1+u) / log(1+5))`, saturating at five
/// useful marks. Zero when `u <= 0`.
pub fn usefulness(u: i64) -> f64 {
    if u <= 0 {
        return 0.0;
    }
    ((1.0 + u as f64).ln() / 6.0_f64.ln()).min(1.0)
}

/// One ranked input list for fusion: ids best-first, with a list weight.
#[derive(Debug, Clone)]
pub struct RankedList {
    pub weight: f64,
    /// Ids in rank order, rank 0 = best
    pub ids: Vec<String>,
}

impl RankedList {
    pub fn new(weight: f64, ids: Vec<String>) -> Self {
        Self { weight, ids }
    }
}

/// Weighted Reciprocal Rank Fusion.
///
/// Each list contributes `weight / (k + 1 + rank)` to every id it contains,
/// rank being the 0-based position. A single-element list with weight 1 and
/// k=60 therefore scores that element 1/61.
pub fn reciprocal_rank_fusion(lists: &[RankedList], k: f64) -> HashMap<String, f64> {
    let mut scores: HashMap<String, f64> = HashMap::new();

    for list in lists {
        for (rank, id) in list.ids.iter().enumerate() {
            *scores.entry(id.clone()).or_default() += list.weight / (k + 1.0 + rank as f64);
        }
    }

    scores
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_cosine_symmetric() {
        let a = vec![0.3, -0.1, 0.9];
        let b = vec![0.5, 0.5, 0.1];
        assert!((cosine(&a, &b) - cosine(&b, &a)).abs() < 1e-7);
    }

    #[test]
    fn test_cosine_unit_self_similarity() {
        let v = vec![0.6, 0.8];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_norm() {
        let zero = vec![0.0, 0.0, 0.0];
        let v = vec![1.0, 2.0, 3.0];
        assert_eq!(cosine(&zero, &v), 0.0);
        assert_eq!(cosine(&v, &zero), 0.0);
    }

    #[test]
    fn test_cosine_length_mismatch() {
        assert_eq!(cosine(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_recency_fresh_memory_is_one() {
        let now = Utc::now();
        let score = recency(now, 0.05, None, now);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_recency_importance_halves_decay() {
        let now = Utc::now();
        let created = now - Duration::days(30);

        let baseline = recency(created, 0.05, None, now);
        let pinned = recency(created, 0.05, Some(1.0), now);

        // Pinned decays at half the rate, so its score is the square root
        // of the baseline score.
        assert!((pinned - baseline.sqrt()).abs() < 1e-9);
        assert!(pinned > baseline);
    }

    #[test]
    fn test_frequency_zero_max() {
        assert_eq!(frequency(5, 0), 0.0);
        assert_eq!(frequency(5, -1), 0.0);
    }

    #[test]
    fn test_frequency_at_max_is_one() {
        assert!((frequency(9, 9) - 1.0).abs() < 1e-9);
        assert!(frequency(3, 9) < 1.0);
        assert!(frequency(3, 9) > 0.0);
    }

    #[test]
    fn test_usefulness_saturates_at_five() {
        assert_eq!(usefulness(0), 0.0);
        assert_eq!(usefulness(-2), 0.0);
        assert!((usefulness(5) - 1.0).abs() < 1e-9);
        assert_eq!(usefulness(50), 1.0);
        assert!(usefulness(2) < usefulness(4));
    }

    #[test]
    fn test_rrf_single_list_single_item() {
        let lists = vec![RankedList::new(1.0, vec!["x".to_string()])];
        let scores = reciprocal_rank_fusion(&lists, 60.0);
        assert!((scores["x"] - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_rrf_two_lists_ordering() {
        // vector list [a, b] with weight 0.45, lexical list [b, c] with 0.25
        let lists = vec![
            RankedList::new(0.45, vec!["a".into(), "b".into()]),
            RankedList::new(0.25, vec!["b".into(), "c".into()]),
        ];
        let scores = reciprocal_rank_fusion(&lists, 60.0);

        assert!((scores["a"] - 0.45 / 61.0).abs() < 1e-12);
        assert!((scores["b"] - (0.45 / 62.0 + 0.25 / 61.0)).abs() < 1e-12);
        assert!((scores["c"] - 0.25 / 62.0).abs() < 1e-12);

        // b appears in both lists and outranks a
        assert!(scores["b"] > scores["a"]);
        assert!(scores["a"] > scores["c"]);
    }

    #[test]
    fn test_rrf_empty_lists() {
        let scores = reciprocal_rank_fusion(&[], 60.0);
        assert!(scores.is_empty());
    }
}

//! Rank fusion and rerank blending.
//!
//! Reciprocal Rank Fusion over any number of candidate lists:
//! `rrf(d) = Σ_i 1 / (k + rank_i(d))` with 1-based ranks and `k = 60`
//! (the value from Cormack, Clarke & Buettcher, SIGIR 2009). A document
//! absent from a list contributes nothing for that list, so fusion is
//! invariant to list order.
//!
//! Cross-encoder scores blend with min-max-normalized RRF:
//! `final(d) = α · rerank(d) + (1-α) · rrf_norm(d)`, `α = 0.7`.
//! Ties break by earlier RRF rank, then key ascending.

use std::collections::HashMap;

pub const RRF_K: f64 = 60.0;
pub const RERANK_ALPHA: f64 = 0.7;

#[derive(Debug, Clone)]
pub struct FusedCandidate {
    pub key: String,
    pub rrf_score: f64,
    /// 1-based position in the RRF ordering.
    pub rrf_rank: usize,
}

/// Fuse ranked candidate lists. Output is sorted by RRF score descending;
/// equal scores order by key ascending.
pub fn reciprocal_rank_fusion(lists: &[Vec<String>], k: f64) -> Vec<FusedCandidate> {
    let mut scores: HashMap<&str, f64> = HashMap::new();
    for list in lists {
        for (rank0, key) in list.iter().enumerate() {
            *scores.entry(key.as_str()).or_insert(0.0) += 1.0 / (k + (rank0 + 1) as f64);
        }
    }

    let mut fused: Vec<(String, f64)> = scores
        .into_iter()
        .map(|(key, score)| (key.to_string(), score))
        .collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    fused
        .into_iter()
        .enumerate()
        .map(|(i, (key, rrf_score))| FusedCandidate {
            key,
            rrf_score,
            rrf_rank: i + 1,
        })
        .collect()
}

/// Min-max scale into `[0, 1]`. A constant input maps to all-ones.
pub fn min_max_normalize(scores: &[f64]) -> Vec<f64> {
    let min = scores.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if scores.is_empty() || (max - min).abs() < f64::EPSILON {
        return vec![1.0; scores.len()];
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

#[derive(Debug, Clone)]
pub struct BlendedCandidate {
    /// Index into the fused candidate slice passed to [`blend_rerank`].
    pub index: usize,
    pub final_score: f64,
}

/// Blend cross-encoder scores with normalized RRF and re-sort.
///
/// `rerank[i]` must correspond to `candidates[i]`. Ties in the blended
/// score break by the earlier RRF rank, then key ascending.
pub fn blend_rerank(
    candidates: &[FusedCandidate],
    rerank: &[f32],
    alpha: f64,
) -> Vec<BlendedCandidate> {
    debug_assert_eq!(candidates.len(), rerank.len());
    let rrf_norm = min_max_normalize(
        &candidates
            .iter()
            .map(|c| c.rrf_score)
            .collect::<Vec<f64>>(),
    );

    let mut blended: Vec<BlendedCandidate> = candidates
        .iter()
        .enumerate()
        .map(|(i, _)| BlendedCandidate {
            index: i,
            final_score: alpha * f64::from(rerank[i]).clamp(0.0, 1.0)
                + (1.0 - alpha) * rrf_norm[i],
        })
        .collect();

    blended.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| candidates[a.index].rrf_rank.cmp(&candidates[b.index].rrf_rank))
            .then_with(|| candidates[a.index].key.cmp(&candidates[b.index].key))
    });
    blended
}

//! Reciprocal Rank Fusion of dense and lexical retrieval.
//!
//! `score(c) = Σ 1/(rank_i(c) + k_rrf)` over the lists containing `c`,
//! ranks 1-based. Fused scores are rescaled so the top result is 1.0,
//! keeping downstream consumers (reranker fallback, confidence) on a
//! common [0,1] scale.

use std::collections::HashMap;

/// Fuse two ranked lists of `(chunk_id, score)`.
///
/// If one list is empty the other's ranking is used unchanged (rescaled).
/// Ties in fused score break toward the higher original dense score, then
/// lexicographically by chunk id so the result is total.
pub fn rrf_fuse(
    dense: &[(String, f32)],
    lexical: &[(String, f32)],
    k_rrf: usize,
    k_fused: usize,
) -> Vec<(String, f32)> {
    let mut fused: HashMap<&str, f32> = HashMap::new();
    for list in [dense, lexical] {
        for (rank, (chunk_id, _)) in list.iter().enumerate() {
            *fused.entry(chunk_id.as_str()).or_insert(0.0) += rrf_score(rank + 1, k_rrf);
        }
    }

    let dense_scores: HashMap<&str, f32> = dense
        .iter()
        .map(|(id, score)| (id.as_str(), *score))
        .collect();

    let mut ranked: Vec<(&str, f32)> = fused.into_iter().collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let da = dense_scores.get(a.0).copied().unwrap_or(f32::MIN);
                let db = dense_scores.get(b.0).copied().unwrap_or(f32::MIN);
                db.partial_cmp(&da).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.0.cmp(b.0))
    });
    ranked.truncate(k_fused);

    let top = ranked.first().map(|(_, s)| *s).unwrap_or(1.0);
    ranked
        .into_iter()
        .map(|(id, score)| (id.to_string(), if top > 0.0 { score / top } else { 0.0 }))
        .collect()
}

#[inline]
fn rrf_score(rank: usize, k_rrf: usize) -> f32 {
    1.0 / (k_rrf as f32 + rank as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(ids: &[(&str, f32)]) -> Vec<(String, f32)> {
        ids.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    #[test]
    fn chunk_in_both_lists_wins() {
        let dense = list(&[("a", 0.9), ("b", 0.8)]);
        let lexical = list(&[("b", 5.0), ("c", 4.0)]);
        let fused = rrf_fuse(&dense, &lexical, 60, 10);
        assert_eq!(fused[0].0, "b");
        assert!((fused[0].1 - 1.0).abs() < 1e-6, "top score rescaled to 1.0");
    }

    #[test]
    fn single_list_keeps_order() {
        let dense = list(&[("a", 0.9), ("b", 0.8), ("c", 0.1)]);
        let fused = rrf_fuse(&dense, &[], 60, 10);
        let order: Vec<&str> = fused.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn both_empty_is_empty() {
        assert!(rrf_fuse(&[], &[], 60, 10).is_empty());
    }

    #[test]
    fn truncates_to_k_fused() {
        let dense = list(&[("a", 0.9), ("b", 0.8), ("c", 0.7), ("d", 0.6)]);
        let lexical = list(&[("e", 3.0), ("f", 2.0)]);
        let fused = rrf_fuse(&dense, &lexical, 60, 3);
        assert_eq!(fused.len(), 3);
    }

    #[test]
    fn equal_rrf_ties_break_by_dense_score() {
        // "a" is rank 1 dense only; "e" is rank 1 lexical only: equal RRF.
        let dense = list(&[("a", 0.9)]);
        let lexical = list(&[("e", 7.0)]);
        let fused = rrf_fuse(&dense, &lexical, 60, 10);
        assert_eq!(fused[0].0, "a", "dense score breaks the tie");
    }

    #[test]
    fn rrf_formula() {
        // rank 2 dense + rank 1 lexical with k=60.
        let dense = list(&[("x", 0.9), ("b", 0.8)]);
        let lexical = list(&[("b", 5.0)]);
        let fused = rrf_fuse(&dense, &lexical, 60, 10);
        let b = fused.iter().find(|(id, _)| id == "b").unwrap();
        let x = fused.iter().find(|(id, _)| id == "x").unwrap();
        let expected_b = 1.0 / 62.0 + 1.0 / 61.0;
        let expected_x = 1.0 / 61.0;
        assert!(((b.1 / x.1) - (expected_b / expected_x)).abs() < 1e-5);
    }
}

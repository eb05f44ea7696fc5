//! Max-score fusion of sparse and dense hits across query variants

use super::Candidate;
use std::collections::BTreeMap;

/// Raw `(chunk_index, score)` hits for one query variant
#[derive(Debug, Clone, Default)]
pub struct VariantHits {
    pub sparse: Vec<(usize, f32)>,
    pub dense: Vec<(usize, f32)>,
}

/// Merge all variants into one pool, deduplicated by chunk index
///
/// A chunk's fused score is the highest score it received from any variant
/// or either index, so repetition across paraphrases never adds up. The pool
/// is returned in chunk-index order.
pub fn fuse(variants: &[VariantHits]) -> Vec<Candidate> {
    let mut pool: BTreeMap<usize, Candidate> = BTreeMap::new();

    for variant in variants {
        for &(index, score) in &variant.sparse {
            pool.entry(index)
                .and_modify(|c| c.record_sparse(score))
                .or_insert_with(|| Candidate::from_sparse(index, score));
        }
        for &(index, score) in &variant.dense {
            pool.entry(index)
                .and_modify(|c| c.record_dense(score))
                .or_insert_with(|| Candidate::from_dense(index, score));
        }
    }

    pool.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_not_sum() {
        let variants = vec![
            VariantHits {
                sparse: vec![],
                dense: vec![(7, 0.5)],
            };
            3
        ];
        let pool = fuse(&variants);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].chunk_index, 7);
        assert_eq!(pool[0].fused_score, 0.5);
    }

    #[test]
    fn test_either_signal_can_win() {
        let variants = vec![
            VariantHits {
                sparse: vec![(0, 2.3), (1, 0.1)],
                dense: vec![(1, 0.8), (2, 0.4)],
            },
            VariantHits {
                sparse: vec![],
                dense: vec![(2, 0.6)],
            },
        ];
        let pool = fuse(&variants);

        let indices: Vec<usize> = pool.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(pool[0].fused_score, 2.3);
        assert_eq!(pool[1].fused_score, 0.8);
        assert_eq!(pool[1].sparse_score, Some(0.1));
        assert_eq!(pool[2].dense_score, Some(0.6));
    }

    #[test]
    fn test_empty_input() {
        assert!(fuse(&[]).is_empty());
        assert!(fuse(&[VariantHits::default()]).is_empty());
    }
}

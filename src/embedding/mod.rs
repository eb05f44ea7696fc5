//! Embedding and indexing
//!
//! - `EmbeddingProvider` trait for abstraction over embedding backends
//! - `FastEmbedProvider` for local ONNX models, `HashingProvider` for offline use
//! - `SparseIndex`: in-memory BM25 over whitespace tokens
//! - `DenseIndex`: exact inner-product search over L2-normalized vectors

mod dense_index;
mod provider;
mod sparse_index;

pub use dense_index::{DenseIndex, DenseIndexError};
pub use provider::{EmbeddingError, EmbeddingProvider, FastEmbedProvider, HashingProvider};
pub use sparse_index::{Bm25Params, SparseIndex};

/// Added to the norm before dividing so all-zero vectors stay all-zero
pub const NORM_EPSILON: f32 = 1e-10;

/// Sparse tokenization: lower-cased whitespace split
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(|t| t.to_lowercase()).collect()
}

/// Scale a vector to unit length (`v / (||v|| + eps)`)
pub fn l2_normalize(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    vector.iter().map(|x| x / (norm + NORM_EPSILON)).collect()
}

/// Cosine similarity with the same normalization convention as the index
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let a = l2_normalize(a);
    let b = l2_normalize(b);
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        assert_eq!(
            tokenize("  Leave  Requests\tMUST be\nsubmitted. "),
            vec!["leave", "requests", "must", "be", "submitted."]
        );
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_normalize_zero_vector() {
        let zero = l2_normalize(&[0.0, 0.0, 0.0]);
        assert!(zero.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_normalize_unit_length() {
        let v = l2_normalize(&[3.0, 4.0]);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!((v[0] - 0.6).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_bounds() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-5);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-5);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}

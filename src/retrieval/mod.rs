//! Hybrid retrieval: fusion, reranking, query expansion and confidence gating
//!
//! Sparse (BM25) and dense hits for every query variant are fused into one
//! candidate pool by taking each chunk's best score. The pool is reranked by
//! one of two strategies, chosen per request by a deterministic A/B bucket,
//! and the ranked list is gated by a strategy-specific threshold.

mod expansion;
mod fusion;
mod gate;
mod reranker;

pub use expansion::{Expansion, QueryExpander, VariantParser, EXPANSION_INSTRUCTIONS};
pub use fusion::{fuse, VariantHits};
pub use gate::{accept, evaluate, GateDecision};
pub use reranker::{
    CosineRerank, CrossEncoder, CrossEncoderRerank, FastEmbedCrossEncoder, RerankError,
    RerankQuery, Reranker,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reranking strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    /// Cosine similarity against stored dense vectors
    #[serde(rename = "v1")]
    Cosine,
    /// Cross-encoder relevance logits
    #[serde(rename = "v2")]
    CrossEncoder,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Cosine => "v1",
            Strategy::CrossEncoder => "v2",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A/B bucket assignment
///
/// `force_v2` overrides the bucket; otherwise `user_id % 100 < percentage`
/// selects the cross-encoder.
pub fn select_strategy(user_id: u64, percentage: u8, force_v2: bool) -> Strategy {
    if force_v2 || user_id % 100 < u64::from(percentage) {
        Strategy::CrossEncoder
    } else {
        Strategy::Cosine
    }
}

/// A fused candidate
///
/// `fused_score` is always the maximum of whichever component scores are present.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub chunk_index: usize,
    pub sparse_score: Option<f32>,
    pub dense_score: Option<f32>,
    pub fused_score: f32,
}

impl Candidate {
    pub fn from_sparse(chunk_index: usize, score: f32) -> Self {
        Self {
            chunk_index,
            sparse_score: Some(score),
            dense_score: None,
            fused_score: score,
        }
    }

    pub fn from_dense(chunk_index: usize, score: f32) -> Self {
        Self {
            chunk_index,
            sparse_score: None,
            dense_score: Some(score),
            fused_score: score,
        }
    }

    pub fn record_sparse(&mut self, score: f32) {
        self.sparse_score = Some(self.sparse_score.map_or(score, |s| s.max(score)));
        self.fused_score = self.fused_score.max(score);
    }

    pub fn record_dense(&mut self, score: f32) {
        self.dense_score = Some(self.dense_score.map_or(score, |s| s.max(score)));
        self.fused_score = self.fused_score.max(score);
    }
}

/// Reranker output before chunk text is attached
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedHit {
    pub chunk_index: usize,
    pub score: f32,
}

/// Externally visible result
///
/// Scores from different strategies are on different scales and must not be compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub text: String,
    pub score: f32,
}

impl SearchHit {
    /// `None` for a non-finite score
    pub fn new(text: impl Into<String>, score: f32) -> Option<Self> {
        score.is_finite().then(|| Self {
            text: text.into(),
            score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_assignment() {
        assert_eq!(select_strategy(0, 30, false), Strategy::CrossEncoder);
        assert_eq!(select_strategy(29, 30, false), Strategy::CrossEncoder);
        assert_eq!(select_strategy(30, 30, false), Strategy::Cosine);
        assert_eq!(select_strategy(129, 30, false), Strategy::CrossEncoder);
        assert_eq!(select_strategy(99, 100, false), Strategy::CrossEncoder);
        assert_eq!(select_strategy(5, 0, false), Strategy::Cosine);
    }

    #[test]
    fn test_force_v2_overrides_bucket() {
        assert_eq!(select_strategy(99, 0, true), Strategy::CrossEncoder);
    }

    #[test]
    fn test_bucket_is_stable() {
        for user in 0..500u64 {
            assert_eq!(
                select_strategy(user, 42, false),
                select_strategy(user, 42, false)
            );
        }
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(Strategy::Cosine.to_string(), "v1");
        assert_eq!(
            serde_json::to_string(&Strategy::CrossEncoder).unwrap(),
            "\"v2\""
        );
    }

    #[test]
    fn test_candidate_keeps_max() {
        let mut candidate = Candidate::from_dense(3, 0.5);
        candidate.record_dense(0.5);
        candidate.record_dense(0.2);
        candidate.record_sparse(0.4);
        assert_eq!(candidate.fused_score, 0.5);
        assert_eq!(candidate.dense_score, Some(0.5));
        assert_eq!(candidate.sparse_score, Some(0.4));
    }

    #[test]
    fn test_search_hit_rejects_nan() {
        assert!(SearchHit::new("x", f32::NAN).is_none());
        assert!(SearchHit::new("x", f32::INFINITY).is_none());
        assert_eq!(SearchHit::new("x", -2.5).unwrap().score, -2.5);
    }
}

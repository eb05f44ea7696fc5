//! Reranking strategies: stored-vector cosine (v1) and cross-encoder (v2)

use super::{Candidate, RankedHit, Strategy};
use crate::index::IndexGeneration;
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RerankError {
    #[error("Reranker initialization failed: {0}")]
    InitializationError(String),

    #[error("Reranking failed: {0}")]
    RerankingError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cross-encoder returned {actual} scores for {expected} passages")]
    ScoreCount { expected: usize, actual: usize },

    #[error("Cross-encoder returned a non-finite score for passage {0}")]
    NonFinite(usize),
}

/// Query as seen by a reranker
#[derive(Debug, Clone)]
pub struct RerankQuery {
    pub text: String,
    /// L2-normalized query embedding
    pub vector: Vec<f32>,
}

/// Re-scores a fused pool and keeps the best `k`
pub trait Reranker: Send + Sync {
    fn strategy(&self) -> Strategy;

    fn rerank(
        &self,
        query: &RerankQuery,
        generation: &IndexGeneration,
        pool: &[Candidate],
        k: usize,
    ) -> Result<Vec<RankedHit>, RerankError>;
}

/// Scores (query, passage) pairs jointly
///
/// Returns one unbounded relevance logit per passage, in passage order.
pub trait CrossEncoder: Send + Sync {
    fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, RerankError>;

    fn model_name(&self) -> &str;
}

fn sort_and_truncate(mut hits: Vec<RankedHit>, k: usize) -> Vec<RankedHit> {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.chunk_index.cmp(&b.chunk_index))
    });
    hits.truncate(k);
    hits
}

/// v1: cosine between the query embedding and each candidate's stored vector
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineRerank;

impl Reranker for CosineRerank {
    fn strategy(&self) -> Strategy {
        Strategy::Cosine
    }

    fn rerank(
        &self,
        query: &RerankQuery,
        generation: &IndexGeneration,
        pool: &[Candidate],
        k: usize,
    ) -> Result<Vec<RankedHit>, RerankError> {
        let dense = generation.dense();
        if query.vector.len() != dense.dimension() {
            return Err(RerankError::InvalidInput(format!(
                "query vector has {} dimensions, index has {}",
                query.vector.len(),
                dense.dimension()
            )));
        }

        let hits = pool
            .iter()
            .filter_map(|candidate| {
                dense
                    .similarity(&query.vector, candidate.chunk_index)
                    .map(|score| RankedHit {
                        chunk_index: candidate.chunk_index,
                        score,
                    })
            })
            .collect();

        Ok(sort_and_truncate(hits, k))
    }
}

/// v2: cross-encoder logits over the best `pool_size` fused candidates
pub struct CrossEncoderRerank {
    encoder: Arc<dyn CrossEncoder>,
    pool_size: usize,
}

impl CrossEncoderRerank {
    pub fn new(encoder: Arc<dyn CrossEncoder>, pool_size: usize) -> Self {
        Self {
            encoder,
            pool_size: pool_size.max(1),
        }
    }
}

impl Reranker for CrossEncoderRerank {
    fn strategy(&self) -> Strategy {
        Strategy::CrossEncoder
    }

    fn rerank(
        &self,
        query: &RerankQuery,
        generation: &IndexGeneration,
        pool: &[Candidate],
        k: usize,
    ) -> Result<Vec<RankedHit>, RerankError> {
        let mut shortlist: Vec<&Candidate> = pool.iter().collect();
        shortlist.sort_by(|a, b| {
            b.fused_score
                .total_cmp(&a.fused_score)
                .then(a.chunk_index.cmp(&b.chunk_index))
        });
        shortlist.truncate(self.pool_size.min(pool.len()));

        let mut indices = Vec::with_capacity(shortlist.len());
        let mut passages = Vec::with_capacity(shortlist.len());
        for candidate in shortlist {
            let chunk = generation.chunk(candidate.chunk_index).ok_or_else(|| {
                RerankError::InvalidInput(format!(
                    "candidate {} is outside the corpus",
                    candidate.chunk_index
                ))
            })?;
            indices.push(candidate.chunk_index);
            passages.push(chunk.text.as_str());
        }
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let scores = self.encoder.score(&query.text, &passages)?;
        if scores.len() != passages.len() {
            return Err(RerankError::ScoreCount {
                expected: passages.len(),
                actual: scores.len(),
            });
        }

        let mut hits = Vec::with_capacity(scores.len());
        for (position, (chunk_index, score)) in indices.into_iter().zip(scores).enumerate() {
            if !score.is_finite() {
                return Err(RerankError::NonFinite(position));
            }
            hits.push(RankedHit { chunk_index, score });
        }

        Ok(sort_and_truncate(hits, k))
    }
}

/// Local cross-encoder using FastEmbed's reranker models
pub struct FastEmbedCrossEncoder {
    model: Arc<TextRerank>,
    model_name: String,
}

impl FastEmbedCrossEncoder {
    /// Supported models:
    /// - BAAI/bge-reranker-base, the default
    /// - rozgo/bge-reranker-v2-m3 (multilingual)
    /// - jinaai/jina-reranker-v1-turbo-en
    pub fn new(model_name: &str) -> Result<Self, RerankError> {
        tracing::info!("Initializing cross-encoder model: {}", model_name);

        let model_type = match model_name {
            "BAAI/bge-reranker-base" | "bge-reranker-base" => RerankerModel::BGERerankerBase,
            "rozgo/bge-reranker-v2-m3" | "bge-reranker-v2-m3" => RerankerModel::BGERerankerV2M3,
            "jinaai/jina-reranker-v1-turbo-en" | "jina-reranker-v1-turbo-en" => {
                RerankerModel::JINARerankerV1TurboEn
            }
            _ => {
                return Err(RerankError::InitializationError(format!(
                    "Unsupported cross-encoder model: {}",
                    model_name
                )))
            }
        };

        let init_options = RerankInitOptions::new(model_type).with_show_download_progress(true);
        let model = TextRerank::try_new(init_options)
            .map_err(|e| RerankError::InitializationError(e.to_string()))?;

        Ok(Self {
            model: Arc::new(model),
            model_name: model_name.to_string(),
        })
    }
}

impl CrossEncoder for FastEmbedCrossEncoder {
    fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, RerankError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        if query.is_empty() {
            return Err(RerankError::InvalidInput("Query cannot be empty".to_string()));
        }

        let results = self
            .model
            .rerank(query, passages.to_vec(), false, None)
            .map_err(|e| RerankError::RerankingError(e.to_string()))?;

        // results come back sorted by score; put them back in passage order
        let mut scores = vec![f32::NAN; passages.len()];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
            }
        }
        Ok(scores)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

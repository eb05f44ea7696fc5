//! docqa - Confidence-Gated Hybrid Retrieval
//!
//! Answers natural-language questions against a private, periodically rebuilt
//! document corpus. Chunks are indexed twice (BM25 and dense embeddings),
//! candidates from both are fused, reranked by cosine similarity or a
//! cross-encoder, and low-confidence results are gated instead of being handed
//! to the text generator.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod generation;
pub mod index;
pub mod retrieval;
pub mod storage;
pub mod usage;
pub mod workers;

pub use engine::{Answer, Engine, EngineParts, EngineStatus, Response};
pub use error::{DocqaError, Result};

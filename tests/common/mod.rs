//! Deterministic collaborators shared by the integration tests

#![allow(dead_code)]

use docqa::config::Config;
use docqa::embedding::{EmbeddingError, EmbeddingProvider, HashingProvider};
use docqa::generation::{Generation, GenerationError, Generator};
use docqa::retrieval::{CrossEncoder, RerankError};
use docqa::storage::Database;
use docqa::{Engine, EngineParts};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const DIMENSION: usize = 4096;

pub fn hr_chunks() -> Vec<String> {
    vec![
        "Leave requests must be submitted two weeks in advance.".to_string(),
        "Sick leave requires a medical certificate within three days.".to_string(),
        "A standard operating procedure documents a repeatable task.".to_string(),
    ]
}

pub fn test_config(data_dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = data_dir.to_path_buf();
    config.embedding.mode = "hashing".to_string();
    config.embedding.dimension = DIMENSION;
    config.retrieval.v2_percentage = 0;
    config.retrieval.force_v2 = false;
    config.expansion.enabled = false;
    config.workers.max_concurrent = 4;
    config
}

pub fn hashing() -> Arc<dyn EmbeddingProvider> {
    Arc::new(HashingProvider::new(DIMENSION))
}

pub fn engine_with(
    config: Config,
    provider: Arc<dyn EmbeddingProvider>,
    cross_encoder: Option<Arc<dyn CrossEncoder>>,
    generator: Option<Arc<dyn Generator>>,
    with_database: bool,
) -> Engine {
    let database = with_database
        .then(|| Database::new(&config.storage.database_path()).unwrap());
    Engine::new(
        config,
        EngineParts {
            provider,
            cross_encoder,
            generator,
            database,
        },
    )
    .unwrap()
}

/// Hashing embedder that fails on any text containing "explode"
pub struct FlakyProvider(pub HashingProvider);

impl EmbeddingProvider for FlakyProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.contains("explode") {
            return Err(EmbeddingError::Unavailable("backend down".to_string()));
        }
        self.0.embed(text)
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimension(&self) -> usize {
        self.0.dimension()
    }

    fn model_name(&self) -> &str {
        self.0.model_name()
    }
}

/// Hashing embedder that sleeps before every batch
pub struct SlowProvider {
    pub inner: HashingProvider,
    pub delay: Duration,
}

impl EmbeddingProvider for SlowProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.inner.embed(text)
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        std::thread::sleep(self.delay);
        self.inner.embed_batch(texts)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

pub struct FailingCrossEncoder;

impl CrossEncoder for FailingCrossEncoder {
    fn score(&self, _query: &str, _passages: &[&str]) -> Result<Vec<f32>, RerankError> {
        Err(RerankError::RerankingError("model crashed".to_string()))
    }

    fn model_name(&self) -> &str {
        "failing"
    }
}

/// Cross-encoder that sleeps before delegating
pub struct SlowCrossEncoder {
    pub delay: Duration,
}

impl CrossEncoder for SlowCrossEncoder {
    fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, RerankError> {
        std::thread::sleep(self.delay);
        OverlapCrossEncoder.score(query, passages)
    }

    fn model_name(&self) -> &str {
        "slow"
    }
}

/// Scores passages by how many query words they contain, as a logit around zero
pub struct OverlapCrossEncoder;

impl CrossEncoder for OverlapCrossEncoder {
    fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, RerankError> {
        let words: Vec<String> = query.split_whitespace().map(|w| w.to_lowercase()).collect();
        Ok(passages
            .iter()
            .map(|passage| {
                let lowered = passage.to_lowercase();
                let overlap = words.iter().filter(|w| lowered.contains(w.as_str())).count();
                overlap as f32 - 2.0
            })
            .collect())
    }

    fn model_name(&self) -> &str {
        "overlap"
    }
}

/// Generator that always replies with the same text
pub struct ScriptedGenerator {
    pub reply: String,
    pub completion_tokens: u64,
}

impl Generator for ScriptedGenerator {
    fn generate(
        &self,
        _context: &str,
        _query: &str,
        _max_tokens: usize,
    ) -> Result<Generation, GenerationError> {
        Ok(Generation {
            text: self.reply.clone(),
            completion_tokens: self.completion_tokens,
        })
    }
}

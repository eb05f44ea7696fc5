//! Query answering facade
//!
//! Ties the index store, retrieval pipeline, generation collaborator and
//! usage meter together. All blocking work goes through one `WorkerPool`.

use crate::config::Config;
use crate::embedding::{
    l2_normalize, tokenize, Bm25Params, DenseIndexError, EmbeddingProvider, FastEmbedProvider,
    HashingProvider,
};
use crate::error::{DocqaError, Result};
use crate::generation::{Generation, Generator, ModelServiceClient, SamplingParams};
use crate::index::{IndexGeneration, IndexStore, RebuildOutcome};
use crate::retrieval::{
    evaluate, fuse, select_strategy, Candidate, CosineRerank, CrossEncoder, CrossEncoderRerank,
    FastEmbedCrossEncoder, GateDecision, QueryExpander, RankedHit, RerankQuery, Reranker,
    SearchHit, Strategy, VariantHits,
};
use crate::storage::{Database, NewUnanswered};
use crate::usage::{month_key, UsageCounter, UsageMeter, UsageReport};
use crate::workers::WorkerPool;
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

const PROCESSING_FAILED: &str = "could not process request";

/// Collaborators handed to the engine
pub struct EngineParts {
    pub provider: Arc<dyn EmbeddingProvider>,
    pub cross_encoder: Option<Arc<dyn CrossEncoder>>,
    pub generator: Option<Arc<dyn Generator>>,
    pub database: Option<Database>,
}

impl EngineParts {
    /// Build collaborators from configuration
    ///
    /// Creates blocking HTTP clients, so call it outside the async runtime.
    /// A cross-encoder that fails to load is logged and left out; v2 requests
    /// then fall back to cosine reranking.
    pub fn from_config(config: &Config, load_cross_encoder: bool) -> Result<Self> {
        let service = Arc::new(ModelServiceClient::new(
            &config.generation.service_url,
            Duration::from_secs(config.generation.timeout_secs),
            SamplingParams {
                temperature: config.generation.temperature,
                top_p: config.generation.top_p,
            },
            &config.embedding.model,
            config.embedding.dimension,
        )?);

        let provider: Arc<dyn EmbeddingProvider> = match config.embedding.mode.as_str() {
            "offline" => Arc::new(FastEmbedProvider::new(&config.embedding.model)?),
            "online" => service.clone(),
            "hashing" => Arc::new(HashingProvider::new(config.embedding.dimension)),
            other => {
                return Err(DocqaError::InvalidConfigValue {
                    path: "embedding.mode".to_string(),
                    message: format!("unsupported mode '{}'", other),
                })
            }
        };

        let skip_cross_encoder = !load_cross_encoder || config.embedding.mode == "hashing";
        let cross_encoder: Option<Arc<dyn CrossEncoder>> = if skip_cross_encoder {
            None
        } else {
            match FastEmbedCrossEncoder::new(&config.retrieval.cross_encoder_model) {
                Ok(encoder) => Some(Arc::new(encoder)),
                Err(e) => {
                    warn!("Cross-encoder unavailable, v2 requests will use v1: {}", e);
                    None
                }
            }
        };

        let database = Database::new(&config.storage.database_path())?;

        Ok(Self {
            provider,
            cross_encoder,
            generator: Some(service),
            database: Some(database),
        })
    }
}

/// Result of `answer`
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub request_id: String,
    pub hits: Vec<SearchHit>,
    /// Strategy that produced `hits`, after any fallback
    pub strategy_used: Strategy,
    pub strategy_requested: Strategy,
    pub fell_back: bool,
    pub accepted: bool,
    pub decision: GateDecision,
    pub variants: Vec<String>,
}

/// Result of `respond`
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub answer: Answer,
    /// `None` when the gate rejected the hits
    pub generation: Option<Generation>,
    pub usage: Option<UsageReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub corpus_size: usize,
    pub generation_id: Option<String>,
    pub embedding_model: String,
    pub dimension: usize,
    pub rebuilding: bool,
    pub cross_encoder: Option<String>,
    pub workers: usize,
    pub usage: UsageCounter,
}

/// Single-corpus retrieval engine
pub struct Engine {
    config: Config,
    store: Arc<IndexStore>,
    expander: QueryExpander,
    cross_encoder: Option<Arc<dyn CrossEncoder>>,
    generator: Option<Arc<dyn Generator>>,
    database: Option<Arc<Database>>,
    meter: UsageMeter,
    pool: WorkerPool,
}

/// Log the cause, surface the generic failure
fn processing_failure(stage: &str, cause: impl Display) -> DocqaError {
    error!("{} failed: {}", stage, cause);
    DocqaError::Processing(PROCESSING_FAILED.to_string())
}

impl Engine {
    pub fn new(config: Config, parts: EngineParts) -> Result<Self> {
        let pool = WorkerPool::new(config.workers.max_concurrent);
        let params = Bm25Params {
            k1: config.retrieval.bm25_k1,
            b: config.retrieval.bm25_b,
        };
        let snapshot_dir = Some(config.storage.snapshot_dir());

        let store = Arc::new(IndexStore::new(
            parts.provider,
            params,
            config.embedding.batch_size,
            snapshot_dir,
            pool.clone(),
        ));
        let expander = QueryExpander::new(
            parts.generator.clone(),
            config.expansion.clone(),
            pool.clone(),
        )?;
        let meter = UsageMeter::new(config.usage.monthly_limit, config.usage.alert_fraction);

        Ok(Self {
            config,
            store,
            expander,
            cross_encoder: parts.cross_encoder,
            generator: parts.generator,
            database: parts.database.map(Arc::new),
            meter,
            pool,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    /// Restore the index snapshot and this month's usage
    pub async fn load(&self) -> usize {
        let restored = self.store.load().await;

        if let Some(db) = self.database.clone() {
            let month = month_key(chrono::Utc::now());
            let lookup = month.clone();
            match self.pool.run(move || db.load_usage(&lookup)).await {
                Ok(Ok(Some(tokens))) => {
                    info!("Restored usage for {}: {} tokens", month, tokens);
                    self.meter.restore(&month, tokens);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!("Could not restore usage: {}", e),
                Err(e) => warn!("Could not restore usage: {}", e),
            }
        }

        restored
    }

    /// Replace the corpus; returns the number of indexed chunks
    pub async fn rebuild_index(&self, chunks: Vec<String>) -> Result<usize> {
        self.rebuild(chunks).await.map(|outcome| outcome.indexed)
    }

    pub async fn rebuild(&self, chunks: Vec<String>) -> Result<RebuildOutcome> {
        self.store.rebuild(chunks).await
    }

    /// Retrieve, rerank and gate hits for `query`
    ///
    /// A gate rejection is a normal outcome (`accepted == false`). Failures of
    /// the embedding backend surface as `DocqaError::Processing`.
    pub async fn answer(&self, query: &str, user_id: u64, use_expansion: bool) -> Result<Answer> {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("answer", request_id = %request_id, user_id);
        self.answer_inner(query, user_id, use_expansion, request_id)
            .instrument(span)
            .await
    }

    async fn answer_inner(
        &self,
        query: &str,
        user_id: u64,
        use_expansion: bool,
        request_id: String,
    ) -> Result<Answer> {
        let query = query.trim();
        if query.is_empty() {
            return Err(DocqaError::InvalidQuery("query is empty".to_string()));
        }

        let retrieval = &self.config.retrieval;
        let requested = select_strategy(user_id, retrieval.v2_percentage, retrieval.force_v2);
        let generation = match self.store.searchable().await {
            Ok(generation) => generation,
            Err(DocqaError::EmptyCorpus) => {
                return Ok(self.no_hits(request_id, query, user_id, requested).await)
            }
            Err(e) => return Err(e),
        };

        let variants = if use_expansion {
            let expansion = self.expander.expand(query).await;
            if expansion.completion_tokens > 0 {
                self.record_usage(expansion.completion_tokens).await;
            }
            expansion.variants
        } else {
            vec![query.to_string()]
        };

        let vectors = self.embed_queries(variants.clone()).await?;
        let candidates = self
            .gather_candidates(generation.clone(), variants.clone(), vectors.clone())
            .await?;
        debug!(
            "Fused {} candidates from {} variants",
            candidates.len(),
            variants.len()
        );

        let rerank_query = Arc::new(RerankQuery {
            text: query.to_string(),
            vector: l2_normalize(&vectors[0]),
        });
        let (ranked, strategy_used, fell_back) = self
            .rerank(requested, generation.clone(), rerank_query, candidates)
            .await?;

        let hits: Vec<SearchHit> = ranked
            .iter()
            .filter_map(|hit| {
                generation
                    .chunk(hit.chunk_index)
                    .and_then(|chunk| SearchHit::new(chunk.text.clone(), hit.score))
            })
            .collect();

        let threshold = retrieval.threshold_for(strategy_used);
        let decision = evaluate(&hits, threshold);
        info!(
            "Answered with {} hits via {} ({})",
            hits.len(),
            strategy_used,
            decision.reason()
        );

        let answer = Answer {
            request_id,
            hits,
            strategy_used,
            strategy_requested: requested,
            fell_back,
            accepted: decision.is_accepted(),
            decision,
            variants,
        };

        if !answer.accepted {
            self.log_unanswered(&answer, query, user_id).await;
        }

        Ok(answer)
    }

    /// Answer for a corpus with nothing to search
    async fn no_hits(
        &self,
        request_id: String,
        query: &str,
        user_id: u64,
        requested: Strategy,
    ) -> Answer {
        debug!("Corpus is empty, nothing to retrieve");
        let answer = Answer {
            request_id,
            hits: Vec::new(),
            strategy_used: requested,
            strategy_requested: requested,
            fell_back: false,
            accepted: false,
            decision: GateDecision::NoHits,
            variants: vec![query.to_string()],
        };
        self.log_unanswered(&answer, query, user_id).await;
        answer
    }

    async fn embed_queries(&self, variants: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let provider = self.store.provider().clone();
        let limit = Duration::from_millis(self.config.embedding.timeout_ms);
        let expected = variants.len();

        let vectors = self
            .pool
            .run_with_timeout(limit, move || provider.embed_batch(&variants))
            .await
            .map_err(|e| processing_failure("Query embedding", e))?
            .map_err(|e| processing_failure("Query embedding", e))?;

        if vectors.len() != expected {
            return Err(processing_failure(
                "Query embedding",
                format!("expected {} vectors, got {}", expected, vectors.len()),
            ));
        }
        Ok(vectors)
    }

    async fn gather_candidates(
        &self,
        generation: Arc<IndexGeneration>,
        variants: Vec<String>,
        vectors: Vec<Vec<f32>>,
    ) -> Result<Vec<Candidate>> {
        let sparse_k = self.config.retrieval.sparse_k;
        let dense_k = self.config.retrieval.dense_k;

        self.pool
            .run(move || -> std::result::Result<Vec<Candidate>, DenseIndexError> {
                let mut per_variant = Vec::with_capacity(variants.len());
                for (variant, vector) in variants.iter().zip(vectors.iter()) {
                    per_variant.push(VariantHits {
                        sparse: generation.sparse().search(&tokenize(variant), sparse_k),
                        dense: generation.dense().search(vector, dense_k)?,
                    });
                }
                Ok(fuse(&per_variant))
            })
            .await
            .map_err(|e| processing_failure("Candidate retrieval", e))?
            .map_err(|e| processing_failure("Candidate retrieval", e))
    }

    /// Rerank with the requested strategy, falling back to cosine on any v2 failure
    async fn rerank(
        &self,
        requested: Strategy,
        generation: Arc<IndexGeneration>,
        query: Arc<RerankQuery>,
        candidates: Vec<Candidate>,
    ) -> Result<(Vec<RankedHit>, Strategy, bool)> {
        let top_k = self.config.retrieval.top_k;

        if requested == Strategy::CrossEncoder {
            match &self.cross_encoder {
                Some(encoder) => {
                    let reranker =
                        CrossEncoderRerank::new(encoder.clone(), self.config.retrieval.rerank_pool);
                    let limit = Duration::from_millis(self.config.retrieval.cross_encoder_timeout_ms);
                    let (generation, query, candidates) =
                        (generation.clone(), query.clone(), candidates.clone());

                    let result = self
                        .pool
                        .run_with_timeout(limit, move || {
                            reranker.rerank(&query, &generation, &candidates, top_k)
                        })
                        .await;

                    match result {
                        Ok(Ok(hits)) => return Ok((hits, Strategy::CrossEncoder, false)),
                        Ok(Err(e)) => warn!("Cross-encoder rerank failed, using v1: {}", e),
                        Err(e) => warn!("Cross-encoder rerank did not complete, using v1: {}", e),
                    }
                }
                None => warn!("No cross-encoder loaded, using v1"),
            }
        }

        let hits = self
            .pool
            .run(move || CosineRerank.rerank(&query, &generation, &candidates, top_k))
            .await
            .map_err(|e| processing_failure("Cosine rerank", e))?
            .map_err(|e| processing_failure("Cosine rerank", e))?;

        Ok((hits, Strategy::Cosine, requested != Strategy::Cosine))
    }

    async fn log_unanswered(&self, answer: &Answer, query: &str, user_id: u64) {
        let Some(db) = self.database.clone() else {
            return;
        };

        let top_score = match answer.decision {
            GateDecision::BelowThreshold { top_score } => Some(top_score),
            _ => None,
        };
        let request_id = answer.request_id.clone();
        let query = query.to_string();
        let reason = answer.decision.reason();
        let strategy = answer.strategy_used.as_str();

        let result = self
            .pool
            .run(move || {
                db.record_unanswered(&NewUnanswered {
                    request_id: &request_id,
                    user_id,
                    query: &query,
                    reason,
                    top_score,
                    strategy,
                })
            })
            .await;

        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Could not log unanswered question: {}", e),
            Err(e) => warn!("Could not log unanswered question: {}", e),
        }
    }

    /// Add generated tokens to the monthly meter and persist the counter
    pub async fn record_usage(&self, completion_tokens: u64) -> UsageReport {
        let report = self.meter.record(completion_tokens);

        if let Some(db) = self.database.clone() {
            let (month, tokens_used) = (report.month_key.clone(), report.tokens_used);
            match self.pool.run(move || db.save_usage(&month, tokens_used)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Could not persist usage: {}", e),
                Err(e) => warn!("Could not persist usage: {}", e),
            }
        }

        report
    }

    /// Answer, then generate from accepted hits and meter the tokens
    pub async fn respond(&self, query: &str, user_id: u64, use_expansion: bool) -> Result<Response> {
        let answer = self.answer(query, user_id, use_expansion).await?;
        if !answer.accepted {
            return Ok(Response {
                answer,
                generation: None,
                usage: None,
            });
        }

        let generator = self
            .generator
            .clone()
            .ok_or_else(|| DocqaError::Config("No generator configured".to_string()))?;

        let context = answer
            .hits
            .iter()
            .map(|hit| hit.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let owned_query = query.trim().to_string();
        let max_tokens = self.config.generation.max_tokens as usize;
        let limit = Duration::from_secs(self.config.generation.timeout_secs);

        let generation = self
            .pool
            .run_with_timeout(limit, move || {
                generator.generate(&context, &owned_query, max_tokens)
            })
            .await
            .map_err(|e| processing_failure("Generation", e))?
            .map_err(|e| processing_failure("Generation", e))?;

        let usage = self.record_usage(generation.completion_tokens).await;

        Ok(Response {
            answer,
            generation: Some(generation),
            usage: Some(usage),
        })
    }

    pub async fn status(&self) -> EngineStatus {
        let generation = self.store.current().await;
        let provider = self.store.provider();

        EngineStatus {
            corpus_size: generation.len(),
            generation_id: (!generation.id().is_empty()).then(|| generation.id().to_string()),
            embedding_model: provider.model_name().to_string(),
            dimension: provider.dimension(),
            rebuilding: self.store.is_rebuilding(),
            cross_encoder: self
                .cross_encoder
                .as_ref()
                .map(|encoder| encoder.model_name().to_string()),
            workers: self.pool.size(),
            usage: self.meter.snapshot(),
        }
    }

    pub fn usage(&self) -> UsageCounter {
        self.meter.snapshot()
    }

    pub fn database(&self) -> Option<&Database> {
        self.database.as_deref()
    }
}

//! Text-generation collaborator
//!
//! The engine only needs `generate(context, query, max_tokens)`. The bundled
//! implementation talks to the model service over HTTP; the same service also
//! exposes `/embed`, so the client doubles as an `EmbeddingProvider`.

use crate::embedding::{EmbeddingError, EmbeddingProvider};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Generation backend unavailable: {0}")]
    Unavailable(String),

    #[error("Generation backend returned {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("Malformed generation response: {0}")]
    Malformed(String),
}

/// Generated answer with its completion token count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub completion_tokens: u64,
}

pub trait Generator: Send + Sync {
    fn generate(&self, context: &str, query: &str, max_tokens: usize)
        -> Result<Generation, GenerationError>;
}

/// Prompt-template markers some models echo back
const TEMPLATE_ARTIFACTS: &[&str] = &["[INST]", "[/INST]", "<<SYS>>", "<</SYS>>", "[/SYS]", "</s>", "<s>"];

/// Strip template markers and surrounding whitespace
pub fn clean_response(text: &str) -> String {
    let mut cleaned = text.to_string();
    for artifact in TEMPLATE_ARTIFACTS {
        cleaned = cleaned.replace(artifact, "");
    }
    cleaned.trim().to_string()
}

/// Whitespace token count, used when the backend reports no usage
pub fn estimate_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    query: &'a str,
    context: &'a str,
    max_tokens: usize,
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    generation_time: Option<f64>,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Health payload of the model service
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceHealth {
    pub status: String,
    #[serde(default)]
    pub models_loaded: bool,
}

/// Sampling settings forwarded with every `/generate` call
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
}

/// Blocking HTTP client for the model service
///
/// Must be created and dropped outside an async context; calls are made from
/// the worker pool.
pub struct ModelServiceClient {
    http: Client,
    base_url: String,
    sampling: SamplingParams,
    embedding_model: String,
    dimension: usize,
}

impl ModelServiceClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        sampling: SamplingParams,
        embedding_model: &str,
        dimension: usize,
    ) -> Result<Self, GenerationError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Unavailable(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            sampling,
            embedding_model: embedding_model.to_string(),
            dimension,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn health(&self) -> Result<ServiceHealth, GenerationError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .map_err(map_transport)?;
        parse_json(response)
    }

    fn request_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let response = self
            .http
            .post(format!("{}/embed", self.base_url))
            .json(&EmbedRequest { texts })
            .send()
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(EmbeddingError::GenerationError(format!(
                "model service returned {}: {}",
                status, body
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .map_err(|e| EmbeddingError::GenerationError(e.to_string()))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(EmbeddingError::GenerationError(format!(
                "Embedding count mismatch: expected {}, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        for embedding in &parsed.embeddings {
            if embedding.len() != self.dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dimension,
                    actual: embedding.len(),
                });
            }
        }

        Ok(parsed.embeddings)
    }
}

fn map_transport(error: reqwest::Error) -> GenerationError {
    if error.is_timeout() {
        GenerationError::Unavailable(format!("request timed out: {}", error))
    } else {
        GenerationError::Unavailable(error.to_string())
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(
    response: reqwest::blocking::Response,
) -> Result<T, GenerationError> {
    let status = response.status();
    if !status.is_success() {
        return Err(GenerationError::Backend {
            status: status.as_u16(),
            body: response.text().unwrap_or_default(),
        });
    }
    response
        .json()
        .map_err(|e| GenerationError::Malformed(e.to_string()))
}

impl Generator for ModelServiceClient {
    fn generate(
        &self,
        context: &str,
        query: &str,
        max_tokens: usize,
    ) -> Result<Generation, GenerationError> {
        let response = self
            .http
            .post(format!("{}/generate", self.base_url))
            .json(&GenerateRequest {
                query,
                context,
                max_tokens,
                temperature: self.sampling.temperature,
                top_p: self.sampling.top_p,
            })
            .send()
            .map_err(map_transport)?;

        let parsed: GenerateResponse = parse_json(response)?;
        if let Some(seconds) = parsed.generation_time {
            debug!("Model service generated in {:.2}s", seconds);
        }

        let text = clean_response(&parsed.response);
        let completion_tokens = parsed
            .completion_tokens
            .unwrap_or_else(|| estimate_tokens(&text));

        Ok(Generation {
            text,
            completion_tokens,
        })
    }
}

impl EmbeddingProvider for ModelServiceClient {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut embeddings = self.request_embeddings(&[text.to_string()])?;
        embeddings
            .pop()
            .ok_or_else(|| EmbeddingError::GenerationError("No embeddings generated".to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request_embeddings(texts)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.embedding_model
    }
}

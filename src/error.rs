use std::path::PathBuf;
use thiserror::Error;

use crate::embedding::{DenseIndexError, EmbeddingError};
use crate::generation::GenerationError;
use crate::retrieval::RerankError;
use crate::workers::WorkerError;

/// Main error type for docqa
#[derive(Error, Debug)]
pub enum DocqaError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// Embedding backend failed
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    /// Generation backend failed
    #[error(transparent)]
    Generation(#[from] GenerationError),

    /// Cross-encoder backend failed
    #[error(transparent)]
    Rerank(#[from] RerankError),

    /// Dense index rejected a vector
    #[error(transparent)]
    DenseIndex(#[from] DenseIndexError),

    /// Search against an unbuilt or empty index
    #[error("Index is empty, nothing to search")]
    EmptyCorpus,

    /// A second rebuild was requested while one is running
    #[error("A rebuild is already in progress")]
    RebuildInProgress,

    /// Snapshot on disk does not belong to the configured model or is damaged
    #[error("Snapshot mismatch: {0}")]
    SnapshotMismatch(String),

    /// Query rejected before retrieval
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Generic failure surfaced to callers of `answer`
    #[error("Could not process request: {0}")]
    Processing(String),

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Worker pool task failed to complete
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for docqa operations
pub type Result<T> = std::result::Result<T, DocqaError>;

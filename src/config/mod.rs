//! Configuration management for docqa
//!
//! Loads the TOML configuration, applies profile and environment overrides,
//! and validates the result before any component is built from it.

use crate::error::{DocqaError, Result};
use crate::retrieval::Strategy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

mod validator;

pub use validator::ConfigValidator;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub expansion: ExpansionConfig,
    pub generation: GenerationConfig,
    pub usage: UsageConfig,
    pub workers: WorkersConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for snapshots and the SQLite database
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("docqa.sqlite")
    }
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model: String,
    /// "offline" (local fastembed), "online" (model service) or "hashing"
    pub mode: String,
    pub batch_size: usize,
    /// Only used by the hashing provider; other providers report their own
    pub dimension: usize,
    /// Upper bound for a single query embedding call
    pub timeout_ms: u64,
}

/// Retrieval, fusion, reranking and gating configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Hits returned to the caller
    pub top_k: usize,
    /// Candidates pulled from the sparse index per query variant
    pub sparse_k: usize,
    /// Candidates pulled from the dense index per query variant
    pub dense_k: usize,
    pub bm25_k1: f32,
    pub bm25_b: f32,
    /// Candidates sent to the cross-encoder
    pub rerank_pool: usize,
    pub cross_encoder_model: String,
    pub cross_encoder_timeout_ms: u64,
    /// Share of users (0-100) routed to the cross-encoder strategy
    pub v2_percentage: u8,
    /// Route every request to the cross-encoder strategy
    pub force_v2: bool,
    /// Confidence threshold for cosine scores
    pub threshold_v1: f32,
    /// Confidence threshold for cross-encoder logits
    pub threshold_v2: f32,
}

impl RetrievalConfig {
    pub fn threshold_for(&self, strategy: Strategy) -> f32 {
        match strategy {
            Strategy::Cosine => self.threshold_v1,
            Strategy::CrossEncoder => self.threshold_v2,
        }
    }
}

/// Query expansion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpansionConfig {
    pub enabled: bool,
    /// Queries at or below this many characters are not expanded
    pub min_query_chars: usize,
    /// Reformulations at or below this many characters are dropped
    pub min_variant_chars: usize,
    pub max_variants: usize,
    pub max_tokens: u32,
    pub timeout_ms: u64,
}

/// Generation collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub service_url: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub timeout_secs: u64,
}

/// Monthly token budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    /// 0 means unbounded
    pub monthly_limit: u64,
    /// Fraction of the limit that triggers a warning
    pub alert_fraction: f64,
}

/// Bounded worker pool for blocking model calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    pub max_concurrent: usize,
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v2_percentage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_v2: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expansion_enabled: Option<bool>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DocqaError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| DocqaError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();

        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| DocqaError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| DocqaError::Config(format!("Unknown profile: {}", profile)))?;

        if let Some(mode) = overrides.embedding_mode {
            self.embedding.mode = mode;
        }
        if let Some(model) = overrides.embedding_model {
            self.embedding.model = model;
        }
        if let Some(percentage) = overrides.v2_percentage {
            self.retrieval.v2_percentage = percentage;
        }
        if let Some(force) = overrides.force_v2 {
            self.retrieval.force_v2 = force;
        }
        if let Some(enabled) = overrides.expansion_enabled {
            self.expansion.enabled = enabled;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: DOCQA_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix("DOCQA_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    pub(crate) fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "EMBEDDING__MODEL" => self.embedding.model = value.to_string(),
            "EMBEDDING__MODE" => self.embedding.mode = value.to_string(),
            "RETRIEVAL__CROSS_ENCODER_MODEL" => {
                self.retrieval.cross_encoder_model = value.to_string()
            }
            "RETRIEVAL__V2_PERCENTAGE" => {
                self.retrieval.v2_percentage = parse_value(path, value)?;
            }
            "RETRIEVAL__FORCE_V2" => {
                self.retrieval.force_v2 = parse_value(path, value)?;
            }
            "RETRIEVAL__THRESHOLD_V1" => {
                self.retrieval.threshold_v1 = parse_value(path, value)?;
            }
            "RETRIEVAL__THRESHOLD_V2" => {
                self.retrieval.threshold_v2 = parse_value(path, value)?;
            }
            "GENERATION__SERVICE_URL" => self.generation.service_url = value.to_string(),
            "GENERATION__MAX_TOKENS" => {
                self.generation.max_tokens = parse_value(path, value)?;
            }
            "USAGE__MONTHLY_LIMIT" => {
                self.usage.monthly_limit = parse_value(path, value)?;
            }
            "STORAGE__DATA_DIR" => self.storage.data_dir = PathBuf::from(value),
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| DocqaError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("docqa").join("config.toml"))
    }
}

fn parse_value<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| DocqaError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}'", value),
    })
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta: MetaConfig {
                schema_version: "1.0.0".to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("~/.docqa"),
            },
            embedding: EmbeddingConfig {
                model: "paraphrase-multilingual-MiniLM-L12-v2".to_string(),
                mode: "offline".to_string(),
                batch_size: 32,
                dimension: 384,
                timeout_ms: 10_000,
            },
            retrieval: RetrievalConfig {
                top_k: 3,
                sparse_k: 10,
                dense_k: 10,
                bm25_k1: 1.5,
                bm25_b: 0.75,
                rerank_pool: 20,
                cross_encoder_model: "BAAI/bge-reranker-base".to_string(),
                cross_encoder_timeout_ms: 5_000,
                v2_percentage: 30,
                force_v2: false,
                threshold_v1: 0.12,
                threshold_v2: 0.0,
            },
            expansion: ExpansionConfig {
                enabled: true,
                min_query_chars: 20,
                min_variant_chars: 5,
                max_variants: 2,
                max_tokens: 96,
                timeout_ms: 10_000,
            },
            generation: GenerationConfig {
                service_url: "http://localhost:8000".to_string(),
                max_tokens: 512,
                temperature: 0.7,
                top_p: 0.95,
                timeout_secs: 30,
            },
            usage: UsageConfig {
                monthly_limit: 1_000_000,
                alert_fraction: 0.8,
            },
            workers: WorkersConfig { max_concurrent: 4 },
            profiles: HashMap::new(),
        }
    }
}

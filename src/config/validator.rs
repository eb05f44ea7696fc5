use crate::config::Config;
use crate::error::{DocqaError, Result, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_expansion(config, &mut errors);
        Self::validate_generation(config, &mut errors);
        Self::validate_usage(config, &mut errors);

        if config.workers.max_concurrent == 0 {
            errors.push(ValidationError::new(
                "workers.max_concurrent",
                "Worker pool size must be greater than 0",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DocqaError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != "1.0.0" {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        let mode = &config.embedding.mode;
        if !["offline", "online", "hashing"].contains(&mode.as_str()) {
            errors.push(ValidationError::new(
                "embedding.mode",
                format!(
                    "Mode must be 'offline', 'online' or 'hashing', got '{}'",
                    mode
                ),
            ));
        }

        if config.embedding.batch_size == 0 {
            errors.push(ValidationError::new(
                "embedding.batch_size",
                "Batch size must be greater than 0",
            ));
        }

        if config.embedding.dimension == 0 {
            errors.push(ValidationError::new(
                "embedding.dimension",
                "Dimension must be greater than 0",
            ));
        }

        if config.embedding.model.is_empty() {
            errors.push(ValidationError::new(
                "embedding.model",
                "Model name cannot be empty",
            ));
        }
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        let retrieval = &config.retrieval;

        for (path, value) in [
            ("retrieval.top_k", retrieval.top_k),
            ("retrieval.sparse_k", retrieval.sparse_k),
            ("retrieval.dense_k", retrieval.dense_k),
            ("retrieval.rerank_pool", retrieval.rerank_pool),
        ] {
            if value == 0 {
                errors.push(ValidationError::new(path, "Must be greater than 0"));
            }
        }

        if retrieval.v2_percentage > 100 {
            errors.push(ValidationError::new(
                "retrieval.v2_percentage",
                format!(
                    "Percentage must be between 0 and 100, got {}",
                    retrieval.v2_percentage
                ),
            ));
        }

        if retrieval.bm25_k1 < 0.0 || !retrieval.bm25_k1.is_finite() {
            errors.push(ValidationError::new(
                "retrieval.bm25_k1",
                "k1 must be a non-negative number",
            ));
        }

        if !(0.0..=1.0).contains(&retrieval.bm25_b) {
            errors.push(ValidationError::new(
                "retrieval.bm25_b",
                format!("b must be between 0.0 and 1.0, got {}", retrieval.bm25_b),
            ));
        }

        if !retrieval.threshold_v1.is_finite() || !retrieval.threshold_v2.is_finite() {
            errors.push(ValidationError::new(
                "retrieval.threshold",
                "Confidence thresholds must be finite",
            ));
        }

        if retrieval.cross_encoder_model.is_empty() {
            errors.push(ValidationError::new(
                "retrieval.cross_encoder_model",
                "Cross-encoder model name cannot be empty",
            ));
        }
    }

    fn validate_expansion(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.expansion.enabled && config.expansion.max_variants == 0 {
            errors.push(ValidationError::new(
                "expansion.max_variants",
                "At least one variant is required when expansion is enabled",
            ));
        }
    }

    fn validate_generation(config: &Config, errors: &mut Vec<ValidationError>) {
        let generation = &config.generation;
        if !generation.service_url.starts_with("http://")
            && !generation.service_url.starts_with("https://")
        {
            errors.push(ValidationError::new(
                "generation.service_url",
                format!("Not an http(s) URL: {}", generation.service_url),
            ));
        }

        if generation.max_tokens == 0 {
            errors.push(ValidationError::new(
                "generation.max_tokens",
                "Max tokens must be greater than 0",
            ));
        }

        if !(0.0..=2.0).contains(&generation.temperature) {
            errors.push(ValidationError::new(
                "generation.temperature",
                format!(
                    "Temperature must be between 0.0 and 2.0, got {}",
                    generation.temperature
                ),
            ));
        }
    }

    fn validate_usage(config: &Config, errors: &mut Vec<ValidationError>) {
        let fraction = config.usage.alert_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            errors.push(ValidationError::new(
                "usage.alert_fraction",
                format!("Alert fraction must be in (0, 1], got {}", fraction),
            ));
        }
    }
}

//! Query reformulation through the generation collaborator

use crate::config::ExpansionConfig;
use crate::error::{DocqaError, Result};
use crate::generation::Generator;
use crate::workers::WorkerPool;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Sent as the generation context when asking for reformulations
pub const EXPANSION_INSTRUCTIONS: &str = "Rewrite the user's question in up to two different ways \
that keep its meaning. Put each rewrite on its own line. Do not answer the question.";

/// Leading enumeration markers and quotes
const MARKER_PATTERN: &str = r#"^\s*(?:\d+\s*[.)]|[-*•])?\s*["'“”«»]*\s*"#;

/// Turns a raw generator reply into the variant list
#[derive(Debug, Clone)]
pub struct VariantParser {
    marker: Regex,
    min_variant_chars: usize,
    max_variants: usize,
}

impl VariantParser {
    pub fn new(min_variant_chars: usize, max_variants: usize) -> Result<Self> {
        let marker = Regex::new(MARKER_PATTERN)
            .map_err(|e| DocqaError::Config(format!("Invalid expansion marker pattern: {}", e)))?;
        Ok(Self {
            marker,
            min_variant_chars,
            max_variants,
        })
    }

    fn clean_line(&self, line: &str) -> String {
        self.marker
            .replace(line, "")
            .trim_end_matches(|c: char| c.is_whitespace() || "\"'“”«»".contains(c))
            .to_string()
    }

    /// The original query always comes first. Lines are stripped of
    /// enumeration markers and quotes, then kept only if longer than
    /// `min_variant_chars` and not a case-insensitive repeat.
    pub fn parse(&self, query: &str, response: &str) -> Vec<String> {
        let mut variants = vec![query.to_string()];
        let mut seen = vec![query.trim().to_lowercase()];

        for line in response.lines() {
            if variants.len() > self.max_variants {
                break;
            }
            let candidate = self.clean_line(line);
            if candidate.is_empty() || candidate.chars().count() <= self.min_variant_chars {
                continue;
            }
            let key = candidate.to_lowercase();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            variants.push(candidate);
        }

        variants
    }
}

/// Variants produced for one query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    /// Original query first
    pub variants: Vec<String>,
    /// Tokens the generator reported; 0 when it was skipped or failed
    pub completion_tokens: u64,
}

impl Expansion {
    fn original(query: &str) -> Self {
        Self {
            variants: vec![query.to_string()],
            completion_tokens: 0,
        }
    }
}

/// Widens recall with alternate phrasings; never blocks retrieval
pub struct QueryExpander {
    generator: Option<Arc<dyn Generator>>,
    config: ExpansionConfig,
    parser: VariantParser,
    pool: WorkerPool,
}

impl QueryExpander {
    pub fn new(
        generator: Option<Arc<dyn Generator>>,
        config: ExpansionConfig,
        pool: WorkerPool,
    ) -> Result<Self> {
        let parser = VariantParser::new(config.min_variant_chars, config.max_variants)?;
        Ok(Self {
            generator,
            config,
            parser,
            pool,
        })
    }

    /// Whether `query` would be sent to the generator at all
    pub fn should_expand(&self, query: &str) -> bool {
        self.config.enabled
            && self.generator.is_some()
            && self.config.max_variants > 0
            && query.chars().count() > self.config.min_query_chars
    }

    /// `[query, reformulations...]`, or just `[query]` on any failure
    ///
    /// Tokens spent by a successful generator call are reported back so the
    /// caller can meter them, even when no usable variant came out of it.
    pub async fn expand(&self, query: &str) -> Expansion {
        if !self.should_expand(query) {
            return Expansion::original(query);
        }
        let Some(generator) = self.generator.clone() else {
            return Expansion::original(query);
        };

        let owned_query = query.to_string();
        let max_tokens = self.config.max_tokens as usize;
        let limit = Duration::from_millis(self.config.timeout_ms);

        let result = self
            .pool
            .run_with_timeout(limit, move || {
                generator.generate(EXPANSION_INSTRUCTIONS, &owned_query, max_tokens)
            })
            .await;

        match result {
            Ok(Ok(generation)) => {
                let variants = self.parser.parse(query, &generation.text);
                debug!("Expanded query into {} variants", variants.len());
                Expansion {
                    variants,
                    completion_tokens: generation.completion_tokens,
                }
            }
            Ok(Err(e)) => {
                warn!("Query expansion failed, using original query: {}", e);
                Expansion::original(query)
            }
            Err(e) => {
                warn!("Query expansion did not complete, using original query: {}", e);
                Expansion::original(query)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{Generation, GenerationError};

    struct Scripted(&'static str);

    impl Generator for Scripted {
        fn generate(
            &self,
            _context: &str,
            _query: &str,
            _max_tokens: usize,
        ) -> std::result::Result<Generation, GenerationError> {
            Ok(Generation {
                text: self.0.to_string(),
                completion_tokens: 7,
            })
        }
    }

    struct Sleepy(Duration);

    impl Generator for Sleepy {
        fn generate(
            &self,
            _context: &str,
            _query: &str,
            _max_tokens: usize,
        ) -> std::result::Result<Generation, GenerationError> {
            std::thread::sleep(self.0);
            Ok(Generation {
                text: "1. Leave request notice period".to_string(),
                completion_tokens: 7,
            })
        }
    }

    struct Broken;

    impl Generator for Broken {
        fn generate(
            &self,
            _context: &str,
            _query: &str,
            _max_tokens: usize,
        ) -> std::result::Result<Generation, GenerationError> {
            Err(GenerationError::Unavailable("down".to_string()))
        }
    }

    fn config() -> ExpansionConfig {
        ExpansionConfig {
            enabled: true,
            min_query_chars: 20,
            min_variant_chars: 5,
            max_variants: 2,
            max_tokens: 96,
            timeout_ms: 1000,
        }
    }

    const QUERY: &str = "how many weeks before leave must I apply";

    #[test]
    fn test_parse_strips_markers() {
        let response = "1. When should I submit a leave request?\n2) \"Leave request deadline\"\n- ok";
        let variants = VariantParser::new(5, 2).unwrap().parse(QUERY, response);
        assert_eq!(
            variants,
            vec![
                QUERY.to_string(),
                "When should I submit a leave request?".to_string(),
                "Leave request deadline".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_drops_short_and_duplicate_lines() {
        let response = "• yes\n\n* HOW MANY WEEKS BEFORE LEAVE MUST I APPLY\nNotice period for leave\nnotice period for LEAVE";
        let variants = VariantParser::new(5, 2).unwrap().parse(QUERY, response);
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[1], "Notice period for leave");
    }

    #[test]
    fn test_parse_caps_variant_count() {
        let response = "first rewrite here\nsecond rewrite here\nthird rewrite here";
        assert_eq!(VariantParser::new(5, 2).unwrap().parse(QUERY, response).len(), 3);
        assert_eq!(VariantParser::new(5, 1).unwrap().parse(QUERY, response).len(), 2);
    }

    #[tokio::test]
    async fn test_short_query_is_not_expanded() {
        let expander = QueryExpander::new(
            Some(Arc::new(Scripted("anything at all"))),
            config(),
            WorkerPool::new(1),
        )
        .unwrap();
        let expansion = expander.expand("vacation days").await;
        assert_eq!(expansion.variants, vec!["vacation days"]);
        assert_eq!(expansion.completion_tokens, 0);
    }

    #[tokio::test]
    async fn test_generator_failure_degrades() {
        let expander = QueryExpander::new(Some(Arc::new(Broken)), config(), WorkerPool::new(1)).unwrap();
        assert_eq!(expander.expand(QUERY).await, Expansion::original(QUERY));
    }

    #[tokio::test]
    async fn test_malformed_reply_degrades() {
        let expander =
            QueryExpander::new(Some(Arc::new(Scripted("\n\n - \n"))), config(), WorkerPool::new(1)).unwrap();
        let expansion = expander.expand(QUERY).await;
        assert_eq!(expansion.variants, vec![QUERY.to_string()]);
        // the call still spent tokens
        assert_eq!(expansion.completion_tokens, 7);
    }

    #[tokio::test]
    async fn test_slow_generator_times_out_to_original() {
        let mut quick = config();
        quick.timeout_ms = 50;
        let expander = QueryExpander::new(
            Some(Arc::new(Sleepy(Duration::from_millis(500)))),
            quick,
            WorkerPool::new(1),
        )
        .unwrap();

        let expansion = expander.expand(QUERY).await;
        assert_eq!(expansion.variants, vec![QUERY.to_string()]);
        assert_eq!(expansion.completion_tokens, 0);
    }

    #[tokio::test]
    async fn test_expansion_adds_variants() {
        let expander = QueryExpander::new(
            Some(Arc::new(Scripted("1. Leave request notice period\n2. Deadline for vacation requests"))),
            config(),
            WorkerPool::new(1),
        )
        .unwrap();
        let expansion = expander.expand(QUERY).await;
        assert_eq!(expansion.variants.len(), 3);
        assert_eq!(expansion.variants[0], QUERY);
        assert_eq!(expansion.completion_tokens, 7);
    }

    #[tokio::test]
    async fn test_disabled_expander() {
        let mut disabled = config();
        disabled.enabled = false;
        let expander =
            QueryExpander::new(Some(Arc::new(Scripted("a long rewrite"))), disabled, WorkerPool::new(1)).unwrap();
        assert_eq!(expander.expand(QUERY).await.variants.len(), 1);
    }
}

//! Typed configuration for the indexing pipeline and the search engines
//!
//! Configuration is loaded from a YAML file; every key has a default so a
//! minimal file only needs to name the LLM provider. API keys are never read
//! from the file, only from the environment.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Which LLM transport the gateway talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    Anthropic,
    Bedrock,
}

impl Default for LlmProviderKind {
    fn default() -> Self {
        Self::Anthropic
    }
}

/// Settings for the Anthropic Messages API provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicConfig {
    /// Model name (e.g. "claude-3-opus-20240229")
    pub model: String,

    /// Optional API base URL override
    pub api_base_url: Option<String>,

    /// Maximum tokens per completion request
    pub max_tokens: u32,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            model: "claude-3-opus-20240229".to_string(),
            api_base_url: None,
            max_tokens: 4096,
        }
    }
}

/// Settings for the AWS Bedrock provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BedrockConfig {
    /// Bedrock model id (e.g. "anthropic.claude-3-sonnet-20240229-v1:0")
    pub model: String,

    /// AWS region
    pub region: String,

    /// Maximum tokens per completion request
    pub max_tokens: u32,
}

impl Default for BedrockConfig {
    fn default() -> Self {
        Self {
            model: "anthropic.claude-3-sonnet-20240229-v1:0".to_string(),
            region: "us-east-1".to_string(),
            max_tokens: 4096,
        }
    }
}

/// Embedding model selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingModelConfig {
    /// Model name, matched against the known local models
    pub name: String,
}

impl Default for EmbeddingModelConfig {
    fn default() -> Self {
        Self {
            name: "multilingual-e5-small".to_string(),
        }
    }
}

/// Sentence-aware chunking parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum characters per chunk
    pub chunk_size: usize,

    /// Overlapping characters between adjacent chunks
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            chunk_overlap: 20,
        }
    }
}

/// Hierarchical community detection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityDetectionConfig {
    /// Clusters larger than this are recursively subdivided
    pub max_cluster_size: usize,

    /// Restrict clustering to the largest connected component
    pub use_lcc: bool,

    /// Seed for the deterministic node ordering
    pub seed: u64,
}

impl Default for CommunityDetectionConfig {
    fn default() -> Self {
        Self {
            max_cluster_size: 10,
            use_lcc: true,
            seed: 42,
        }
    }
}

/// GLOBAL search (map-reduce over community reports)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSearchConfig {
    /// Token budget per map batch
    pub max_context_tokens: usize,

    /// Community weighting is mandatory; `false` is rejected at startup
    pub include_community_weight: bool,

    /// Bound on concurrent map-phase LLM calls
    pub max_concurrent: usize,

    /// Reports below this rank are dropped from the context
    pub min_community_rank: i64,

    /// Emit one result node per key point in addition to the main response
    pub include_key_points: bool,

    /// Deterministically shuffle reports before batching
    pub shuffle_data: bool,

    /// Seed for the report shuffle
    pub random_state: u64,

    /// Requested shape of the final answer (e.g. "multiple paragraphs")
    pub response_type: String,

    /// Maximum length of the final answer, in words
    pub max_response_length: usize,
}

impl Default for GlobalSearchConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 8000,
            include_community_weight: true,
            max_concurrent: 5,
            min_community_rank: 0,
            include_key_points: false,
            shuffle_data: true,
            random_state: 42,
            response_type: "multiple paragraphs".to_string(),
            max_response_length: 2000,
        }
    }
}

/// LOCAL search (entity-anchored retrieval)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSearchConfig {
    /// Entities retrieved from the entity index
    pub entity_top_k: usize,

    /// Relationship expansion depth
    pub max_hops: usize,

    /// Entities used to pull supporting text units
    pub top_entities: usize,

    /// Text units retrieved per entity
    pub text_unit_top_k: usize,
}

impl Default for LocalSearchConfig {
    fn default() -> Self {
        Self {
            entity_top_k: 10,
            max_hops: 2,
            top_entities: 5,
            text_unit_top_k: 5,
        }
    }
}

/// DRIFT search: the nested local pass
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftLocalConfig {
    pub entity_top_k: usize,
    pub relationship_depth: usize,
    pub text_unit_top_k: usize,
}

impl Default for DriftLocalConfig {
    fn default() -> Self {
        Self {
            entity_top_k: 10,
            relationship_depth: 2,
            text_unit_top_k: 5,
        }
    }
}

/// DRIFT search: the nested global pass
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftGlobalConfig {
    pub community_top_k: usize,
}

impl Default for DriftGlobalConfig {
    fn default() -> Self {
        Self { community_top_k: 5 }
    }
}

/// DRIFT search: context budgeting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftContextConfig {
    pub max_tokens: usize,
}

impl Default for DriftContextConfig {
    fn default() -> Self {
        Self { max_tokens: 8000 }
    }
}

/// DRIFT search: response generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftResponseConfig {
    pub max_tokens: usize,
    pub streaming_enabled: bool,

    /// Minimum characters per streamed chunk
    pub chunk_size: usize,
}

impl Default for DriftResponseConfig {
    fn default() -> Self {
        Self {
            max_tokens: 2000,
            streaming_enabled: true,
            chunk_size: 50,
        }
    }
}

/// DRIFT search configuration tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftSearchConfig {
    pub local_search: DriftLocalConfig,
    pub global_search: DriftGlobalConfig,
    pub context: DriftContextConfig,
    pub response: DriftResponseConfig,
}

/// Keyword lists driving `auto` mode selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub global_keywords: Vec<String>,
    pub local_keywords: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            global_keywords: ["summary", "overall", "overview", "general"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            local_keywords: ["detail", "specific", "particular", "exact"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm_provider: LlmProviderKind,
    pub anthropic: AnthropicConfig,
    pub bedrock: BedrockConfig,
    pub embedding_model: EmbeddingModelConfig,
    pub chunking: ChunkingConfig,
    pub community_detection: CommunityDetectionConfig,
    pub global_search: GlobalSearchConfig,
    pub local_search: LocalSearchConfig,
    pub drift_search: DriftSearchConfig,
    pub router: RouterConfig,

    /// Glob patterns matched against full paths and basenames
    pub ignore_patterns: Vec<String>,

    pub input_dir: String,
    pub output_dir: String,

    /// Continuation budget for a single logical LLM call
    pub max_continuation_attempts: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm_provider: LlmProviderKind::default(),
            anthropic: AnthropicConfig::default(),
            bedrock: BedrockConfig::default(),
            embedding_model: EmbeddingModelConfig::default(),
            chunking: ChunkingConfig::default(),
            community_detection: CommunityDetectionConfig::default(),
            global_search: GlobalSearchConfig::default(),
            local_search: LocalSearchConfig::default(),
            drift_search: DriftSearchConfig::default(),
            router: RouterConfig::default(),
            ignore_patterns: Vec::new(),
            input_dir: "./data".to_string(),
            output_dir: "./graphrag_output".to_string(),
            max_continuation_attempts: 5,
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file is missing, unreadable or does not
    /// parse, or if the parsed settings are invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file '{}': {e}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid config '{}': {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that must hold before any component is built
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on an invalid combination of settings.
    pub fn validate(&self) -> Result<()> {
        if !self.global_search.include_community_weight {
            return Err(Error::Config(
                "community weighting is mandatory; set \
                 'global_search.include_community_weight: true'"
                    .to_string(),
            ));
        }
        if self.chunking.chunk_size == 0 {
            return Err(Error::Config("chunking.chunk_size must be > 0".to_string()));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(Error::Config(
                "chunking.chunk_overlap must be smaller than chunk_size".to_string(),
            ));
        }
        if self.global_search.max_concurrent == 0 {
            return Err(Error::Config(
                "global_search.max_concurrent must be > 0".to_string(),
            ));
        }
        if self.community_detection.max_cluster_size == 0 {
            return Err(Error::Config(
                "community_detection.max_cluster_size must be > 0".to_string(),
            ));
        }
        if self.llm_provider == LlmProviderKind::Anthropic && self.anthropic.model.is_empty() {
            return Err(Error::Config(
                "anthropic.model is required for the anthropic provider".to_string(),
            ));
        }
        if self.llm_provider == LlmProviderKind::Bedrock
            && (self.bedrock.model.is_empty() || self.bedrock.region.is_empty())
        {
            return Err(Error::Config(
                "bedrock.model and bedrock.region are required for the bedrock provider"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Check that provider credentials are available in the environment
    ///
    /// Only the Anthropic provider needs a key here; Bedrock resolves
    /// credentials through the AWS chain.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when `ANTHROPIC_API_KEY` is missing for the
    /// anthropic provider.
    pub fn validate_credentials(&self) -> Result<()> {
        if self.llm_provider == LlmProviderKind::Anthropic
            && std::env::var("ANTHROPIC_API_KEY").is_err()
        {
            return Err(Error::Config(
                "ANTHROPIC_API_KEY not found in environment; set it or switch \
                 llm_provider to 'bedrock'"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.llm_provider, LlmProviderKind::Anthropic);
        assert_eq!(config.chunking.chunk_size, 1024);
        assert_eq!(config.global_search.max_concurrent, 5);
        assert!(config.global_search.include_community_weight);
        assert_eq!(config.community_detection.seed, 42);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_weighting_is_mandatory() {
        let mut config = AppConfig::default();
        config.global_search.include_community_weight = false;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_overlap_must_fit_chunk_size() {
        let mut config = AppConfig::default();
        config.chunking.chunk_overlap = config.chunking.chunk_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r"
llm_provider: bedrock
bedrock:
  model: anthropic.claude-3-haiku-20240307-v1:0
  region: eu-west-1
chunking:
  chunk_size: 512
ignore_patterns:
  - '*.log'
";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.llm_provider, LlmProviderKind::Bedrock);
        assert_eq!(config.bedrock.region, "eu-west-1");
        assert_eq!(config.chunking.chunk_size, 512);
        // Unset keys keep their defaults
        assert_eq!(config.chunking.chunk_overlap, 20);
        assert_eq!(config.ignore_patterns, vec!["*.log".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_router_keyword_defaults() {
        let config = RouterConfig::default();
        assert!(config.global_keywords.contains(&"summary".to_string()));
        assert!(config.local_keywords.contains(&"specific".to_string()));
    }
}

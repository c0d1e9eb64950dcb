//! Search router: mode selection and the uniform result envelope

use std::str::FromStr;

use serde_json::{json, Value};
use tracing::info;

use crate::config::AppConfig;
use crate::drift_search::DriftSearchEngine;
use crate::global_search::GlobalSearchEngine;
use crate::llm::LlmGateway;
use crate::local_search::LocalSearchEngine;
use crate::store::ArtifactStore;
use crate::vector::VectorStoreRole;
use crate::{Error, Result};

/// Requested search mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Local,
    Global,
    Drift,
    Auto,
}

impl SearchMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Global => "global",
            Self::Drift => "drift",
            Self::Auto => "auto",
        }
    }
}

impl FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "global" => Ok(Self::Global),
            "drift" => Ok(Self::Drift),
            "auto" => Ok(Self::Auto),
            other => Err(Error::Config(format!("unknown search mode '{other}'"))),
        }
    }
}

/// Shape of the CLI/API output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Markdown,
    Json,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "markdown" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            other => Err(Error::Config(format!("unknown output format '{other}'"))),
        }
    }
}

/// Per-query overrides on top of the configured defaults
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub mode: SearchMode,
    pub response_type: Option<String>,
    pub output_format: OutputFormat,
    pub min_community_rank: Option<i64>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            mode: SearchMode::Auto,
            response_type: None,
            output_format: OutputFormat::Markdown,
            min_community_rank: None,
        }
    }
}

/// One node of the result envelope; the first node carries the main response
#[derive(Debug, Clone)]
pub struct ResultNode {
    pub text: String,
    pub score: f32,
    pub metadata: serde_json::Map<String, Value>,
}

/// Uniform result envelope across all modes
#[derive(Debug, Clone)]
pub struct RouterResult {
    pub nodes: Vec<ResultNode>,
    pub metadata: serde_json::Map<String, Value>,
}

/// Dispatches queries to the LOCAL, GLOBAL or DRIFT engines
pub struct SearchRouter<'a> {
    store: &'a ArtifactStore,
    gateway: LlmGateway,
    config: AppConfig,
}

impl<'a> SearchRouter<'a> {
    #[must_use]
    pub fn new(store: &'a ArtifactStore, gateway: LlmGateway, config: AppConfig) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    /// Resolve `auto` to a concrete mode
    ///
    /// Keyword lists come from the router configuration; with no keyword
    /// match, global wins when the community index exists, otherwise local.
    #[must_use]
    pub fn route(&self, query: &str, mode: SearchMode) -> SearchMode {
        if mode != SearchMode::Auto {
            return mode;
        }

        let query_lower = query.to_lowercase();
        if self
            .config
            .router
            .global_keywords
            .iter()
            .any(|kw| query_lower.contains(&kw.to_lowercase()))
        {
            return SearchMode::Global;
        }
        if self
            .config
            .router
            .local_keywords
            .iter()
            .any(|kw| query_lower.contains(&kw.to_lowercase()))
        {
            return SearchMode::Local;
        }

        if self.community_index_available() {
            SearchMode::Global
        } else {
            SearchMode::Local
        }
    }

    fn community_index_available(&self) -> bool {
        self.store.vector_table(VectorStoreRole::Community).is_ok()
    }

    /// Execute a query under the resolved mode
    ///
    /// # Errors
    ///
    /// Propagates provider and index errors from the selected engine.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<RouterResult> {
        let mode = self.route(query, options.mode);
        info!(mode = mode.as_str(), "search dispatched");

        let mut nodes = match mode {
            SearchMode::Local => self.search_local(query).await?,
            SearchMode::Global => self.search_global(query, options).await?,
            SearchMode::Drift => self.search_drift(query).await?,
            SearchMode::Auto => unreachable!("route() resolves auto"),
        };

        let mut metadata = serde_json::Map::new();
        metadata.insert("mode".to_string(), mode.as_str().into());
        metadata.insert("query".to_string(), query.into());

        // Normalize: an empty main response means no results at all
        if nodes.len() == 1 && nodes[0].text.is_empty() {
            nodes.clear();
        }
        Ok(RouterResult { nodes, metadata })
    }

    async fn search_local(&self, query: &str) -> Result<Vec<ResultNode>> {
        let engine = LocalSearchEngine::new(
            self.store,
            self.gateway.clone(),
            self.config.local_search.clone(),
        );
        let result = engine.search(query).await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("search_type".to_string(), "local".into());
        metadata.insert("num_entities".to_string(), result.entities.len().into());
        metadata.insert("num_text_units".to_string(), result.text_units.len().into());
        metadata.insert(
            "entities".to_string(),
            Value::Array(
                result
                    .entities
                    .iter()
                    .map(|e| {
                        json!({
                            "name": e.record.name,
                            "type": e.record.entity_type,
                            "hop": e.hop,
                            "score": e.score,
                        })
                    })
                    .collect(),
            ),
        );

        Ok(vec![ResultNode {
            text: result.response,
            score: 1.0,
            metadata,
        }])
    }

    async fn search_global(&self, query: &str, options: &SearchOptions) -> Result<Vec<ResultNode>> {
        let mut gs_config = self.config.global_search.clone();
        if let Some(response_type) = &options.response_type {
            gs_config.response_type.clone_from(response_type);
        }
        if let Some(min_rank) = options.min_community_rank {
            gs_config.min_community_rank = min_rank;
        }
        let include_key_points =
            gs_config.include_key_points || options.output_format == OutputFormat::Json;

        let engine = GlobalSearchEngine::new(self.store, self.gateway.clone(), gs_config)?;
        let result = engine.search(query).await?;

        if result.response.is_empty() && result.map_results.is_empty() {
            return Ok(Vec::new());
        }

        let mut metadata = serde_json::Map::new();
        metadata.insert("search_type".to_string(), "global".into());
        metadata.insert("response_type".to_string(), result.response_type.clone().into());
        metadata.insert("total_tokens".to_string(), result.total_tokens.into());
        metadata.insert(
            "processing_time".to_string(),
            json!(result.processing_time),
        );
        metadata.insert(
            "traceability".to_string(),
            serde_json::to_value(&result.traceability)?,
        );

        let mut nodes = vec![ResultNode {
            text: result.response.clone(),
            score: 1.0,
            metadata,
        }];

        if include_key_points {
            for map_result in &result.map_results {
                for kp in &map_result.key_points {
                    let mut kp_metadata = serde_json::Map::new();
                    kp_metadata.insert("type".to_string(), "key_point".into());
                    kp_metadata.insert("score".to_string(), kp.score.into());
                    kp_metadata.insert(
                        "report_ids".to_string(),
                        serde_json::to_value(&kp.report_ids)?,
                    );
                    kp_metadata.insert(
                        "source_metadata".to_string(),
                        serde_json::to_value(&kp.source_metadata)?,
                    );
                    kp_metadata.insert("batch_id".to_string(), map_result.batch_id.into());
                    nodes.push(ResultNode {
                        text: kp.description.clone(),
                        score: kp.score as f32 / 100.0,
                        metadata: kp_metadata,
                    });
                }
            }
        }

        Ok(nodes)
    }

    async fn search_drift(&self, query: &str) -> Result<Vec<ResultNode>> {
        let engine = DriftSearchEngine::new(
            self.store,
            self.gateway.clone(),
            self.config.drift_search.clone(),
        );
        let (response, context) = engine.search(query).await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("search_type".to_string(), "drift".into());
        metadata.insert("num_entities".to_string(), context.entities.len().into());
        metadata.insert(
            "num_communities".to_string(),
            context.communities.len().into(),
        );
        metadata.insert(
            "num_text_units".to_string(),
            context.text_units.len().into(),
        );
        metadata.insert(
            "valid".to_string(),
            DriftSearchEngine::validate_response(&response, query).into(),
        );

        Ok(vec![ResultNode {
            text: response,
            score: 1.0,
            metadata,
        }])
    }
}

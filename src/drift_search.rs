//! DRIFT search: parallel local+global fusion with context budgeting
//!
//! Runs the entity-anchored local pass and a simplified community pass
//! concurrently, fuses both into a single context, trims it to the token
//! budget and generates the response either in one piece or as a finite
//! stream of chunks.

use std::sync::Mutex;

use serde_json::{json, Value};
use tokio_stream::Iter;
use tracing::{debug, info};

use crate::config::{DriftSearchConfig, LocalSearchConfig};
use crate::llm::LlmGateway;
use crate::local_search::{LocalSearchEngine, TextUnit};
use crate::store::{ArtifactStore, CommunitySummaryRecord, EntityRecord};
use crate::vector::VectorStoreRole;
use crate::Result;

/// Fused retrieval context for one DRIFT query
#[derive(Debug, Clone, Default)]
pub struct SearchContext {
    pub query: String,
    pub entities: Vec<EntityRecord>,
    pub communities: Vec<CommunitySummaryRecord>,
    pub text_units: Vec<TextUnit>,
    pub metadata: serde_json::Map<String, Value>,
}

impl SearchContext {
    /// Rough token estimate: one token per four characters
    #[must_use]
    pub fn get_token_count(&self) -> usize {
        let mut chars = self.query.len();
        for entity in &self.entities {
            chars += entity.name.len() + entity.description.len();
        }
        for community in &self.communities {
            chars += community.title.len() + community.summary.len();
        }
        for unit in &self.text_units {
            chars += unit.text.len();
        }
        chars / 4
    }

    /// Drop context items until the estimate fits `max_tokens`
    ///
    /// Drop order: text units first, then entities, then communities; the
    /// query itself is never dropped.
    #[must_use]
    pub fn trim_to_token_limit(mut self, max_tokens: usize) -> Self {
        while !self.text_units.is_empty() && self.get_token_count() > max_tokens {
            self.text_units.pop();
        }
        while !self.entities.is_empty() && self.get_token_count() > max_tokens {
            self.entities.pop();
        }
        while !self.communities.is_empty() && self.get_token_count() > max_tokens {
            self.communities.pop();
        }
        self
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "query": self.query,
            "entities": self.entities.iter().map(|e| json!({
                "id": e.id, "name": e.name, "type": e.entity_type,
                "description": e.description,
            })).collect::<Vec<_>>(),
            "communities": self.communities.iter().map(|c| json!({
                "community_id": c.community_id, "title": c.title,
                "summary": c.summary, "rank": c.rank,
            })).collect::<Vec<_>>(),
            "text_units": self.text_units.iter().map(|t| json!({
                "id": t.id, "text": t.text, "document_id": t.document_id,
            })).collect::<Vec<_>>(),
            "metadata": Value::Object(self.metadata.clone()),
        })
    }
}

/// Hybrid local+global search engine
pub struct DriftSearchEngine<'a> {
    store: &'a ArtifactStore,
    gateway: LlmGateway,
    config: DriftSearchConfig,
    last_context: Mutex<Option<Value>>,
}

impl<'a> DriftSearchEngine<'a> {
    #[must_use]
    pub fn new(store: &'a ArtifactStore, gateway: LlmGateway, config: DriftSearchConfig) -> Self {
        Self {
            store,
            gateway,
            config,
            last_context: Mutex::new(None),
        }
    }

    /// Build the fused, trimmed context for a query
    ///
    /// # Errors
    ///
    /// Returns `Error::Index` on embedding failure; missing indexes
    /// contribute empty sections instead of failing.
    pub async fn build_context(&self, query: &str) -> Result<SearchContext> {
        let local_config = LocalSearchConfig {
            entity_top_k: self.config.local_search.entity_top_k,
            max_hops: self.config.local_search.relationship_depth,
            top_entities: 5,
            text_unit_top_k: self.config.local_search.text_unit_top_k,
        };
        let local_engine = LocalSearchEngine::new(self.store, self.gateway.clone(), local_config);

        let (local_results, global_results) = tokio::join!(
            local_engine.retrieve(query),
            self.search_communities(query)
        );
        let (ranked, text_units) = local_results?;
        let communities = global_results?;

        let entities: Vec<EntityRecord> = ranked.into_iter().map(|r| r.record).collect();
        let mut metadata = serde_json::Map::new();
        metadata.insert("query".to_string(), query.into());
        metadata.insert("num_entities".to_string(), entities.len().into());
        metadata.insert("num_communities".to_string(), communities.len().into());
        metadata.insert("num_text_units".to_string(), text_units.len().into());
        metadata.insert(
            "max_tokens".to_string(),
            self.config.context.max_tokens.into(),
        );

        let context = SearchContext {
            query: query.to_string(),
            entities,
            communities,
            text_units,
            metadata,
        };
        let trimmed = context.trim_to_token_limit(self.config.context.max_tokens);
        info!(
            entities = trimmed.entities.len(),
            communities = trimmed.communities.len(),
            text_units = trimmed.text_units.len(),
            "drift context built"
        );
        Ok(trimmed)
    }

    /// Simplified global pass: top communities straight from the index
    async fn search_communities(&self, query: &str) -> Result<Vec<CommunitySummaryRecord>> {
        let table = match self.store.vector_table(VectorStoreRole::Community) {
            Ok(table) => table,
            Err(e) if e.is_not_found() => {
                debug!("community index absent for drift search");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let hits = table
            .query(query, self.config.global_search.community_top_k)
            .await?;
        Ok(hits
            .into_iter()
            .map(|hit| CommunitySummaryRecord {
                community_id: hit
                    .node
                    .metadata
                    .get("community_id")
                    .and_then(Value::as_i64)
                    .unwrap_or_default(),
                title: hit
                    .node
                    .metadata
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                summary: hit.node.text.clone(),
                key_entities: hit
                    .node
                    .metadata
                    .get("key_entities")
                    .and_then(Value::as_array)
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(Value::as_str)
                            .map(ToString::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                occurrence: hit
                    .node
                    .metadata
                    .get("occurrence")
                    .and_then(Value::as_f64)
                    .unwrap_or(1.0),
                rank: hit
                    .node
                    .metadata
                    .get("rank")
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
            })
            .collect())
    }

    /// Non-streaming search: returns the response and the context it used
    ///
    /// # Errors
    ///
    /// Returns `Error::Provider` when response generation fails.
    pub async fn search(&self, query: &str) -> Result<(String, SearchContext)> {
        let context = self.build_context(query).await?;
        let response = self.generate_response(&context).await?;
        Ok((response, context))
    }

    /// Streaming search: a finite sequence of chunks of at least
    /// `chunk_size` characters (the final chunk drains the remainder)
    ///
    /// The context used is stored for [`Self::get_last_context`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Provider` when response generation fails.
    pub async fn search_streaming(&self, query: &str) -> Result<Iter<std::vec::IntoIter<String>>> {
        let context = self.build_context(query).await?;
        *self.last_context.lock().expect("context lock poisoned") = Some(context.to_value());

        let response = self.generate_response(&context).await?;
        let chunks = if self.config.response.streaming_enabled {
            chunk_string(&response, self.config.response.chunk_size)
        } else {
            vec![response]
        };
        Ok(tokio_stream::iter(chunks))
    }

    /// Context of the last streaming search, if any
    #[must_use]
    pub fn get_last_context(&self) -> Option<Value> {
        self.last_context
            .lock()
            .expect("context lock poisoned")
            .clone()
    }

    async fn generate_response(&self, context: &SearchContext) -> Result<String> {
        let prompt = drift_prompt(context);
        self.gateway.complete(&prompt).await
    }

    /// Quality gate: long enough and addressing the query terms
    ///
    /// A response shorter than 50 characters, or containing fewer than 30%
    /// of the query terms, is invalid. Callers decide the policy.
    #[must_use]
    pub fn validate_response(response: &str, query: &str) -> bool {
        if response.len() < 50 {
            return false;
        }
        let response_lower = response.to_lowercase();
        let terms: Vec<&str> = query.split_whitespace().collect();
        if terms.is_empty() {
            return true;
        }
        let matching = terms
            .iter()
            .filter(|term| response_lower.contains(&term.to_lowercase()))
            .count();
        (matching as f64) >= (terms.len() as f64) * 0.3
    }
}

fn drift_prompt(context: &SearchContext) -> String {
    let mut sections = Vec::new();

    if !context.entities.is_empty() {
        let lines: Vec<String> = context
            .entities
            .iter()
            .take(10)
            .map(|e| format!("- {} ({}): {}", e.name, e.entity_type, e.description))
            .collect();
        sections.push(format!("## Relevant entities\n{}", lines.join("\n")));
    }
    if !context.communities.is_empty() {
        let lines: Vec<String> = context
            .communities
            .iter()
            .take(5)
            .map(|c| format!("- {}: {}", c.title, c.summary))
            .collect();
        sections.push(format!("## Knowledge communities\n{}", lines.join("\n")));
    }
    if !context.text_units.is_empty() {
        let lines: Vec<String> = context
            .text_units
            .iter()
            .take(5)
            .map(|t| {
                let mut end = t.text.len().min(200);
                while end > 0 && !t.text.is_char_boundary(end) {
                    end -= 1;
                }
                format!("- {}", &t.text[..end])
            })
            .collect();
        sections.push(format!("## Source fragments\n{}", lines.join("\n")));
    }

    format!(
        "Answer the question below by synthesizing the provided context. \
         Prefer concrete facts from the entities, use the communities for \
         broader framing, and cite source fragments to support claims.\n\n\
         {}\n\nQuestion: {}\n\nAnswer:",
        sections.join("\n\n"),
        context.query
    )
}

/// Split a string into chunks of `size` characters; the final chunk carries
/// the remainder
fn chunk_string(text: &str, size: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let size = size.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if current.chars().count() >= size {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

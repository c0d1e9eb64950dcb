//! GLOBAL search: map-reduce over weighted community reports
//!
//! Four phases: context selection from the community index, greedy batching
//! under a token budget, a semaphore-bounded parallel map extracting key
//! points, and a reduce step that synthesizes the final answer. Map failures
//! degrade to empty batches; a reduce failure degrades to an auto-generated
//! enumeration of the top key points. The whole query only fails on
//! structural errors.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::GlobalSearchConfig;
use crate::llm::{extract_json, LlmGateway};
use crate::store::ArtifactStore;
use crate::vector::VectorStoreRole;
use crate::{Error, Result};

/// Token measurement used for context budgeting
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Default estimator: one token per four characters
pub struct CharEstimator;

impl TokenCounter for CharEstimator {
    fn count(&self, text: &str) -> usize {
        text.len() / 4
    }
}

/// One community report pulled from the community index
#[derive(Debug, Clone)]
pub struct CommunityReport {
    pub id: String,
    pub title: String,
    pub content: String,
    pub rank: i64,
    pub weight: f64,
    pub metadata: serde_json::Map<String, Value>,
}

/// A batch of reports fitting the map-phase token budget
#[derive(Debug, Clone)]
pub struct ContextBatch {
    pub context: String,
    pub report_ids: Vec<String>,
    pub records: Vec<CommunityReport>,
    pub tokens: usize,
}

/// Provenance carried by each key point
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceMetadata {
    pub document_ids: Vec<String>,
    pub chunk_ids: Vec<String>,
    pub entity_ids: Vec<String>,
}

/// An LLM-extracted claim from one map batch
#[derive(Debug, Clone, Serialize)]
pub struct KeyPoint {
    pub description: String,
    /// Importance in 0..=100
    pub score: i64,
    pub report_ids: Vec<String>,
    pub source_metadata: SourceMetadata,
}

/// Outcome of one map task
#[derive(Debug, Clone, Serialize)]
pub struct MapResult {
    pub batch_id: usize,
    pub key_points: Vec<KeyPoint>,
    pub context_tokens: usize,
    pub processing_time: f64,
}

/// Union of identifiers touched by the answer
#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceabilityInfo {
    pub report_ids: Vec<String>,
    pub document_ids: Vec<String>,
    pub chunk_ids: Vec<String>,
    pub entity_ids: Vec<String>,
}

/// Final result of a GLOBAL search
#[derive(Debug, Clone, Serialize)]
pub struct GlobalSearchResult {
    pub response: String,
    pub response_type: String,
    pub map_results: Vec<MapResult>,
    pub traceability: TraceabilityInfo,
    pub total_tokens: usize,
    pub processing_time: f64,
}

const REPORT_TOP_K: usize = 50;
const REDUCE_TOP_KEY_POINTS: usize = 20;
const FALLBACK_KEY_POINTS: usize = 10;
const CONTEXT_HEADER: &str = "-----Reports-----\nid|title|content|rank|weight\n";

/// Map-reduce search over the community index
pub struct GlobalSearchEngine<'a> {
    store: &'a ArtifactStore,
    gateway: LlmGateway,
    config: GlobalSearchConfig,
    token_counter: Arc<dyn TokenCounter>,
}

impl std::fmt::Debug for GlobalSearchEngine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalSearchEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<'a> GlobalSearchEngine<'a> {
    /// # Errors
    ///
    /// Returns `Error::Config` when community weighting is disabled.
    pub fn new(
        store: &'a ArtifactStore,
        gateway: LlmGateway,
        config: GlobalSearchConfig,
    ) -> Result<Self> {
        if !config.include_community_weight {
            return Err(Error::Config(
                "community weighting is mandatory for global search".to_string(),
            ));
        }
        Ok(Self {
            store,
            gateway,
            config,
            token_counter: Arc::new(CharEstimator),
        })
    }

    /// Replace the token estimator with a real encoder
    #[must_use]
    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.token_counter = counter;
        self
    }

    /// Execute all four phases
    ///
    /// # Errors
    ///
    /// Returns `Error::Index` on embedding failure while querying the
    /// community index; map and reduce failures degrade instead of erroring.
    pub async fn search(&self, query: &str) -> Result<GlobalSearchResult> {
        let started = Instant::now();

        let batches = self.build_context(query).await?;
        if batches.is_empty() {
            debug!("no community context for query");
            return Ok(GlobalSearchResult {
                response: String::new(),
                response_type: self.config.response_type.clone(),
                map_results: Vec::new(),
                traceability: TraceabilityInfo::default(),
                total_tokens: 0,
                processing_time: started.elapsed().as_secs_f64(),
            });
        }
        info!(batches = batches.len(), "global map phase starting");

        let map_results = self.run_map(&batches, query).await;
        Ok(self.reduce(map_results, query, started).await)
    }

    /// Phase 1 and 2: retrieve, filter, weight, shuffle and batch reports
    ///
    /// # Errors
    ///
    /// Returns `Error::Index` on embedding failure.
    pub async fn build_context(&self, query: &str) -> Result<Vec<ContextBatch>> {
        let table = match self.store.vector_table(VectorStoreRole::Community) {
            Ok(table) => table,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let hits = table.query(query, REPORT_TOP_K).await?;
        let mut reports: Vec<CommunityReport> = hits
            .into_iter()
            .map(|hit| {
                let rank = hit
                    .node
                    .metadata
                    .get("rank")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let title = hit
                    .node
                    .metadata
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or("Report")
                    .to_string();
                CommunityReport {
                    id: hit.node.id.clone(),
                    title,
                    content: hit.node.text.clone(),
                    rank,
                    weight: 1.0,
                    metadata: hit.node.metadata.clone(),
                }
            })
            .filter(|report| report.rank >= self.config.min_community_rank)
            .collect();

        apply_community_weights(&mut reports, true);

        if self.config.shuffle_data {
            let mut rng = StdRng::seed_from_u64(self.config.random_state);
            reports.shuffle(&mut rng);
        }

        Ok(self.create_batches(reports))
    }

    /// Greedy packing under `max_context_tokens`, measured with the
    /// configured counter
    fn create_batches(&self, reports: Vec<CommunityReport>) -> Vec<ContextBatch> {
        let header_tokens = self.token_counter.count(CONTEXT_HEADER);
        let row_budget = self
            .config
            .max_context_tokens
            .saturating_sub(header_tokens);

        let mut batches = Vec::new();
        let mut current = self.empty_batch(header_tokens);

        for report in reports {
            let row = self.fit_row(&report, row_budget);
            let row_tokens = self.token_counter.count(&row);

            if !current.records.is_empty()
                && current.tokens + row_tokens > self.config.max_context_tokens
            {
                batches.push(current);
                current = self.empty_batch(header_tokens);
            }

            current.context.push_str(&row);
            current.tokens += row_tokens;
            current.report_ids.push(report.id.clone());
            current.records.push(report);
        }
        if !current.records.is_empty() {
            batches.push(current);
        }

        debug!(batches = batches.len(), "reports batched");
        batches
    }

    fn empty_batch(&self, header_tokens: usize) -> ContextBatch {
        ContextBatch {
            context: CONTEXT_HEADER.to_string(),
            report_ids: Vec::new(),
            records: Vec::new(),
            tokens: header_tokens,
        }
    }

    /// Format one report row, truncating the content until it fits the
    /// per-row budget
    fn fit_row(&self, report: &CommunityReport, row_budget: usize) -> String {
        let mut content = report.content.replace('\n', " ");
        loop {
            let row = format!(
                "{}|{}|{}|{}|{:.3}\n",
                report.id, report.title, content, report.rank, report.weight
            );
            if self.token_counter.count(&row) <= row_budget || content.is_empty() {
                return row;
            }
            let mut new_len = content.len() / 2;
            while new_len > 0 && !content.is_char_boundary(new_len) {
                new_len -= 1;
            }
            content.truncate(new_len);
        }
    }

    /// Phase 3: parallel map bounded by `max_concurrent`
    ///
    /// A failing task yields an empty `MapResult` rather than failing the
    /// query; results come back in batch order.
    async fn run_map(&self, batches: &[ContextBatch], query: &str) -> Vec<MapResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));

        let tasks = batches.iter().enumerate().map(|(batch_id, batch)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let started = Instant::now();
                let prompt = map_prompt(&batch.context, query, &self.config.response_type);

                let key_points = match self.gateway.complete(&prompt).await {
                    Ok(response) => parse_key_points(&response, batch),
                    Err(e) => {
                        warn!(batch_id, error = %e, "map task failed, emitting empty batch");
                        Vec::new()
                    }
                };
                MapResult {
                    batch_id,
                    key_points,
                    context_tokens: batch.tokens,
                    processing_time: started.elapsed().as_secs_f64(),
                }
            }
        });

        futures::future::join_all(tasks).await
    }

    /// Phase 4: pool, rank and synthesize
    async fn reduce(
        &self,
        map_results: Vec<MapResult>,
        query: &str,
        started: Instant,
    ) -> GlobalSearchResult {
        let mut all_points: Vec<KeyPoint> = map_results
            .iter()
            .flat_map(|r| r.key_points.iter().cloned())
            .collect();
        // Stable: equal scores keep production order
        all_points.sort_by_key(|kp| std::cmp::Reverse(kp.score));
        let top_points = &all_points[..all_points.len().min(REDUCE_TOP_KEY_POINTS)];

        let context = reduce_context(top_points);
        let prompt = reduce_prompt(
            &context,
            query,
            &self.config.response_type,
            self.config.max_response_length,
        );

        let response = match self.gateway.complete(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "reduce call failed, using fallback response");
                fallback_response(top_points, query)
            }
        };

        let traceability = build_traceability(&all_points);
        let total_tokens = map_results.iter().map(|r| r.context_tokens).sum();

        GlobalSearchResult {
            response,
            response_type: self.config.response_type.clone(),
            map_results,
            traceability,
            total_tokens,
            processing_time: started.elapsed().as_secs_f64(),
        }
    }
}

/// Weight = `occurrence`, optionally max-normalized, then a stable sort by
/// weight descending
fn apply_community_weights(reports: &mut [CommunityReport], normalize: bool) {
    for report in reports.iter_mut() {
        report.weight = report
            .metadata
            .get("occurrence")
            .and_then(Value::as_f64)
            .unwrap_or(1.0)
            .max(0.0);
    }
    if normalize {
        let max_weight = reports.iter().map(|r| r.weight).fold(0.0f64, f64::max);
        if max_weight > 0.0 {
            for report in reports.iter_mut() {
                report.weight /= max_weight;
            }
        }
    }
    reports.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn map_prompt(context: &str, query: &str, response_type: &str) -> String {
    format!(
        "You are analyzing community reports to answer a question. Identify \
         the key points from the reports that are relevant to the question.\n\
         Each key point must have 'description' (one claim), 'score' (0-100 \
         importance) and 'report_ids' (ids of the supporting reports).\n\
         The final answer will be assembled as {response_type}.\n\
         Output a JSON object with a 'key_points' array, enclosed within \
         [START_JSON] and [END_JSON] tags.\n\n\
         {context}\n\
         Question: {query}"
    )
}

fn reduce_prompt(report_data: &str, query: &str, response_type: &str, max_length: usize) -> String {
    format!(
        "You are synthesizing a final answer from ranked key points extracted \
         from community reports.\n\
         Respond as {response_type}, at most {max_length} words, using only \
         the key points below. Merge overlapping points and keep the most \
         important ones first.\n\n\
         {report_data}\n\n\
         Question: {query}"
    )
}

/// Parse map output: a `key_points` object, a bare array, or free text
fn parse_key_points(response: &str, batch: &ContextBatch) -> Vec<KeyPoint> {
    let parsed = extract_json(response).or_else(|| bare_array(response));

    if let Some(value) = parsed {
        let items = match value {
            Value::Object(ref map) => map.get("key_points").and_then(Value::as_array).cloned(),
            Value::Array(items) => Some(items),
            _ => None,
        };
        if let Some(items) = items {
            let points: Vec<KeyPoint> = items
                .iter()
                .filter_map(|item| key_point_from_value(item, batch))
                .collect();
            if !points.is_empty() {
                return points;
            }
        }
    }

    key_points_from_text(response, batch)
}

fn bare_array(text: &str) -> Option<Value> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if start >= end {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

fn key_point_from_value(item: &Value, batch: &ContextBatch) -> Option<KeyPoint> {
    let obj = item.as_object()?;
    let description = obj.get("description")?.as_str()?.trim().to_string();
    if description.is_empty() {
        return None;
    }
    let score = obj
        .get("score")
        .and_then(Value::as_i64)
        .or_else(|| obj.get("score").and_then(Value::as_f64).map(|f| f as i64))
        .unwrap_or(50)
        .clamp(0, 100);
    let mut report_ids: Vec<String> = obj
        .get("report_ids")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();
    if report_ids.is_empty() {
        report_ids = default_report_ids(batch);
    }
    let source_metadata = collect_source_metadata(&batch.records, &report_ids);
    Some(KeyPoint {
        description,
        score,
        report_ids,
        source_metadata,
    })
}

/// Fallback extraction from free text: paragraphs and bullet items longer
/// than 20 characters, scored by position
fn key_points_from_text(text: &str, batch: &ContextBatch) -> Vec<KeyPoint> {
    let paragraph_split = Regex::new(r"\n\s*\n").expect("static regex");
    let bullet = Regex::new(r"(?m)^\s*(?:[-*\u{2022}]|\d+\.)\s+(.+)$").expect("static regex");

    let report_ids = default_report_ids(batch);
    let source_metadata = collect_source_metadata(&batch.records, &report_ids);

    let mut points = Vec::new();
    for (index, paragraph) in paragraph_split.split(text.trim()).enumerate() {
        let paragraph = paragraph.trim();
        if paragraph.len() <= 20 {
            continue;
        }
        let score = (100 - 10 * index as i64).max(50);

        let items: Vec<&str> = bullet
            .captures_iter(paragraph)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().trim())
            .filter(|item| item.len() > 20)
            .collect();
        if items.is_empty() {
            points.push(KeyPoint {
                description: paragraph.to_string(),
                score,
                report_ids: report_ids.clone(),
                source_metadata: source_metadata.clone(),
            });
        } else {
            for item in items {
                points.push(KeyPoint {
                    description: item.to_string(),
                    score,
                    report_ids: report_ids.clone(),
                    source_metadata: source_metadata.clone(),
                });
            }
        }
    }
    points
}

fn default_report_ids(batch: &ContextBatch) -> Vec<String> {
    batch.report_ids.iter().take(3).cloned().collect()
}

fn collect_source_metadata(records: &[CommunityReport], report_ids: &[String]) -> SourceMetadata {
    let mut document_ids = BTreeSet::new();
    let mut chunk_ids = BTreeSet::new();
    let mut entity_ids = BTreeSet::new();

    for record in records {
        if !report_ids.contains(&record.id) {
            continue;
        }
        collect_ids(&record.metadata, "document_ids", "document_id", &mut document_ids);
        collect_ids(&record.metadata, "chunk_ids", "chunk_id", &mut chunk_ids);
        collect_ids(&record.metadata, "entity_ids", "entity_id", &mut entity_ids);
    }

    SourceMetadata {
        document_ids: document_ids.into_iter().collect(),
        chunk_ids: chunk_ids.into_iter().collect(),
        entity_ids: entity_ids.into_iter().collect(),
    }
}

fn collect_ids(
    metadata: &serde_json::Map<String, Value>,
    plural: &str,
    singular: &str,
    out: &mut BTreeSet<String>,
) {
    if let Some(ids) = metadata.get(plural).and_then(Value::as_array) {
        out.extend(ids.iter().filter_map(Value::as_str).map(ToString::to_string));
    }
    if let Some(id) = metadata.get(singular).and_then(Value::as_str) {
        out.insert(id.to_string());
    }
}

fn reduce_context(key_points: &[KeyPoint]) -> String {
    let mut lines = vec![
        "-----Key Points-----".to_string(),
        "score|description|report_ids".to_string(),
        String::new(),
    ];
    for kp in key_points {
        let ids = kp
            .report_ids
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join(";");
        lines.push(format!("{}|{}|{}", kp.score, kp.description, ids));
    }
    lines.join("\n")
}

fn fallback_response(key_points: &[KeyPoint], query: &str) -> String {
    let mut lines = vec![format!("Information related to \"{query}\":"), String::new()];
    for (i, kp) in key_points.iter().take(FALLBACK_KEY_POINTS).enumerate() {
        lines.push(format!("{}. {}", i + 1, kp.description));
    }
    lines.push(String::new());
    lines.push("(note: this response was generated automatically)".to_string());
    lines.join("\n")
}

fn build_traceability(key_points: &[KeyPoint]) -> TraceabilityInfo {
    let mut report_ids = BTreeSet::new();
    let mut document_ids = BTreeSet::new();
    let mut chunk_ids = BTreeSet::new();
    let mut entity_ids = BTreeSet::new();

    for kp in key_points {
        report_ids.extend(kp.report_ids.iter().cloned());
        document_ids.extend(kp.source_metadata.document_ids.iter().cloned());
        chunk_ids.extend(kp.source_metadata.chunk_ids.iter().cloned());
        entity_ids.extend(kp.source_metadata.entity_ids.iter().cloned());
    }

    TraceabilityInfo {
        report_ids: report_ids.into_iter().collect(),
        document_ids: document_ids.into_iter().collect(),
        chunk_ids: chunk_ids.into_iter().collect(),
        entity_ids: entity_ids.into_iter().collect(),
    }
}

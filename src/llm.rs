//! LLM gateway: bounded, continuation-aware completion calls
//!
//! Every LLM call in the crate goes through [`LlmGateway`]. The gateway owns
//! the continuation protocol for responses cut off at the provider's token
//! limit and the `[START_JSON]`/`[END_JSON]` extraction contract shared by
//! all prompts.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{AnthropicConfig, AppConfig, BedrockConfig, LlmProviderKind};
use crate::{Error, Result};

/// Why the provider stopped generating
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Natural end of the response
    EndTurn,
    /// The response hit the provider's output token limit
    MaxTokens,
    /// Any other provider-specific reason
    Other(String),
}

impl StopReason {
    fn from_provider(raw: &str) -> Self {
        match raw {
            "end_turn" | "stop_sequence" => Self::EndTurn,
            "max_tokens" => Self::MaxTokens,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A single completion with its stop reason
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub stop_reason: StopReason,
}

/// Narrow capability set over an LLM transport
///
/// Implementations must report truncation through a stop reason
/// distinguishable from natural completion.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Issue one completion call
    ///
    /// # Errors
    ///
    /// Returns `Error::Provider` on transport or authentication failure.
    async fn complete(&self, prompt: &str) -> Result<Completion>;
}

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Deserialize)]
struct MessagesContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<MessagesContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

impl MessagesResponse {
    fn into_completion(self) -> Completion {
        let text = self
            .content
            .iter()
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("");
        let stop_reason = self
            .stop_reason
            .as_deref()
            .map_or(StopReason::EndTurn, StopReason::from_provider);
        Completion { text, stop_reason }
    }
}

/// Provider backed by the Anthropic Messages API
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    /// Create a provider from configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when `ANTHROPIC_API_KEY` is not set.
    pub fn new(config: &AnthropicConfig) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            Error::Config("ANTHROPIC_API_KEY environment variable is required".to_string())
        })?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: config
                .api_base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_API_URL.to_string()),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(&self, prompt: &str) -> Result<Completion> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("anthropic request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "anthropic returned {status}: {detail}"
            )));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("anthropic response malformed: {e}")))?;
        Ok(parsed.into_completion())
    }
}

/// Provider backed by AWS Bedrock (Anthropic models)
pub struct BedrockProvider {
    client: aws_sdk_bedrockruntime::Client,
    model: String,
    max_tokens: u32,
}

impl BedrockProvider {
    /// Create a provider; credentials come from the default AWS chain
    pub async fn new(config: &BedrockConfig) -> Self {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;
        Self {
            client: aws_sdk_bedrockruntime::Client::new(&aws_config),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl LlmProvider for BedrockProvider {
    async fn complete(&self, prompt: &str) -> Result<Completion> {
        let body = serde_json::json!({
            "anthropic_version": "bedrock-2023-05-31",
            "max_tokens": self.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });

        let output = self
            .client
            .invoke_model()
            .model_id(&self.model)
            .content_type("application/json")
            .accept("application/json")
            .body(aws_sdk_bedrockruntime::primitives::Blob::new(
                body.to_string(),
            ))
            .send()
            .await
            .map_err(|e| Error::Provider(format!("bedrock invoke failed: {e}")))?;

        let parsed: MessagesResponse = serde_json::from_slice(&output.body.into_inner())
            .map_err(|e| Error::Provider(format!("bedrock response malformed: {e}")))?;
        Ok(parsed.into_completion())
    }
}

/// Build the provider selected by the configuration
///
/// # Errors
///
/// Returns `Error::Config` when the selected provider's credentials are
/// missing.
pub async fn build_provider(config: &AppConfig) -> Result<Arc<dyn LlmProvider>> {
    match config.llm_provider {
        LlmProviderKind::Anthropic => Ok(Arc::new(AnthropicProvider::new(&config.anthropic)?)),
        LlmProviderKind::Bedrock => Ok(Arc::new(BedrockProvider::new(&config.bedrock).await)),
    }
}

/// Stitch a continuation onto a partial response
///
/// Appends only the part of `next` that does not overlap the tail of
/// `previous`; overlaps are searched up to 200 characters. Stitching the same
/// continuation twice is a no-op.
#[must_use]
pub fn stitch_responses(previous: &str, next: &str) -> String {
    if previous.is_empty() {
        return next.to_string();
    }
    if next.is_empty() || previous.ends_with(next) {
        return previous.to_string();
    }

    let window = previous.len().min(next.len()).min(200);
    for k in (1..=window).rev() {
        if next.is_char_boundary(k) && previous.ends_with(&next[..k]) {
            return format!("{previous}{}", &next[k..]);
        }
    }
    format!("{previous}{next}")
}

const START_JSON_TAG: &str = "[START_JSON]";
const END_JSON_TAG: &str = "[END_JSON]";

/// Extract a JSON value from an LLM response
///
/// The primary contract is an explicit `[START_JSON]`/`[END_JSON]` block;
/// fenced code blocks and a bare outermost `{...}` are tolerated as
/// fallbacks. The tagged block wins when both are present.
#[must_use]
pub fn extract_json(text: &str) -> Option<Value> {
    let candidate = json_candidate(text)?;
    serde_json::from_str(&candidate).ok()
}

/// Extract a JSON value, surfacing the failure
///
/// # Errors
///
/// Returns `Error::Parse` when no parseable JSON is present.
pub fn extract_json_strict(text: &str) -> Result<Value> {
    extract_json(text)
        .ok_or_else(|| Error::Parse(format!("no parseable JSON in response: {}", preview(text))))
}

fn json_candidate(text: &str) -> Option<String> {
    if let (Some(start), Some(end)) = (text.find(START_JSON_TAG), text.rfind(END_JSON_TAG)) {
        if start < end {
            return Some(text[start + START_JSON_TAG.len()..end].trim().to_string());
        }
    }

    let mut trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        trimmed = rest.strip_suffix("```").unwrap_or(rest);
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        trimmed = rest.strip_suffix("```").unwrap_or(rest);
    }
    let trimmed = trimmed.trim();

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if start < end {
        Some(trimmed[start..=end].to_string())
    } else {
        None
    }
}

fn preview(text: &str) -> String {
    let end = text
        .char_indices()
        .take(120)
        .last()
        .map_or(0, |(i, c)| i + c.len_utf8());
    text[..end].to_string()
}

/// The single chokepoint for LLM calls
///
/// Wraps a provider with the continuation protocol: when the provider
/// reports truncation, or the accumulated text does not yet satisfy the JSON
/// contract, the gateway re-prompts with the partial response and stitches
/// the continuation on.
#[derive(Clone)]
pub struct LlmGateway {
    provider: Arc<dyn LlmProvider>,
    max_continuation_attempts: usize,
}

impl LlmGateway {
    #[must_use]
    pub fn new(provider: Arc<dyn LlmProvider>, max_continuation_attempts: usize) -> Self {
        Self {
            provider,
            max_continuation_attempts: max_continuation_attempts.max(1),
        }
    }

    /// Issue a single call without continuation handling
    ///
    /// # Errors
    ///
    /// Returns `Error::Provider` on transport failure.
    pub async fn complete(&self, prompt: &str) -> Result<String> {
        Ok(self.provider.complete(prompt).await?.text)
    }

    /// Issue a logical call expected to produce a JSON response
    ///
    /// Continues until the accumulated text parses as JSON or the attempt
    /// budget runs out; the raw text is returned either way so the caller
    /// decides how to treat an incomplete response.
    ///
    /// # Errors
    ///
    /// Returns `Error::Provider` on transport failure.
    pub async fn complete_with_continuation(&self, prompt: &str) -> Result<String> {
        let mut full_text = String::new();
        let mut attempts = 0;

        while attempts < self.max_continuation_attempts {
            attempts += 1;
            let current_prompt = if attempts == 1 {
                prompt.to_string()
            } else {
                continuation_prompt(prompt, &full_text)
            };

            let completion = self.provider.complete(&current_prompt).await?;
            full_text = stitch_responses(&full_text, &completion.text);

            if extract_json(&full_text).is_some() {
                if completion.stop_reason == StopReason::MaxTokens {
                    debug!(attempts, "JSON complete despite max_tokens stop");
                }
                return Ok(full_text);
            }

            if completion.stop_reason == StopReason::MaxTokens {
                debug!(attempts, "response truncated at token limit, continuing");
            } else {
                debug!(attempts, "response not yet valid JSON, continuing");
            }
        }

        warn!(
            attempts,
            "JSON parsing failed after all continuation attempts; returning raw text"
        );
        Ok(full_text)
    }
}

fn continuation_prompt(original: &str, partial: &str) -> String {
    format!(
        "{original}\n\n\
         The previous response was cut off before completion. \
         Continue it from exactly where it stopped.\n\
         Response so far:\n```\n{partial}\n```\n\
         Continue the response."
    )
}

/// Prompt asking for entities and relationships of one chunk
#[must_use]
pub fn extraction_prompt(text: &str) -> String {
    format!(
        "Extract entities and relationships from the following text.\n\
         Entities must have a 'name' and 'type'.\n\
         Relationships must have 'source', 'target', 'type', and 'description'.\n\
         Output the result as a JSON object with two keys: 'entities' (list of \
         entity objects) and 'relationships' (list of relationship objects).\n\
         IMPORTANT: Only output the JSON object, enclosed within [START_JSON] and \
         [END_JSON] tags. Do not include any other text or markdown formatting \
         outside these tags.\n\n\
         Example JSON format:\n\
         [START_JSON]\n\
         {{\n\
             \"entities\": [\n\
                 {{\"name\": \"Alice\", \"type\": \"Person\"}},\n\
                 {{\"name\": \"Microsoft\", \"type\": \"Organization\"}}\n\
             ],\n\
             \"relationships\": [\n\
                 {{\"source\": \"Alice\", \"target\": \"Microsoft\", \"type\": \
         \"works_for\", \"description\": \"Alice works for Microsoft\"}}\n\
             ]\n\
         }}\n\
         [END_JSON]\n\n\
         Text: {text}"
    )
}

/// Prompt asking for a community summary
#[must_use]
pub fn summary_prompt(text: &str) -> String {
    format!(
        "Summarize the following text, focusing on key entities and their \
         relationships.\n\
         Provide a concise title, a summary, and a list of key entities \
         mentioned.\n\
         Output the result as a JSON object with keys: 'title' (string), \
         'summary' (string), 'key_entities' (list of strings), and optionally \
         'occurrence' (number).\n\
         IMPORTANT: Only output the JSON object, enclosed within [START_JSON] and \
         [END_JSON] tags. Do not include any other text or markdown formatting \
         outside these tags.\n\n\
         Example JSON format:\n\
         [START_JSON]\n\
         {{\n\
             \"title\": \"Acme and its staff\",\n\
             \"summary\": \"This community discusses...\",\n\
             \"key_entities\": [\"Entity A\", \"Entity B\"]\n\
         }}\n\
         [END_JSON]\n\n\
         Text: {text}"
    )
}

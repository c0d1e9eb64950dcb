//! Shared fixtures for the end-to-end tests: a scriptable LLM provider and a
//! deterministic embedder

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use graphrag::embedding::Embedder;
use graphrag::llm::{Completion, LlmProvider, StopReason};
use graphrag::Result;

/// Embeds by hashing alphanumeric terms into buckets; stable across runs
pub struct DeterministicEmbedder;

impl Embedder for DeterministicEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; 64];
                for term in text
                    .to_lowercase()
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|t| !t.is_empty())
                {
                    let mut h = 11usize;
                    for b in term.bytes() {
                        h = h.wrapping_mul(31).wrapping_add(b as usize);
                    }
                    v[h % 64] += 1.0;
                }
                v
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        64
    }
}

pub const EXTRACTION_RESPONSE: &str = r#"[START_JSON]{
    "entities": [
        {"name": "Alice", "type": "Person"},
        {"name": "Bob", "type": "Person"},
        {"name": "Acme", "type": "Organization"}
    ],
    "relationships": [
        {"source": "Alice", "target": "Acme", "type": "works_for",
         "description": "Alice works at Acme"},
        {"source": "Bob", "target": "Acme", "type": "works_for",
         "description": "Bob works at Acme"}
    ]
}[END_JSON]"#;

pub const SUMMARY_RESPONSE: &str = r#"[START_JSON]{
    "title": "Acme and its staff",
    "summary": "Alice and Bob are people working at the Acme organization.",
    "key_entities": ["Alice", "Bob", "Acme"],
    "occurrence": 2.0
}[END_JSON]"#;

pub const MAP_RESPONSE: &str = r#"[START_JSON]{
    "key_points": [
        {"description": "Acme employs both Alice and Bob", "score": 95},
        {"description": "Acme is the central organization of the corpus", "score": 80}
    ]
}[END_JSON]"#;

pub const REDUCE_RESPONSE: &str =
    "Overall, the corpus describes Acme, an organization employing Alice and Bob.";

/// Answers each prompt kind with a canned response and counts every call
pub struct MockProvider {
    pub calls: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(&self, prompt: &str) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = if prompt.starts_with("Extract entities and relationships") {
            EXTRACTION_RESPONSE.to_string()
        } else if prompt.starts_with("Summarize the following text") {
            SUMMARY_RESPONSE.to_string()
        } else if prompt.starts_with("You are analyzing community reports") {
            MAP_RESPONSE.to_string()
        } else if prompt.starts_with("You are synthesizing a final answer") {
            REDUCE_RESPONSE.to_string()
        } else {
            "Alice and Bob work at Acme.".to_string()
        };
        Ok(Completion {
            text,
            stop_reason: StopReason::EndTurn,
        })
    }
}

/// Serves one canned extraction response in truncated windows, forcing the
/// gateway's continuation path; each window resends a 20-character tail
pub struct TruncatingProvider {
    full: String,
    window: usize,
    cursor: Mutex<usize>,
    pub calls: AtomicUsize,
}

impl TruncatingProvider {
    pub fn new(full: &str, window: usize) -> Self {
        Self {
            full: full.to_string(),
            window,
            cursor: Mutex::new(0),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmProvider for TruncatingProvider {
    async fn complete(&self, _prompt: &str) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut cursor = self.cursor.lock().unwrap();

        let overlap = 20;
        let start = cursor.saturating_sub(overlap);
        let end = (*cursor + self.window).min(self.full.len());
        let piece = self.full[start..end].to_string();
        *cursor = end;

        let stop_reason = if end < self.full.len() {
            StopReason::MaxTokens
        } else {
            StopReason::EndTurn
        };
        Ok(Completion {
            text: piece,
            stop_reason,
        })
    }
}

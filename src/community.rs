//! Community summarization
//!
//! For each detected community, the chunk texts mentioning its member
//! entities are concatenated and summarized through the gateway. The
//! `entity -> chunk texts` map comes from the extraction pass, so no second
//! extraction round is needed.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::llm::{extract_json, summary_prompt, LlmGateway};
use crate::store::{CommunityRecord, CommunitySummaryRecord};
use crate::Result;

#[derive(Debug, Deserialize)]
struct RawSummary {
    #[serde(default)]
    title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    key_entities: Vec<String>,
    occurrence: Option<f64>,
}

/// Generates one summary record per community with supporting text
pub struct CommunitySummarizer {
    gateway: LlmGateway,
}

impl CommunitySummarizer {
    #[must_use]
    pub fn new(gateway: LlmGateway) -> Self {
        Self { gateway }
    }

    /// Summarize every community that has supporting chunk text
    ///
    /// A community none of whose members appear in the chunk map produces no
    /// record. A summary whose JSON cannot be parsed is skipped with a
    /// warning; transport errors abort the run.
    ///
    /// # Errors
    ///
    /// Returns `Error::Provider` on transport failure.
    pub async fn summarize(
        &self,
        communities: &[CommunityRecord],
        entity_chunks: &HashMap<String, Vec<String>>,
    ) -> Result<Vec<CommunitySummaryRecord>> {
        let mut summaries = Vec::new();

        for community in communities {
            let mut parts: Vec<&str> = Vec::new();
            let mut supported_members = Vec::new();
            for name in &community.nodes {
                if let Some(texts) = entity_chunks.get(name) {
                    for text in texts {
                        if !parts.contains(&text.as_str()) {
                            parts.push(text);
                        }
                    }
                    supported_members.push(name.clone());
                }
            }
            if parts.is_empty() {
                debug!(
                    community = community.cluster_id,
                    level = community.level,
                    "no supporting text, skipped"
                );
                continue;
            }

            let combined = parts.join(" ");
            let prompt = summary_prompt(&combined);
            let response = self.gateway.complete_with_continuation(&prompt).await?;

            let Some(value) = extract_json(&response) else {
                warn!(
                    community = community.cluster_id,
                    "summary response unparseable, skipped"
                );
                continue;
            };
            let raw: RawSummary = match serde_json::from_value(value) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(community = community.cluster_id, error = %e, "summary JSON malformed, skipped");
                    continue;
                }
            };

            let key_entities = if raw.key_entities.is_empty() {
                supported_members
            } else {
                raw.key_entities
            };
            summaries.push(CommunitySummaryRecord {
                community_id: community.cluster_id,
                title: raw.title,
                summary: raw.summary,
                key_entities,
                occurrence: raw.occurrence.unwrap_or(1.0).max(0.0),
                rank: community.level,
            });
            debug!(
                community = community.cluster_id,
                level = community.level,
                "community summarized"
            );
        }

        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::llm::{Completion, LlmProvider, StopReason};

    struct ScriptedProvider {
        responses: Mutex<VecDeque<String>>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(&self, _prompt: &str) -> Result<Completion> {
            *self.calls.lock().unwrap() += 1;
            let text = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            Ok(Completion {
                text,
                stop_reason: StopReason::EndTurn,
            })
        }
    }

    fn summarizer(responses: Vec<&str>) -> (CommunitySummarizer, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider {
            responses: Mutex::new(responses.into_iter().map(ToString::to_string).collect()),
            calls: Mutex::new(0),
        });
        (
            CommunitySummarizer::new(LlmGateway::new(provider.clone(), 5)),
            provider,
        )
    }

    fn community(cluster_id: i64, level: i64, nodes: &[&str]) -> CommunityRecord {
        CommunityRecord {
            level,
            cluster_id,
            parent_cluster: -1,
            nodes: nodes.iter().map(ToString::to_string).collect(),
        }
    }

    #[tokio::test]
    async fn test_summary_fields_and_rank() {
        let (summarizer, _) = summarizer(vec![
            r#"[START_JSON]{"title": "Acme staff", "summary": "People at Acme",
               "key_entities": ["Alice", "Acme"], "occurrence": 2.0}[END_JSON]"#,
        ]);
        let mut chunks = HashMap::new();
        chunks.insert("Alice".to_string(), vec!["Alice works at Acme.".to_string()]);
        chunks.insert("Acme".to_string(), vec!["Alice works at Acme.".to_string()]);

        let summaries = summarizer
            .summarize(&[community(0, 1, &["Alice", "Acme"])], &chunks)
            .await
            .unwrap();

        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].community_id, 0);
        assert_eq!(summaries[0].title, "Acme staff");
        assert_eq!(summaries[0].rank, 1);
        assert!((summaries[0].occurrence - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_occurrence_defaults_to_one() {
        let (summarizer, _) = summarizer(vec![
            r#"[START_JSON]{"title": "t", "summary": "s", "key_entities": []}[END_JSON]"#,
        ]);
        let mut chunks = HashMap::new();
        chunks.insert("Alice".to_string(), vec!["text".to_string()]);

        let summaries = summarizer
            .summarize(&[community(3, 0, &["Alice"])], &chunks)
            .await
            .unwrap();

        assert!((summaries[0].occurrence - 1.0).abs() < f64::EPSILON);
        // Members with supporting text backfill an empty key_entities list
        assert_eq!(summaries[0].key_entities, vec!["Alice".to_string()]);
    }

    #[tokio::test]
    async fn test_unsupported_community_makes_no_llm_call() {
        let (summarizer, provider) = summarizer(vec![]);
        let summaries = summarizer
            .summarize(&[community(0, 0, &["Ghost"])], &HashMap::new())
            .await
            .unwrap();

        assert!(summaries.is_empty());
        assert_eq!(*provider.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_repeated_chunk_text_appears_once() {
        let (summarizer, _) = summarizer(vec![
            r#"[START_JSON]{"title": "t", "summary": "s"}[END_JSON]"#,
        ]);
        let shared = "Alice and Bob work at Acme.".to_string();
        let mut chunks = HashMap::new();
        chunks.insert("Alice".to_string(), vec![shared.clone()]);
        chunks.insert("Bob".to_string(), vec![shared]);

        // Both members point at the same chunk; the prompt should carry it once.
        // Indirectly verified through a successful single-summary run.
        let summaries = summarizer
            .summarize(&[community(0, 0, &["Alice", "Bob"])], &chunks)
            .await
            .unwrap();
        assert_eq!(summaries.len(), 1);
    }
}

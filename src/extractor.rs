//! Entity and relationship extraction from document chunks

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::chunking::Chunk;
use crate::llm::{extract_json, extraction_prompt, LlmGateway};
use crate::loader::hex_digest;
use crate::store::{EntityRecord, RelationshipRecord};
use crate::Result;

#[derive(Debug, Deserialize)]
struct RawEntity {
    name: String,
    #[serde(rename = "type", default)]
    entity_type: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct RawRelationship {
    source: String,
    target: String,
    #[serde(rename = "type", default)]
    rel_type: String,
    #[serde(default)]
    description: String,
    #[serde(default = "one")]
    weight: f64,
}

const fn one() -> f64 {
    1.0
}

#[derive(Debug, Default, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    relationships: Vec<RawRelationship>,
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hex_digest(&hasher.finalize());
    digest[..16].to_string()
}

/// Accumulates extraction output across chunks, deduplicating as it goes
///
/// Entities collapse on lowercased `(name, type)`, relationships on the full
/// tuple; first-seen order is preserved in both tables. The accumulator also
/// records which chunk texts mention each entity, which the community
/// builder later uses for summarization without a second extraction pass.
#[derive(Default)]
pub struct ExtractionAccumulator {
    entities: Vec<EntityRecord>,
    relationships: Vec<RelationshipRecord>,
    seen_entities: HashSet<String>,
    seen_relationships: HashSet<String>,
    entity_chunks: HashMap<String, Vec<String>>,
}

impl ExtractionAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, raw: RawExtraction, chunk: &Chunk) {
        for entity in raw.entities {
            if entity.name.trim().is_empty() {
                continue;
            }
            let key = EntityRecord::identity_key(&entity.name, &entity.entity_type);
            if self.seen_entities.insert(key.clone()) {
                self.entities.push(EntityRecord {
                    id: short_hash(&key),
                    name: entity.name.clone(),
                    entity_type: entity.entity_type,
                    description: entity.description,
                    attributes: BTreeMap::new(),
                });
            }
            let mentions = self.entity_chunks.entry(entity.name).or_default();
            if mentions.last() != Some(&chunk.text) {
                mentions.push(chunk.text.clone());
            }
        }

        for rel in raw.relationships {
            if rel.source.trim().is_empty() || rel.target.trim().is_empty() {
                continue;
            }
            let weight = rel.weight.max(0.0);
            let tuple = format!(
                "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
                rel.source, rel.target, rel.rel_type, rel.description, weight
            );
            if self.seen_relationships.insert(tuple.clone()) {
                self.relationships.push(RelationshipRecord {
                    id: short_hash(&tuple),
                    source: rel.source,
                    target: rel.target,
                    rel_type: rel.rel_type,
                    description: rel.description,
                    weight,
                });
            }
        }
    }

    #[must_use]
    pub fn entities(&self) -> &[EntityRecord] {
        &self.entities
    }

    #[must_use]
    pub fn relationships(&self) -> &[RelationshipRecord] {
        &self.relationships
    }

    /// Map from entity name to the chunk texts mentioning it
    #[must_use]
    pub fn entity_chunks(&self) -> &HashMap<String, Vec<String>> {
        &self.entity_chunks
    }

    #[must_use]
    pub fn into_parts(
        self,
    ) -> (
        Vec<EntityRecord>,
        Vec<RelationshipRecord>,
        HashMap<String, Vec<String>>,
    ) {
        (self.entities, self.relationships, self.entity_chunks)
    }
}

/// Runs the extraction prompt over chunks through the gateway
pub struct Extractor {
    gateway: LlmGateway,
}

impl Extractor {
    #[must_use]
    pub fn new(gateway: LlmGateway) -> Self {
        Self { gateway }
    }

    /// Extract one chunk into the accumulator
    ///
    /// A chunk whose response never becomes valid JSON contributes nothing;
    /// transport errors propagate.
    ///
    /// # Errors
    ///
    /// Returns `Error::Provider` on transport failure.
    pub async fn extract_chunk(
        &self,
        chunk: &Chunk,
        accumulator: &mut ExtractionAccumulator,
    ) -> Result<()> {
        let prompt = extraction_prompt(&chunk.text);
        let response = self.gateway.complete_with_continuation(&prompt).await?;

        let Some(value) = extract_json(&response) else {
            warn!(chunk = %chunk.chunk_id, "extraction response unparseable, chunk dropped");
            return Ok(());
        };
        let raw: RawExtraction = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(chunk = %chunk.chunk_id, error = %e, "extraction JSON malformed, chunk dropped");
                return Ok(());
            }
        };

        debug!(
            chunk = %chunk.chunk_id,
            entities = raw.entities.len(),
            relationships = raw.relationships.len(),
            "chunk extracted"
        );
        accumulator.add(raw, chunk);
        Ok(())
    }
}

//! LOCAL search: entity-anchored retrieval with relationship expansion

use tracing::{debug, info};

use crate::config::LocalSearchConfig;
use crate::llm::LlmGateway;
use crate::store::{ArtifactStore, EntityRecord};
use crate::vector::VectorStoreRole;
use crate::Result;

/// A retrieved entity with its hop distance from the query anchors
#[derive(Debug, Clone)]
pub struct RankedEntity {
    pub record: EntityRecord,
    /// 0 for entities matched by the index, 1+ for relationship expansion
    pub hop: usize,
    /// Vector similarity for hop-0 entities, 0.0 for expanded ones
    pub score: f32,
}

/// A supporting chunk of source text
#[derive(Debug, Clone)]
pub struct TextUnit {
    pub id: String,
    pub text: String,
    pub document_id: Option<String>,
    /// Entity names this unit was retrieved for
    pub entities: Vec<String>,
}

/// Result of one LOCAL search
#[derive(Debug, Clone)]
pub struct LocalSearchResult {
    pub response: String,
    pub entities: Vec<RankedEntity>,
    pub text_units: Vec<TextUnit>,
}

/// Entity-anchored retrieval over the entity and main indexes
pub struct LocalSearchEngine<'a> {
    store: &'a ArtifactStore,
    gateway: LlmGateway,
    config: LocalSearchConfig,
}

impl<'a> LocalSearchEngine<'a> {
    #[must_use]
    pub fn new(store: &'a ArtifactStore, gateway: LlmGateway, config: LocalSearchConfig) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    /// Retrieve entities and supporting text units without generating a
    /// response
    ///
    /// Anchors come from the entity index, expansion follows relationships
    /// breadth-first up to `max_hops` with visited-id cycle suppression, and
    /// text units are pulled from the main index for the top entities. A
    /// missing index yields an empty result, never an error.
    ///
    /// # Errors
    ///
    /// Returns `Error::Index` on embedding failure.
    pub async fn retrieve(&self, query: &str) -> Result<(Vec<RankedEntity>, Vec<TextUnit>)> {
        let entity_table = match self.store.vector_table(VectorStoreRole::Entity) {
            Ok(table) => table,
            Err(e) if e.is_not_found() => {
                debug!("entity index absent, local search returns empty");
                return Ok((Vec::new(), Vec::new()));
            }
            Err(e) => return Err(e),
        };

        let entity_records = self.store.load_entities()?;
        let by_id = |id: &str| entity_records.iter().find(|e| e.id == id);
        let by_name = |name: &str| entity_records.iter().find(|e| e.name == name);

        // Hop 0: vector anchors
        let hits = entity_table.query(query, self.config.entity_top_k).await?;
        let mut ranked: Vec<RankedEntity> = Vec::new();
        for hit in hits {
            let record = by_id(&hit.node.id).cloned().unwrap_or_else(|| EntityRecord {
                id: hit.node.id.clone(),
                name: hit.node.text.clone(),
                entity_type: hit
                    .node
                    .metadata
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                description: String::new(),
                attributes: std::collections::BTreeMap::new(),
            });
            ranked.push(RankedEntity {
                record,
                hop: 0,
                score: hit.score,
            });
        }

        // Hops 1..=max: relationship expansion, breadth-first
        let relationships = self.store.load_relationships()?;
        let mut visited: std::collections::HashSet<String> =
            ranked.iter().map(|e| e.record.id.clone()).collect();
        let mut frontier: Vec<String> = ranked.iter().map(|e| e.record.name.clone()).collect();

        for hop in 1..=self.config.max_hops {
            let mut next_frontier = Vec::new();
            for name in &frontier {
                for rel in &relationships {
                    let other = if &rel.source == name {
                        &rel.target
                    } else if &rel.target == name {
                        &rel.source
                    } else {
                        continue;
                    };
                    let Some(record) = by_name(other) else {
                        continue;
                    };
                    if visited.insert(record.id.clone()) {
                        next_frontier.push(record.name.clone());
                        ranked.push(RankedEntity {
                            record: record.clone(),
                            hop,
                            score: 0.0,
                        });
                    }
                }
            }
            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }

        // Supporting text units for the top entities
        let text_units = self.collect_text_units(&ranked).await?;

        info!(
            entities = ranked.len(),
            text_units = text_units.len(),
            "local retrieval done"
        );
        Ok((ranked, text_units))
    }

    async fn collect_text_units(&self, ranked: &[RankedEntity]) -> Result<Vec<TextUnit>> {
        let main_table = match self.store.vector_table(VectorStoreRole::Main) {
            Ok(table) => table,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut seen = std::collections::HashSet::new();
        let mut units = Vec::new();
        for entity in ranked.iter().take(self.config.top_entities) {
            let hits = main_table
                .query(&entity.record.name, self.config.text_unit_top_k)
                .await?;
            for hit in hits {
                if !seen.insert(hit.node.id.clone()) {
                    continue;
                }
                units.push(TextUnit {
                    id: hit.node.id.clone(),
                    text: hit.node.text.clone(),
                    document_id: hit
                        .node
                        .metadata
                        .get("document_id")
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string),
                    entities: vec![entity.record.name.clone()],
                });
            }
        }
        Ok(units)
    }

    /// Full LOCAL search: retrieve, then answer from the assembled context
    ///
    /// # Errors
    ///
    /// Returns `Error::Provider` when response generation fails.
    pub async fn search(&self, query: &str) -> Result<LocalSearchResult> {
        let (entities, text_units) = self.retrieve(query).await?;
        if entities.is_empty() {
            return Ok(LocalSearchResult {
                response: "No relevant information found for your query.".to_string(),
                entities,
                text_units,
            });
        }

        let prompt = local_search_prompt(query, &entities, &text_units);
        let response = self.gateway.complete(&prompt).await?;
        Ok(LocalSearchResult {
            response,
            entities,
            text_units,
        })
    }
}

fn local_search_prompt(query: &str, entities: &[RankedEntity], text_units: &[TextUnit]) -> String {
    let mut context = String::from("-----Entities-----\n");
    for entity in entities.iter().take(10) {
        context.push_str(&format!(
            "- {} ({}): {}\n",
            entity.record.name, entity.record.entity_type, entity.record.description
        ));
    }
    if !text_units.is_empty() {
        context.push_str("\n-----Source Text-----\n");
        for unit in text_units.iter().take(10) {
            context.push_str(&format!("- {}\n", unit.text));
        }
    }

    format!(
        "Answer the question using only the context below. Prefer concrete \
         facts tied to the listed entities; say so when the context does not \
         contain the answer.\n\n{context}\nQuestion: {query}\n\nAnswer:"
    )
}

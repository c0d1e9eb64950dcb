//! Ingestion orchestrator: one-shot index builds with dedup and idempotence
//!
//! Phase order matters for crash safety: every persisted phase is a safe
//! cut, and a re-run with no new content returns before any LLM call or
//! index write.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::community::CommunitySummarizer;
use crate::config::AppConfig;
use crate::embedding::Embedder;
use crate::extractor::{ExtractionAccumulator, Extractor};
use crate::graph::cluster_graph;
use crate::index::IndexBuilder;
use crate::llm::LlmGateway;
use crate::loader::{Document, DocumentLoader};
use crate::store::{ArtifactStore, ProcessedFileRecord};
use crate::Result;

/// Counters for one ingestion run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestionReport {
    pub new_documents: usize,
    pub chunks: usize,
    pub entities: usize,
    pub relationships: usize,
    pub communities: usize,
    pub summaries: usize,
}

/// Drives loader, extractor, community builder and index builder in order
pub struct IngestionPipeline {
    config: AppConfig,
    gateway: LlmGateway,
    store: ArtifactStore,
}

impl IngestionPipeline {
    #[must_use]
    pub fn new(config: AppConfig, gateway: LlmGateway, embedder: Arc<dyn Embedder>) -> Self {
        let store = ArtifactStore::new(config.output_dir.clone(), embedder);
        Self {
            config,
            gateway,
            store,
        }
    }

    #[must_use]
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Run one ingestion pass over the configured input directory
    ///
    /// # Errors
    ///
    /// Propagates loader, provider and index errors; tables persisted before
    /// the failure remain valid.
    pub async fn add_documents(&self) -> Result<IngestionReport> {
        info!(input = %self.config.input_dir, "adding documents");

        // 1. Known content hashes
        let mut processed = self.store.load_processed_files()?;
        let mut known: HashSet<String> =
            processed.iter().map(|r| r.content_hash.clone()).collect();

        // 2. Load and drop already-processed documents
        let loader = DocumentLoader::new(&self.config.ignore_patterns)?;
        let documents = loader.load_dir(Path::new(&self.config.input_dir))?;
        let mut new_documents: Vec<(Document, String)> = Vec::new();
        for doc in documents {
            let hash = doc.content_hash();
            if known.contains(&hash) {
                continue;
            }
            known.insert(hash.clone());
            new_documents.push((doc, hash));
        }

        if new_documents.is_empty() {
            info!("no new documents to add");
            return Ok(IngestionReport::default());
        }
        info!(count = new_documents.len(), "new documents found");

        // 3. Chunk, embed, write the main index
        let builder = IndexBuilder::new(&self.store, &self.config.chunking)?;
        let docs: Vec<Document> = new_documents.iter().map(|(d, _)| d.clone()).collect();
        let chunks = builder.chunk_documents(&docs)?;
        builder.write_main_index(&chunks).await?;

        // 4. Extract entities and relationships per chunk
        let extractor = Extractor::new(self.gateway.clone());
        let mut accumulator = ExtractionAccumulator::new();
        for (i, chunk) in chunks.iter().enumerate() {
            extractor.extract_chunk(chunk, &mut accumulator).await?;
            info!(chunk = i + 1, total = chunks.len(), "chunk processed");
        }
        let (new_entities, new_relationships, entity_chunks) = accumulator.into_parts();

        // 5. Persist merged entity and relationship tables
        let entities = {
            let mut merged = self.store.load_entities()?;
            let mut seen: HashSet<String> = merged
                .iter()
                .map(|e| crate::store::EntityRecord::identity_key(&e.name, &e.entity_type))
                .collect();
            for entity in new_entities {
                let key =
                    crate::store::EntityRecord::identity_key(&entity.name, &entity.entity_type);
                if seen.insert(key) {
                    merged.push(entity);
                }
            }
            self.store.save_entities(&merged)?;
            merged
        };

        let relationships = {
            let mut merged = self.store.load_relationships()?;
            let mut seen: HashSet<String> = merged.iter().map(|r| r.id.clone()).collect();
            for rel in new_relationships {
                if seen.insert(rel.id.clone()) {
                    merged.push(rel);
                }
            }
            self.store.save_relationships(&merged)?;
            merged
        };
        info!(
            entities = entities.len(),
            relationships = relationships.len(),
            "graph tables saved"
        );

        // 6. Community detection and summarization over the merged table
        let mut communities_count = 0;
        let mut summaries_count = 0;
        if relationships.is_empty() {
            info!("no relationships extracted, skipping community detection");
        } else {
            let communities = cluster_graph(&relationships, &self.config.community_detection);
            if communities.is_empty() {
                info!("no communities detected");
            } else {
                self.store.save_communities(&communities)?;
                communities_count = communities.len();

                let summarizer = CommunitySummarizer::new(self.gateway.clone());
                let new_summaries = summarizer.summarize(&communities, &entity_chunks).await?;

                // Keep prior summaries for communities not re-summarized in
                // this run, but only while their community still exists.
                let live: HashSet<i64> = communities.iter().map(|c| c.cluster_id).collect();
                let fresh: HashSet<i64> =
                    new_summaries.iter().map(|s| s.community_id).collect();
                let mut summaries = new_summaries;
                for old in self.store.load_community_summaries()? {
                    if live.contains(&old.community_id) && !fresh.contains(&old.community_id) {
                        summaries.push(old);
                    }
                }
                self.store.save_community_summaries(&summaries)?;
                summaries_count = summaries.len();

                builder.write_community_index(&summaries, &entities).await?;
            }
        }

        // 7. Entity index over the merged entity table
        builder.write_entity_index(&entities).await?;

        // 8. Record newly processed inputs
        for (doc, hash) in &new_documents {
            processed.push(ProcessedFileRecord {
                path: doc.source_path.clone(),
                content_hash: hash.clone(),
            });
        }
        self.store.save_processed_files(&processed)?;

        let report = IngestionReport {
            new_documents: new_documents.len(),
            chunks: chunks.len(),
            entities: entities.len(),
            relationships: relationships.len(),
            communities: communities_count,
            summaries: summaries_count,
        };
        if report.entities == 0 {
            warn!("run produced no entities; check extraction responses");
        }
        info!(?report, "documents processed");
        Ok(report)
    }
}

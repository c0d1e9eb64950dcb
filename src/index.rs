//! Index builder: chunking, embedding, and the three vector indexes

use serde_json::Value;
use tracing::info;

use crate::chunking::{Chunk, SentenceChunker};
use crate::config::ChunkingConfig;
use crate::loader::Document;
use crate::store::{ArtifactStore, CommunitySummaryRecord, EntityRecord};
use crate::vector::{VectorNode, VectorStoreRole};
use crate::Result;

/// Builds the *main*, *entity* and *community* vector indexes
pub struct IndexBuilder<'a> {
    store: &'a ArtifactStore,
    chunker: SentenceChunker,
}

impl<'a> IndexBuilder<'a> {
    /// # Errors
    ///
    /// Returns `Error::Config` for invalid chunking parameters.
    pub fn new(store: &'a ArtifactStore, chunking: &ChunkingConfig) -> Result<Self> {
        Ok(Self {
            store,
            chunker: SentenceChunker::new(chunking)?,
        })
    }

    /// Split documents into ordered chunks, keyed by document identity hash
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the splitter rejects its parameters.
    pub fn chunk_documents(&self, documents: &[Document]) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::new();
        for doc in documents {
            chunks.extend(self.chunker.chunk_document(&doc.content_hash(), &doc.text)?);
        }
        Ok(chunks)
    }

    /// Write one vector per chunk; vector text is the chunk text
    ///
    /// # Errors
    ///
    /// Returns `Error::Index` when embedding or the table write fails.
    pub async fn write_main_index(&self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let nodes = chunks
            .iter()
            .map(|chunk| {
                VectorNode::new(chunk.chunk_id.clone(), chunk.text.clone())
                    .with_metadata("document_id", chunk.document_id.clone())
                    .with_metadata("chunk_id", chunk.chunk_id.clone())
                    .with_metadata("position", chunk.position as u64)
            })
            .collect();
        let table = self.store.vector_table_mut(VectorStoreRole::Main)?;
        table.upsert(nodes).await?;
        info!(chunks = chunks.len(), "main index updated");
        Ok(())
    }

    /// Write one vector per entity; vector text is the entity name
    ///
    /// # Errors
    ///
    /// Returns `Error::Index` when embedding or the table write fails.
    pub async fn write_entity_index(&self, entities: &[EntityRecord]) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let nodes = entities
            .iter()
            .map(|entity| {
                let mut node = VectorNode::new(entity.id.clone(), entity.name.clone())
                    .with_metadata("entity_id", entity.id.clone())
                    .with_metadata("name", entity.name.clone())
                    .with_metadata("type", entity.entity_type.clone())
                    .with_metadata("description", entity.description.clone());
                for (key, value) in &entity.attributes {
                    node = node.with_metadata(key, value.clone());
                }
                node
            })
            .collect();
        let table = self.store.vector_table_mut(VectorStoreRole::Entity)?;
        table.upsert(nodes).await?;
        info!(entities = entities.len(), "entity index updated");
        Ok(())
    }

    /// Write one vector per community summary; vector text is the summary
    ///
    /// Entity ids of the key entities ride along as metadata so query-time
    /// traceability can name them.
    ///
    /// # Errors
    ///
    /// Returns `Error::Index` when embedding or the table write fails.
    pub async fn write_community_index(
        &self,
        summaries: &[CommunitySummaryRecord],
        entities: &[EntityRecord],
    ) -> Result<()> {
        if summaries.is_empty() {
            return Ok(());
        }
        let nodes = summaries
            .iter()
            .map(|summary| {
                let entity_ids: Vec<Value> = summary
                    .key_entities
                    .iter()
                    .filter_map(|name| {
                        entities
                            .iter()
                            .find(|e| &e.name == name)
                            .map(|e| Value::String(e.id.clone()))
                    })
                    .collect();
                VectorNode::new(summary.community_id.to_string(), summary.summary.clone())
                    .with_metadata("community_id", summary.community_id)
                    .with_metadata("title", summary.title.clone())
                    .with_metadata("rank", summary.rank)
                    .with_metadata("occurrence", summary.occurrence)
                    .with_metadata(
                        "key_entities",
                        Value::Array(
                            summary
                                .key_entities
                                .iter()
                                .map(|e| Value::String(e.clone()))
                                .collect(),
                        ),
                    )
                    .with_metadata("entity_ids", Value::Array(entity_ids))
            })
            .collect();
        let table = self.store.vector_table_mut(VectorStoreRole::Community)?;
        table.upsert(nodes).await?;
        info!(summaries = summaries.len(), "community index updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::embedding::Embedder;

    struct CountingEmbedder;

    impl Embedder for CountingEmbedder {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn doc(path: &str, text: &str) -> Document {
        Document {
            source_path: path.to_string(),
            text: text.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_main_index_has_one_vector_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), Arc::new(CountingEmbedder));
        let builder = IndexBuilder::new(&store, &ChunkingConfig::default()).unwrap();

        let docs = vec![doc("a.txt", "First text."), doc("b.txt", "Second text.")];
        let chunks = builder.chunk_documents(&docs).unwrap();
        builder.write_main_index(&chunks).await.unwrap();

        let table = store.vector_table(VectorStoreRole::Main).unwrap();
        assert_eq!(table.len(), chunks.len());
    }

    #[tokio::test]
    async fn test_entity_index_uses_name_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), Arc::new(CountingEmbedder));
        let builder = IndexBuilder::new(&store, &ChunkingConfig::default()).unwrap();

        let mut attributes = BTreeMap::new();
        attributes.insert("sector".to_string(), "tech".to_string());
        builder
            .write_entity_index(&[EntityRecord {
                id: "e1".to_string(),
                name: "Acme".to_string(),
                entity_type: "Organization".to_string(),
                description: "A company".to_string(),
                attributes,
            }])
            .await
            .unwrap();

        let table = store.vector_table(VectorStoreRole::Entity).unwrap();
        let hits = table.query("Acme", 1).await.unwrap();
        assert_eq!(hits[0].node.text, "Acme");
        assert_eq!(hits[0].node.metadata.get("type").unwrap(), "Organization");
        assert_eq!(hits[0].node.metadata.get("sector").unwrap(), "tech");
    }

    #[tokio::test]
    async fn test_empty_inputs_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), Arc::new(CountingEmbedder));
        let builder = IndexBuilder::new(&store, &ChunkingConfig::default()).unwrap();

        builder.write_entity_index(&[]).await.unwrap();
        builder.write_community_index(&[], &[]).await.unwrap();

        assert!(store.vector_table(VectorStoreRole::Entity).is_err());
        assert!(store.vector_table(VectorStoreRole::Community).is_err());
    }
}

//! Persisted vector tables with cosine similarity search
//!
//! One table per role (`main`, `entity`, `community`). A table owns its
//! embedder: `upsert` embeds node texts that arrive without a vector and
//! `query` embeds the query string. Persistence is a single JSON file per
//! table, replaced atomically on every write.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::embedding::Embedder;
use crate::store::atomic_write;
use crate::{Error, Result};

/// Role of a vector table within the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorStoreRole {
    /// One vector per chunk
    Main,
    /// One vector per entity
    Entity,
    /// One vector per community summary
    Community,
}

impl VectorStoreRole {
    #[must_use]
    pub const fn table_name(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Entity => "entity",
            Self::Community => "community",
        }
    }
}

/// One entry of a vector table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorNode {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    /// Filled in by the table when empty on upsert
    #[serde(default)]
    pub embedding: Vec<f32>,
}

impl VectorNode {
    #[must_use]
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: serde_json::Map::new(),
            embedding: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A node returned from a query, with its similarity score
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: VectorNode,
    pub score: f32,
}

/// A persisted vector table
pub struct VectorTable {
    path: PathBuf,
    embedder: Arc<dyn Embedder>,
    nodes: RwLock<Vec<VectorNode>>,
}

impl std::fmt::Debug for VectorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorTable").field("path", &self.path).finish_non_exhaustive()
    }
}

impl VectorTable {
    /// Open an existing table
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` when the table file does not exist; callers
    /// on the read path treat that as an empty result.
    pub fn from_existing(path: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "vector table '{}'",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(&path)?;
        let nodes: Vec<VectorNode> = serde_json::from_str(&raw)?;
        Ok(Self {
            path,
            embedder,
            nodes: RwLock::new(nodes),
        })
    }

    /// Open a table for writing, starting empty if it does not exist yet
    ///
    /// # Errors
    ///
    /// Returns `Error::Io`/`Error::Json` when an existing table file cannot
    /// be read.
    pub fn open_or_create(path: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let path = path.into();
        match Self::from_existing(path.clone(), embedder.clone()) {
            Ok(table) => Ok(table),
            Err(e) if e.is_not_found() => Ok(Self {
                path,
                embedder,
                nodes: RwLock::new(Vec::new()),
            }),
            Err(e) => Err(e),
        }
    }

    /// Insert or replace nodes by id, embedding texts that arrive without a
    /// vector, then persist the table atomically
    ///
    /// # Errors
    ///
    /// Returns `Error::Index` when embedding or the persisted write fails.
    pub async fn upsert(&self, mut incoming: Vec<VectorNode>) -> Result<()> {
        let to_embed: Vec<String> = incoming
            .iter()
            .filter(|n| n.embedding.is_empty())
            .map(|n| n.text.clone())
            .collect();
        if !to_embed.is_empty() {
            let vectors = self.embedder.embed(&to_embed)?;
            let mut it = vectors.into_iter();
            for node in incoming.iter_mut().filter(|n| n.embedding.is_empty()) {
                node.embedding = it.next().ok_or_else(|| {
                    Error::Index("embedder returned fewer vectors than texts".to_string())
                })?;
            }
        }

        let snapshot = {
            let mut nodes = self.nodes.write().expect("vector table lock poisoned");
            for node in incoming {
                if let Some(existing) = nodes.iter_mut().find(|n| n.id == node.id) {
                    *existing = node;
                } else {
                    nodes.push(node);
                }
            }
            nodes.clone()
        };

        let body = serde_json::to_vec(&snapshot)?;
        atomic_write(&self.path, &body)
            .map_err(|e| Error::Index(format!("vector table write failed: {e}")))?;
        debug!(table = %self.path.display(), nodes = snapshot.len(), "vector table persisted");
        Ok(())
    }

    /// Top-k nodes by cosine similarity to the query string
    ///
    /// Equal scores keep insertion order (the sort is stable).
    ///
    /// # Errors
    ///
    /// Returns `Error::Index` when the query embedding fails.
    pub async fn query(&self, query_str: &str, top_k: usize) -> Result<Vec<ScoredNode>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self
            .embedder
            .embed(std::slice::from_ref(&query_str.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Index("embedder returned no query vector".to_string()))?;

        let nodes = self.nodes.read().expect("vector table lock poisoned");
        let mut scored: Vec<ScoredNode> = nodes
            .iter()
            .map(|node| ScoredNode {
                score: cosine_similarity(&query_vec, &node.embedding),
                node: node.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.read().expect("vector table lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic embedder: hashes whitespace-split terms into buckets
    struct TermHashEmbedder;

    impl Embedder for TermHashEmbedder {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut v = vec![0.0f32; 16];
                    for term in text.to_lowercase().split_whitespace() {
                        let mut h = 0usize;
                        for b in term.bytes() {
                            h = h.wrapping_mul(31).wrapping_add(b as usize);
                        }
                        v[h % 16] += 1.0;
                    }
                    v
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            16
        }
    }

    fn temp_table(dir: &tempfile::TempDir) -> VectorTable {
        VectorTable::open_or_create(dir.path().join("main.json"), Arc::new(TermHashEmbedder))
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_query_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let table = temp_table(&dir);

        table
            .upsert(vec![
                VectorNode::new("1", "alice works at acme"),
                VectorNode::new("2", "weather in antarctica"),
            ])
            .await
            .unwrap();

        let hits = table.query("alice acme", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node.id, "1");
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let table = temp_table(&dir);

        table.upsert(vec![VectorNode::new("1", "old text")]).await.unwrap();
        table.upsert(vec![VectorNode::new("1", "new text")]).await.unwrap();

        assert_eq!(table.len(), 1);
        let hits = table.query("new text", 1).await.unwrap();
        assert_eq!(hits[0].node.text, "new text");
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entity.json");
        {
            let table =
                VectorTable::open_or_create(&path, Arc::new(TermHashEmbedder)).unwrap();
            table
                .upsert(vec![VectorNode::new("e1", "acme").with_metadata("type", "Organization")])
                .await
                .unwrap();
        }

        let reopened = VectorTable::from_existing(&path, Arc::new(TermHashEmbedder)).unwrap();
        assert_eq!(reopened.len(), 1);
        let hits = reopened.query("acme", 5).await.unwrap();
        assert_eq!(hits[0].node.metadata.get("type").unwrap(), "Organization");
    }

    #[test]
    fn test_missing_table_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = VectorTable::from_existing(dir.path().join("absent.json"), Arc::new(TermHashEmbedder))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}

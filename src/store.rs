//! Artifact store: the persisted tables and the vector-store handles
//!
//! The store exclusively owns everything under `output_dir`. Tables are
//! JSON-lines files replaced atomically (write to a temp file in the same
//! directory, then rename), so a failed save leaves the previous table
//! intact. The graph itself is never persisted; it is rebuilt in memory from
//! the relationship table when clustering.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embedding::Embedder;
use crate::vector::{VectorStoreRole, VectorTable};
use crate::Result;

/// Row of `processed_files`: suppresses re-ingesting unchanged inputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedFileRecord {
    pub path: String,
    pub content_hash: String,
}

/// Row of `entities`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl EntityRecord {
    /// Identity key: `(name, type)` lowercased
    #[must_use]
    pub fn identity_key(name: &str, entity_type: &str) -> String {
        format!("{}\u{1f}{}", name.to_lowercase(), entity_type.to_lowercase())
    }
}

/// Row of `relationships`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

const fn default_weight() -> f64 {
    1.0
}

/// Row of `communities`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityRecord {
    pub level: i64,
    pub cluster_id: i64,
    /// `-1` for roots
    pub parent_cluster: i64,
    pub nodes: Vec<String>,
}

/// Row of `community_summaries`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunitySummaryRecord {
    pub community_id: i64,
    #[serde(default)]
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub key_entities: Vec<String>,
    #[serde(default = "default_occurrence")]
    pub occurrence: f64,
    #[serde(default)]
    pub rank: i64,
}

const fn default_occurrence() -> f64 {
    1.0
}

/// Write `body` to `path` atomically (temp file + rename)
pub(crate) fn atomic_write(path: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(body)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Typed access to every persisted artifact under one output directory
pub struct ArtifactStore {
    output_dir: PathBuf,
    embedder: Arc<dyn Embedder>,
}

impl ArtifactStore {
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            output_dir: output_dir.into(),
            embedder,
        }
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{name}.jsonl"))
    }

    fn vector_path(&self, role: VectorStoreRole) -> PathBuf {
        self.output_dir
            .join("vector_store")
            .join(format!("{}.json", role.table_name()))
    }

    fn load_table<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let path = self.table_path(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)?;
        let mut rows = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            rows.push(serde_json::from_str(line)?);
        }
        Ok(rows)
    }

    fn save_table<T: Serialize>(&self, name: &str, rows: &[T]) -> Result<()> {
        let mut body = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut body, row)?;
            body.push(b'\n');
        }
        atomic_write(&self.table_path(name), &body)?;
        debug!(table = name, rows = rows.len(), "table saved");
        Ok(())
    }

    /// Load the processed-files table; absent means empty
    ///
    /// # Errors
    ///
    /// Returns `Error::Io`/`Error::Json` on a corrupt table.
    pub fn load_processed_files(&self) -> Result<Vec<ProcessedFileRecord>> {
        self.load_table("processed_files")
    }

    /// Replace the processed-files table
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` when the write fails; the old table stays intact.
    pub fn save_processed_files(&self, rows: &[ProcessedFileRecord]) -> Result<()> {
        self.save_table("processed_files", rows)
    }

    /// # Errors
    ///
    /// Returns `Error::Io`/`Error::Json` on a corrupt table.
    pub fn load_entities(&self) -> Result<Vec<EntityRecord>> {
        self.load_table("entities")
    }

    /// # Errors
    ///
    /// Returns `Error::Io` when the write fails; the old table stays intact.
    pub fn save_entities(&self, rows: &[EntityRecord]) -> Result<()> {
        self.save_table("entities", rows)
    }

    /// # Errors
    ///
    /// Returns `Error::Io`/`Error::Json` on a corrupt table.
    pub fn load_relationships(&self) -> Result<Vec<RelationshipRecord>> {
        self.load_table("relationships")
    }

    /// # Errors
    ///
    /// Returns `Error::Io` when the write fails; the old table stays intact.
    pub fn save_relationships(&self, rows: &[RelationshipRecord]) -> Result<()> {
        self.save_table("relationships", rows)
    }

    /// # Errors
    ///
    /// Returns `Error::Io`/`Error::Json` on a corrupt table.
    pub fn load_communities(&self) -> Result<Vec<CommunityRecord>> {
        self.load_table("communities")
    }

    /// # Errors
    ///
    /// Returns `Error::Io` when the write fails; the old table stays intact.
    pub fn save_communities(&self, rows: &[CommunityRecord]) -> Result<()> {
        self.save_table("communities", rows)
    }

    /// # Errors
    ///
    /// Returns `Error::Io`/`Error::Json` on a corrupt table.
    pub fn load_community_summaries(&self) -> Result<Vec<CommunitySummaryRecord>> {
        self.load_table("community_summaries")
    }

    /// # Errors
    ///
    /// Returns `Error::Io` when the write fails; the old table stays intact.
    pub fn save_community_summaries(&self, rows: &[CommunitySummaryRecord]) -> Result<()> {
        self.save_table("community_summaries", rows)
    }

    /// Open an existing vector table for reading
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` when the index has not been built; search
    /// components treat that as an empty result.
    pub fn vector_table(&self, role: VectorStoreRole) -> Result<VectorTable> {
        VectorTable::from_existing(self.vector_path(role), self.embedder.clone())
    }

    /// Open a vector table for writing, creating it when absent
    ///
    /// # Errors
    ///
    /// Returns `Error::Io`/`Error::Json` when an existing table is corrupt.
    pub fn vector_table_mut(&self, role: VectorStoreRole) -> Result<VectorTable> {
        VectorTable::open_or_create(self.vector_path(role), self.embedder.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    struct NullEmbedder;

    impl Embedder for NullEmbedder {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0]).collect())
        }

        fn dimension(&self) -> usize {
            1
        }
    }

    fn store(dir: &tempfile::TempDir) -> ArtifactStore {
        ArtifactStore::new(dir.path(), Arc::new(NullEmbedder))
    }

    #[test]
    fn test_missing_tables_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(store.load_entities().unwrap().is_empty());
        assert!(store.load_processed_files().unwrap().is_empty());
    }

    #[test]
    fn test_entity_table_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let rows = vec![EntityRecord {
            id: "e1".to_string(),
            name: "Alice".to_string(),
            entity_type: "Person".to_string(),
            description: String::new(),
            attributes: BTreeMap::new(),
        }];
        store.save_entities(&rows).unwrap();

        let loaded = store.load_entities().unwrap();
        assert_eq!(loaded, rows);
    }

    #[test]
    fn test_save_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let first = vec![ProcessedFileRecord {
            path: "a.txt".to_string(),
            content_hash: "h1".to_string(),
        }];
        store.save_processed_files(&first).unwrap();

        let second = vec![
            first[0].clone(),
            ProcessedFileRecord {
                path: "b.txt".to_string(),
                content_hash: "h2".to_string(),
            },
        ];
        store.save_processed_files(&second).unwrap();

        assert_eq!(store.load_processed_files().unwrap(), second);
        // No temp file left behind
        assert!(!dir.path().join("processed_files.tmp").exists());
    }

    #[test]
    fn test_identity_key_is_case_insensitive() {
        assert_eq!(
            EntityRecord::identity_key("Alice", "Person"),
            EntityRecord::identity_key("ALICE", "person")
        );
    }

    #[test]
    fn test_vector_table_not_found_for_readers() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let err = store.vector_table(VectorStoreRole::Entity).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_community_summary_defaults() {
        let json = r#"{"community_id": 3, "summary": "about acme"}"#;
        let row: CommunitySummaryRecord = serde_json::from_str(json).unwrap();
        assert!((row.occurrence - 1.0).abs() < f64::EPSILON);
        assert_eq!(row.rank, 0);
        assert!(row.key_entities.is_empty());
    }
}

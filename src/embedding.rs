//! Embedding interface and the local fastembed-backed implementation

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tracing::{info, warn};

use crate::{Error, Result};

/// Fixed-dimension text embedding
///
/// Implementations must return one vector per input text, all of the same
/// dimension.
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts
    ///
    /// # Errors
    ///
    /// Returns `Error::Index` when the model fails on the batch.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Dimension of the produced vectors
    fn dimension(&self) -> usize;
}

/// Local embedding models via fastembed
pub struct FastembedEmbedder {
    model: TextEmbedding,
    dimension: usize,
}

impl FastembedEmbedder {
    /// Load a local embedding model by name
    ///
    /// Unknown names fall back to the default multilingual model with a
    /// warning, so a typo degrades rather than aborts.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when the model cannot be initialized.
    pub fn new(name: &str) -> Result<Self> {
        let selected = select_model(name);
        let model = TextEmbedding::try_new(
            InitOptions::new(selected).with_show_download_progress(false),
        )
        .map_err(|e| Error::Config(format!("cannot initialize embedding model '{name}': {e}")))?;

        // Probe once to learn the dimension
        let probe = model
            .embed(vec!["dimension probe"], None)
            .map_err(|e| Error::Config(format!("embedding model '{name}' failed probe: {e}")))?;
        let dimension = probe.first().map_or(0, Vec::len);
        info!(model = name, dimension, "embedding model ready");

        Ok(Self { model, dimension })
    }
}

fn select_model(name: &str) -> EmbeddingModel {
    let lower = name.to_lowercase();
    if lower.contains("minilm") {
        EmbeddingModel::AllMiniLML6V2
    } else if lower.contains("bge-small") {
        EmbeddingModel::BGESmallENV15
    } else if lower.contains("e5") || lower.contains("multilingual") {
        EmbeddingModel::MultilingualE5Small
    } else {
        warn!(model = name, "unknown embedding model, using multilingual-e5-small");
        EmbeddingModel::MultilingualE5Small
    }
}

impl Embedder for FastembedEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.model
            .embed(texts.to_vec(), None)
            .map_err(|e| Error::Index(format!("embedding failed: {e}")))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
